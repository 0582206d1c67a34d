//! In-process record of what each physical unit's schema looks like.
//!
//! The registry exists to make schema reconciliation cheap: writers and
//! the schema manager consult an immutable snapshot per unit instead of
//! querying the backend, and only units whose diff is non-empty cause a
//! storage round trip. Updates swap in a new snapshot, so readers never
//! block behind a merge.

use std::sync::Arc;

use arc_swap::ArcSwap;
use dashmap::DashMap;

use super::model::ColumnSet;

/// Tracks the believed column set of every known unit.
#[derive(Default)]
pub struct SchemaRegistry {
    units: DashMap<String, Arc<ArcSwap<ColumnSet>>>,
}

impl SchemaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Unions a candidate column set into the unit's record, creating
    /// the record if this is the first sighting. On a kind conflict the
    /// candidate wins, matching the store's last-write semantics.
    pub fn merge(&self, unit: &str, candidate: &ColumnSet) {
        let slot = self
            .units
            .entry(unit.to_string())
            .or_insert_with(|| Arc::new(ArcSwap::from_pointee(ColumnSet::new())))
            .clone();
        slot.rcu(|current| {
            let mut next = ColumnSet::clone(current);
            for (name, kind) in candidate {
                next.insert(name.clone(), *kind);
            }
            next
        });
    }

    /// Columns present in the candidate but not yet recorded for this
    /// unit. An untracked unit diffs to the whole candidate.
    pub fn diff(&self, unit: &str, candidate: &ColumnSet) -> ColumnSet {
        let Some(recorded) = self.snapshot(unit) else {
            return candidate.clone();
        };
        candidate
            .iter()
            .filter(|(name, _)| !recorded.contains_key(*name))
            .map(|(name, kind)| (name.clone(), *kind))
            .collect()
    }

    /// Whether every candidate column is recorded for the unit.
    /// Presence is by name; kinds are reconciled at merge time.
    pub fn contains(&self, unit: &str, candidate: &ColumnSet) -> bool {
        let Some(recorded) = self.snapshot(unit) else {
            return candidate.is_empty();
        };
        candidate.keys().all(|name| recorded.contains_key(name))
    }

    /// Immutable snapshot of a unit's recorded columns.
    pub fn snapshot(&self, unit: &str) -> Option<Arc<ColumnSet>> {
        self.units.get(unit).map(|slot| slot.load_full())
    }

    /// Drops a unit's record, e.g. after the unit is deleted.
    pub fn forget(&self, unit: &str) {
        self.units.remove(unit);
    }

    pub fn tracked_units(&self) -> usize {
        self.units.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::model::ColumnKind;

    fn columns(names: &[&str]) -> ColumnSet {
        names.iter().map(|n| (n.to_string(), ColumnKind::Long)).collect()
    }

    #[test]
    fn diff_returns_candidate_minus_recorded() {
        let registry = SchemaRegistry::new();
        registry.merge("u-20240117", &columns(&["a", "c"]));

        let missing = registry.diff("u-20240117", &columns(&["a", "b"]));
        assert_eq!(missing, columns(&["b"]));
    }

    #[test]
    fn contains_tracks_merge_progress() {
        let registry = SchemaRegistry::new();
        registry.merge("u-20240117", &columns(&["a", "c"]));

        assert!(registry.contains("u-20240117", &columns(&["a", "c"])));
        assert!(registry.contains("u-20240117", &columns(&["a"])));
        assert!(!registry.contains("u-20240117", &columns(&["a", "b"])));

        registry.merge("u-20240117", &columns(&["b"]));
        assert!(registry.contains("u-20240117", &columns(&["a", "b"])));
        assert!(registry.diff("u-20240117", &columns(&["a", "b"])).is_empty());
    }

    #[test]
    fn untracked_units_diff_to_everything() {
        let registry = SchemaRegistry::new();
        let candidate = columns(&["a", "b"]);
        assert_eq!(registry.diff("ghost", &candidate), candidate);
        assert!(!registry.contains("ghost", &candidate));
        // The empty candidate is vacuously contained.
        assert!(registry.contains("ghost", &ColumnSet::new()));
    }

    #[test]
    fn kind_conflicts_resolve_to_the_latest_merge() {
        let registry = SchemaRegistry::new();
        let mut first = ColumnSet::new();
        first.insert("x".to_string(), ColumnKind::Long);
        registry.merge("u", &first);

        let mut second = ColumnSet::new();
        second.insert("x".to_string(), ColumnKind::Text);
        registry.merge("u", &second);

        let snapshot = registry.snapshot("u").unwrap();
        assert_eq!(snapshot.get("x"), Some(&ColumnKind::Text));
    }

    #[test]
    fn forget_untracks_the_unit() {
        let registry = SchemaRegistry::new();
        registry.merge("u", &columns(&["a"]));
        assert_eq!(registry.tracked_units(), 1);
        registry.forget("u");
        assert_eq!(registry.tracked_units(), 0);
        assert!(registry.snapshot("u").is_none());
    }

    #[test]
    fn concurrent_merges_union() {
        let registry = std::sync::Arc::new(SchemaRegistry::new());
        let mut handles = Vec::new();
        for i in 0..8 {
            let registry = std::sync::Arc::clone(&registry);
            handles.push(std::thread::spawn(move || {
                registry.merge("u", &columns(&[&format!("col_{i}")]));
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        let snapshot = registry.snapshot("u").unwrap();
        assert_eq!(snapshot.len(), 8);
    }
}
