//! Label/value tables.
//!
//! A [`DataTable`] is the aggregate behind labelled counters such as
//! per-status-code call counts. It round-trips through the storage
//! text codec `label,value|label,value`, with labels emitted in sorted
//! order so the encoding of a given table is stable.

use std::collections::BTreeMap;

use anyhow::{bail, Context, Result};

/// Pair separator in the storage codec.
const PAIR_SEPARATOR: char = '|';
/// Label/value separator in the storage codec.
const FIELD_SEPARATOR: char = ',';

/// Sorted label -> accumulated value table.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DataTable {
    values: BTreeMap<String, i64>,
}

impl DataTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses the storage codec. The empty string decodes to an empty
    /// table; anything else must be well-formed pairs.
    pub fn from_storage(text: &str) -> Result<Self> {
        let mut values = BTreeMap::new();
        if text.is_empty() {
            return Ok(Self { values });
        }
        for pair in text.split(PAIR_SEPARATOR) {
            let (label, raw) = pair
                .split_once(FIELD_SEPARATOR)
                .with_context(|| format!("malformed table pair {pair:?}"))?;
            if label.is_empty() {
                bail!("empty label in table pair {pair:?}");
            }
            let value: i64 = raw
                .parse()
                .with_context(|| format!("malformed table value {raw:?} for label {label:?}"))?;
            *values.entry(label.to_string()).or_insert(0) += value;
        }
        Ok(Self { values })
    }

    /// Encodes to the storage codec, labels in sorted order.
    pub fn to_storage(&self) -> String {
        let mut out = String::with_capacity(self.values.len() * 8);
        for (i, (label, value)) in self.values.iter().enumerate() {
            if i > 0 {
                out.push(PAIR_SEPARATOR);
            }
            out.push_str(label);
            out.push(FIELD_SEPARATOR);
            out.push_str(&value.to_string());
        }
        out
    }

    /// Adds `delta` to the label, creating it at zero first if absent.
    pub fn accumulate(&mut self, label: &str, delta: i64) {
        match self.values.get_mut(label) {
            Some(value) => *value += delta,
            None => {
                self.values.insert(label.to_string(), delta);
            }
        }
    }

    /// Per-label sum of another table into this one.
    pub fn merge(&mut self, other: &DataTable) {
        for (label, value) in &other.values {
            self.accumulate(label, *value);
        }
    }

    pub fn get(&self, label: &str) -> Option<i64> {
        self.values.get(label).copied()
    }

    pub fn labels(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(String::as_str)
    }

    pub fn sum_of_values(&self) -> i64 {
        self.values.values().sum()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codec_round_trip() {
        let mut table = DataTable::new();
        table.accumulate("200", 7);
        table.accumulate("404", 2);
        table.accumulate("503", 1);
        let encoded = table.to_storage();
        assert_eq!(encoded, "200,7|404,2|503,1");
        assert_eq!(DataTable::from_storage(&encoded).unwrap(), table);
    }

    #[test]
    fn empty_table_encodes_to_empty_string() {
        let table = DataTable::new();
        assert_eq!(table.to_storage(), "");
        assert_eq!(DataTable::from_storage("").unwrap(), table);
    }

    #[test]
    fn merge_sums_per_label() {
        let mut left = DataTable::new();
        left.accumulate("200", 5);
        left.accumulate("500", 1);
        let mut right = DataTable::new();
        right.accumulate("200", 3);
        right.accumulate("404", 2);

        left.merge(&right);
        assert_eq!(left.get("200"), Some(8));
        assert_eq!(left.get("404"), Some(2));
        assert_eq!(left.get("500"), Some(1));
        assert_eq!(left.sum_of_values(), 11);
    }

    #[test]
    fn accumulate_handles_negative_deltas() {
        let mut table = DataTable::new();
        table.accumulate("inflight", 3);
        table.accumulate("inflight", -1);
        assert_eq!(table.get("inflight"), Some(2));
    }

    #[test]
    fn malformed_input_is_rejected() {
        assert!(DataTable::from_storage("200").is_err());
        assert!(DataTable::from_storage("200,x").is_err());
        assert!(DataTable::from_storage(",5").is_err());
        assert!(DataTable::from_storage("200,5|").is_err());
    }

    #[test]
    fn duplicate_labels_in_input_accumulate() {
        let table = DataTable::from_storage("200,5|200,3").unwrap();
        assert_eq!(table.get("200"), Some(8));
    }
}
