//! Fixed-bound latency histograms.
//!
//! Buckets are defined by ascending lower bounds; a value lands in the
//! last bucket whose bound it reaches. The storage form reuses the
//! table codec with stringified bounds as labels, and always carries
//! every bucket (including zero counts) so decode restores the exact
//! bound layout.

use anyhow::{bail, Context, Result};

/// Histogram aggregate over a fixed ascending bound layout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistogramAggregate {
    bounds: Vec<i64>,
    counts: Vec<u64>,
}

impl HistogramAggregate {
    /// Builds an empty histogram. Bounds must be non-empty and strictly
    /// ascending.
    pub fn new(bounds: Vec<i64>) -> Result<Self> {
        if bounds.is_empty() {
            bail!("histogram needs at least one bound");
        }
        if bounds.windows(2).any(|w| w[0] >= w[1]) {
            bail!("histogram bounds must be strictly ascending: {bounds:?}");
        }
        let counts = vec![0; bounds.len()];
        Ok(Self { bounds, counts })
    }

    /// Builds a histogram holding a single observation.
    pub fn with_value(bounds: Vec<i64>, value: i64) -> Result<Self> {
        let mut histogram = Self::new(bounds)?;
        histogram.record(value);
        Ok(histogram)
    }

    /// Counts one observation. Values below the first bound clamp into
    /// the first bucket.
    pub fn record(&mut self, value: i64) {
        let index = self.bucket_index(value);
        self.counts[index] += 1;
    }

    /// Adds another histogram's counts. The bound layouts must match.
    pub fn merge(&mut self, other: &HistogramAggregate) -> Result<()> {
        if self.bounds != other.bounds {
            bail!(
                "histogram bound mismatch: {:?} vs {:?}",
                self.bounds,
                other.bounds
            );
        }
        for (count, add) in self.counts.iter_mut().zip(&other.counts) {
            *count += add;
        }
        Ok(())
    }

    pub fn total(&self) -> u64 {
        self.counts.iter().sum()
    }

    /// Lower bound of the bucket containing the p-th percentile
    /// observation, or `None` for an empty histogram.
    pub fn percentile(&self, p: u8) -> Option<i64> {
        let total = self.total();
        if total == 0 || p == 0 || p > 100 {
            return None;
        }
        let threshold = (total * p as u64).div_ceil(100);
        let mut seen = 0;
        for (bound, count) in self.bounds.iter().zip(&self.counts) {
            seen += count;
            if seen >= threshold {
                return Some(*bound);
            }
        }
        self.bounds.last().copied()
    }

    /// Encodes as `bound,count|bound,count` in ascending bound order.
    pub fn to_dataset(&self) -> String {
        let mut out = String::with_capacity(self.bounds.len() * 8);
        for (i, (bound, count)) in self.bounds.iter().zip(&self.counts).enumerate() {
            if i > 0 {
                out.push('|');
            }
            out.push_str(&bound.to_string());
            out.push(',');
            out.push_str(&count.to_string());
        }
        out
    }

    /// Decodes the dataset codec, restoring bound order numerically.
    pub fn from_dataset(text: &str) -> Result<Self> {
        let mut pairs = Vec::new();
        for pair in text.split('|') {
            let (bound, count) = pair
                .split_once(',')
                .with_context(|| format!("malformed histogram pair {pair:?}"))?;
            let bound: i64 = bound
                .parse()
                .with_context(|| format!("malformed histogram bound {bound:?}"))?;
            let count: u64 = count
                .parse()
                .with_context(|| format!("malformed histogram count {count:?}"))?;
            pairs.push((bound, count));
        }
        pairs.sort_by_key(|(bound, _)| *bound);
        let mut histogram = Self::new(pairs.iter().map(|(bound, _)| *bound).collect())?;
        for (i, (_, count)) in pairs.into_iter().enumerate() {
            histogram.counts[i] = count;
        }
        Ok(histogram)
    }

    fn bucket_index(&self, value: i64) -> usize {
        let mut index = 0;
        for (i, bound) in self.bounds.iter().enumerate() {
            if value >= *bound {
                index = i;
            } else {
                break;
            }
        }
        index
    }
}
