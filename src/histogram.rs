//! Per-partition skew detection.
//!
//! Two mutually exclusive modes, fixed for a run:
//! - static: membership in a precomputed `key -> count` table loaded from the
//!   partition's `.skew` side file;
//! - dynamic: a bounded space-saving sketch kept in descending count order.
//!
//! In dynamic mode a key is skewed once the samples it received since it
//! entered the sketch exceed `max(total_samples * ratio, 10)`. A key that just
//! replaced an evicted entry is never reported on that call.

use std::collections::HashMap;
use std::path::Path;

use crate::config::SkewConfig;
use crate::{Result, storage};

/// Lower bound on the skew threshold, so tiny samples never flag anything.
pub const MIN_SKEW_THRESHOLD: u64 = 10;

#[derive(Debug)]
pub struct SkewHistogram {
    mode: Mode,
}

#[derive(Debug)]
enum Mode {
    Static(HashMap<String, u64>),
    Dynamic(Sketch),
}

#[derive(Debug)]
struct Sketch {
    capacity: usize,
    ratio: f64,
    samples: u64,
    /// `(key, count)` sorted by descending count.
    entries: Vec<(String, u64)>,
    /// Position of each tracked key in `entries`.
    index: HashMap<String, usize>,
    /// Count a key started from when it (re)entered the sketch.
    baseline: HashMap<String, u64>,
}

impl SkewHistogram {
    pub fn dynamic(capacity: usize, ratio: f64) -> Self {
        debug_assert!(capacity > 0);
        Self {
            mode: Mode::Dynamic(Sketch {
                capacity,
                ratio,
                samples: 0,
                entries: Vec::with_capacity(capacity),
                index: HashMap::with_capacity(capacity),
                baseline: HashMap::with_capacity(capacity),
            }),
        }
    }

    pub fn from_static(skews: HashMap<String, u64>) -> Self {
        Self {
            mode: Mode::Static(skews),
        }
    }

    /// Histogram for the partition stored at `partition`.
    ///
    /// Static mode reads `<partition>.skew`.
    pub fn for_partition(config: &SkewConfig, partition: &Path) -> Result<Self> {
        if config.dynamic_detect {
            return Ok(Self::dynamic(
                config.histogram_capacity,
                config.frequency_threshold,
            ));
        }
        let skews = storage::read_skew_file(&storage::skew_path(partition))?;
        tracing::debug!(
            partition = %partition.display(),
            skew_keys = skews.len(),
            "dynamic detection off, loaded static skew keys"
        );
        Ok(Self::from_static(skews))
    }

    /// Record one occurrence of `key` and report whether it is skewed.
    pub fn sample(&mut self, key: &str) -> bool {
        match &mut self.mode {
            Mode::Static(skews) => skews.contains_key(key),
            Mode::Dynamic(sketch) => sketch.sample(key),
        }
    }

    pub fn is_dynamic(&self) -> bool {
        matches!(self.mode, Mode::Dynamic(_))
    }

    /// Number of keys currently tracked.
    pub fn len(&self) -> usize {
        match &self.mode {
            Mode::Static(skews) => skews.len(),
            Mode::Dynamic(sketch) => sketch.entries.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Current skew threshold; `None` in static mode.
    pub fn threshold(&self) -> Option<u64> {
        match &self.mode {
            Mode::Static(_) => None,
            Mode::Dynamic(sketch) => Some(sketch.threshold()),
        }
    }

    /// Tracked `(key, count)` pairs, heaviest first. Empty in static mode.
    pub fn heavy_hitters(&self) -> &[(String, u64)] {
        match &self.mode {
            Mode::Static(_) => &[],
            Mode::Dynamic(sketch) => &sketch.entries,
        }
    }
}

impl Sketch {
    fn threshold(&self) -> u64 {
        ((self.samples as f64 * self.ratio) as u64).max(MIN_SKEW_THRESHOLD)
    }

    fn sample(&mut self, key: &str) -> bool {
        self.samples += 1;
        let threshold = self.threshold();

        if let Some(&idx) = self.index.get(key) {
            self.entries[idx].1 += 1;
            let idx = self.sift_up(idx);
            let since = self.entries[idx].1 - self.baseline.get(key).copied().unwrap_or(0);
            return since > threshold;
        }

        if self.entries.len() < self.capacity {
            self.entries.push((key.to_string(), 1));
            self.index.insert(key.to_string(), self.entries.len() - 1);
            self.baseline.insert(key.to_string(), 1);
            return false;
        }

        // Replace the lightest entry and inherit its count.
        let tail = self.entries.len() - 1;
        let (evicted, count) = std::mem::replace(&mut self.entries[tail], (key.to_string(), 0));
        self.index.remove(&evicted);
        self.baseline.remove(&evicted);
        self.entries[tail].1 = count + 1;
        self.index.insert(key.to_string(), tail);
        self.baseline.insert(key.to_string(), count);
        self.sift_up(tail);
        false
    }

    /// Bubble `idx` toward the front while its count is at least its
    /// predecessor's. Returns the final position.
    fn sift_up(&mut self, mut idx: usize) -> usize {
        while idx > 0 && self.entries[idx].1 >= self.entries[idx - 1].1 {
            self.entries.swap(idx, idx - 1);
            self.index.insert(self.entries[idx].0.clone(), idx);
            self.index.insert(self.entries[idx - 1].0.clone(), idx - 1);
            idx -= 1;
        }
        idx
    }
}

#[cfg(test)]
mod tests {
    use rand::prelude::*;
    use rand_chacha::ChaCha8Rng;

    use super::*;

    fn sketch(h: &SkewHistogram) -> &Sketch {
        match &h.mode {
            Mode::Dynamic(sketch) => sketch,
            Mode::Static(_) => panic!("not dynamic"),
        }
    }

    fn assert_consistent(h: &SkewHistogram) {
        let s = sketch(h);
        assert!(s.entries.len() <= s.capacity);
        assert_eq!(s.index.len(), s.entries.len());
        assert_eq!(s.baseline.len(), s.entries.len());
        for w in s.entries.windows(2) {
            assert!(w[0].1 >= w[1].1, "not descending: {w:?}");
        }
        for (pos, (key, _)) in s.entries.iter().enumerate() {
            assert_eq!(s.index[key], pos);
        }
    }

    #[test]
    fn static_mode_is_pure_lookup() {
        let mut h = SkewHistogram::from_static(HashMap::from([("hot".to_string(), 500)]));
        for _ in 0..3 {
            assert!(h.sample("hot"));
            assert!(!h.sample("cold"));
        }
        assert!(!h.is_dynamic());
        assert_eq!(h.threshold(), None);
    }

    #[test]
    fn flags_after_minimum_threshold() {
        let mut h = SkewHistogram::dynamic(8, 0.01);
        // First occurrence inserts with baseline 1; ten more reach count 11,
        // i.e. 10 since insertion, which is not above the minimum threshold.
        assert!(!h.sample("k"));
        for _ in 0..10 {
            assert!(!h.sample("k"));
        }
        assert!(h.sample("k"));
        assert_consistent(&h);
    }

    #[test]
    fn threshold_scales_with_samples() {
        let mut h = SkewHistogram::dynamic(4, 0.5);
        for i in 0..100 {
            h.sample(&format!("noise{}", i % 3));
        }
        assert_eq!(h.threshold(), Some(50));
    }

    #[test]
    fn capacity_is_never_exceeded() {
        let mut h = SkewHistogram::dynamic(16, 0.01);
        let mut rng = ChaCha8Rng::seed_from_u64(7);
        for _ in 0..20_000 {
            let key = if rng.random_range(0..10u32) < 3 {
                "hot".to_string()
            } else {
                rng.random_range(0..1_000u32).to_string()
            };
            h.sample(&key);
            assert!(h.len() <= 16);
        }
        assert_consistent(&h);
        assert_eq!(h.heavy_hitters()[0].0, "hot");
    }

    #[test]
    fn substituted_key_is_not_flagged_immediately() {
        let mut h = SkewHistogram::dynamic(1, 0.01);
        for _ in 0..50 {
            h.sample("a");
        }
        // "b" replaces "a" and inherits its count, but only its own samples count.
        assert!(!h.sample("b"));
        assert_eq!(h.heavy_hitters()[0], ("b".to_string(), 51));
        for _ in 0..9 {
            assert!(!h.sample("b"));
        }
        assert!(h.sample("b"));
    }

    #[test]
    fn ordering_holds_under_random_stream() {
        let mut rng = ChaCha8Rng::seed_from_u64(42);
        let mut h = SkewHistogram::dynamic(32, 0.02);
        for _ in 0..5_000 {
            let key = rng.random_range(0..64u32).to_string();
            h.sample(&key);
            assert_consistent(&h);
        }
    }

    #[test]
    fn persistent_hot_key_is_reported() {
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        let mut h = SkewHistogram::dynamic(100, 0.01);
        let mut flagged = 0;
        for i in 0..10_000 {
            if i % 5 == 0 {
                flagged += h.sample("222320") as usize;
            } else {
                h.sample(&rng.random_range(0..10_000_000u32).to_string());
            }
        }
        assert!(flagged > 1_500);
    }
}
