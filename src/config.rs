use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::core::fingerprint::HashAlgorithm;

/// Smallest worker pool the scheduler will run with.
pub const MIN_WORKERS: usize = 2;
/// Largest worker pool the scheduler will run with; decode buffers are the
/// dominant memory cost and more units than this rarely help on photo IO.
pub const MAX_WORKERS: usize = 8;

/// Map reported hardware concurrency to a worker pool size.
///
/// Pure so hosts and tests can reason about sizing without touching the
/// environment; `EngineConfig::default` feeds it `num_cpus::get()`.
pub fn recommended_concurrency(reported_core_count: usize) -> usize {
    reported_core_count.clamp(MIN_WORKERS, MAX_WORKERS)
}

/// Engine-wide tunables. One of these lives for the life of an [`Engine`]
/// and applies to every batch it runs.
///
/// [`Engine`]: crate::services::scheduler::Engine
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Perceptual hash algorithm for the fingerprint codec.
    pub hash_algorithm: HashAlgorithm,
    /// Photos per scheduler chunk; only one chunk's decoded pixel buffers
    /// are alive at a time.
    pub chunk_size: usize,
    /// Worker pool size. Defaults to `recommended_concurrency(num_cpus)`.
    pub worker_count: usize,
    /// Budget for a single decode/hash/score/embed unit of work.
    #[serde(with = "duration_ms")]
    pub task_timeout: Duration,
    /// Grouping policy defaults; the per-batch threshold overrides
    /// `GroupingPolicy::threshold`.
    pub grouping: GroupingPolicy,
    /// Entry-count ceiling applied by `FingerprintCache::evict_over_capacity`.
    pub cache_max_entries: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            hash_algorithm: HashAlgorithm::Mean,
            chunk_size: 64,
            worker_count: recommended_concurrency(num_cpus::get()),
            task_timeout: Duration::from_secs(30),
            grouping: GroupingPolicy::default(),
            cache_max_entries: 100_000,
        }
    }
}

/// Tunables for the similarity grouping engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupingPolicy {
    /// Similarity percentage at or above which two photos join a group.
    pub threshold: f64,
    /// Batch sizes at or below this are compared all-pairs; larger batches
    /// go through locality-sensitive banding. The right cutover depends on
    /// hash length and hardware, so it is configuration, not a constant.
    pub direct_compare_cutoff: usize,
    /// Hash-similarity band (inclusive low, exclusive high) in which a
    /// pair is ambiguous enough to consult feature embeddings. Absolute,
    /// not anchored to `threshold`: pair scores must stay
    /// threshold-independent for regrouping to be monotone.
    pub refine_band: (f64, f64),
}

impl Default for GroupingPolicy {
    fn default() -> Self {
        Self {
            threshold: 92.0,
            direct_compare_cutoff: 500,
            refine_band: (80.0, 95.0),
        }
    }
}

/// Per-batch options supplied by the host for one `process_batch` call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchOptions {
    /// Similarity threshold in percent, valid range 50–100. Out-of-range
    /// values are clamped with a warning.
    pub similarity_threshold: u8,
    /// Compute feature vectors and refine ambiguous hash matches.
    pub enable_embedding_refinement: bool,
    /// Override the engine's worker pool size for this batch.
    pub worker_count: Option<usize>,
}

impl Default for BatchOptions {
    fn default() -> Self {
        Self {
            similarity_threshold: 92,
            enable_embedding_refinement: false,
            worker_count: None,
        }
    }
}

impl BatchOptions {
    /// Threshold as a percentage, clamped into the supported 50–100 range.
    pub fn clamped_threshold(&self) -> f64 {
        if !(50..=100).contains(&self.similarity_threshold) {
            log::warn!(
                "similarity threshold {} outside 50-100, clamping",
                self.similarity_threshold
            );
        }
        f64::from(self.similarity_threshold.clamp(50, 100))
    }
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        (d.as_millis() as u64).serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn concurrency_has_floor_and_ceiling() {
        assert_eq!(recommended_concurrency(0), MIN_WORKERS);
        assert_eq!(recommended_concurrency(1), MIN_WORKERS);
        assert_eq!(recommended_concurrency(4), 4);
        assert_eq!(recommended_concurrency(64), MAX_WORKERS);
    }

    #[test]
    fn threshold_clamps_into_range() {
        let low = BatchOptions {
            similarity_threshold: 10,
            ..Default::default()
        };
        assert_eq!(low.clamped_threshold(), 50.0);

        let ok = BatchOptions {
            similarity_threshold: 95,
            ..Default::default()
        };
        assert_eq!(ok.clamped_threshold(), 95.0);
    }

    #[test]
    fn config_round_trips_through_json() {
        let config = EngineConfig::default();
        let json = serde_json::to_string(&config).unwrap();
        let back: EngineConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.chunk_size, config.chunk_size);
        assert_eq!(back.task_timeout, config.task_timeout);
        assert_eq!(back.grouping.threshold, config.grouping.threshold);
    }
}
