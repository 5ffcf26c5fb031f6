//! # cullrs-core
//!
//! The near-duplicate detection engine behind cullrs: perceptual
//! fingerprinting, per-photo quality scoring, a persistent fingerprint
//! cache, a parallel batch scheduler, and threshold-based similarity
//! grouping with a suggested keeper per group.
//!
//! The crate is a library consumed by a host process. It performs no
//! file-dialog, export, or presentation work; callers hand it
//! [`RawPhotoInput`]s and receive a [`BatchOutcome`].

pub mod config;
pub mod core;
pub mod error;
pub mod services;

pub use crate::config::{recommended_concurrency, BatchOptions, EngineConfig, GroupingPolicy};
pub use crate::core::embedding::{cosine_distance, FeatureEmbedder, GridEmbedder, NoopEmbedder};
pub use crate::core::fingerprint::{Fingerprint, HashAlgorithm};
pub use crate::core::grouping::group_records;
pub use crate::core::quality::QualityMetrics;
pub use crate::core::record::{
    identity_from_path, BatchOutcome, BatchProgress, FilePixelSource, MemoryPixelSource,
    PhotoFailure, PhotoIdentity, PhotoRecord, PixelSource, ProcessingState, RawPhotoInput,
    SimilarityGroup,
};
pub use crate::error::EngineError;
pub use crate::services::cache::{CacheEntry, FingerprintCache};
pub use crate::services::intake::{collect_photo_inputs, IntakeOptions};
pub use crate::services::scheduler::{BatchScheduler, Engine};
