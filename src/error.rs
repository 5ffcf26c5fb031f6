use std::time::Duration;
use thiserror::Error;

/// Engine-wide error taxonomy. Every variant is recoverable at the batch
/// level: per-photo errors mark that record `Failed` and the batch
/// continues.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("image decode failed: {0}")]
    Decode(#[from] image::ImageError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("unit of work exceeded its {0:?} budget")]
    Timeout(Duration),

    #[error("embedding model unavailable: {0}")]
    ModelUnavailable(String),

    #[error("cache IO error: {0}")]
    CacheIo(#[from] sled::Error),

    #[error("cache entry malformed: {0}")]
    CacheCodec(#[from] serde_json::Error),
}

impl EngineError {
    /// Short machine-friendly tag used when reporting failures to hosts.
    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::Decode(_) => "decode",
            EngineError::Io(_) => "io",
            EngineError::Timeout(_) => "timeout",
            EngineError::ModelUnavailable(_) => "model_unavailable",
            EngineError::CacheIo(_) => "cache_io",
            EngineError::CacheCodec(_) => "cache_codec",
        }
    }
}
