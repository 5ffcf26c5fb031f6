use image::DynamicImage;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

use crate::core::fingerprint::Fingerprint;
use crate::core::quality::QualityMetrics;
use crate::error::EngineError;

/// Stable identity of a photo file: path plus size and modification time,
/// optionally upgraded to a content digest. A cache entry keyed by this
/// identity is valid only while the identity is unchanged; staleness is
/// structural, never detected by re-reading content.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PhotoIdentity {
    pub path: PathBuf,
    pub file_size: u64,
    /// Modification time in milliseconds since the Unix epoch.
    pub modified_ms: i64,
    /// SHA-256 of the file contents, when the host computed one. Preferred
    /// as the cache key: byte-identical files then share an identity.
    pub content_digest: Option<String>,
}

impl PhotoIdentity {
    pub fn new(path: impl Into<PathBuf>, file_size: u64, modified: SystemTime) -> Self {
        let modified_ms = modified
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            .unwrap_or(0);
        Self {
            path: path.into(),
            file_size,
            modified_ms,
            content_digest: None,
        }
    }

    pub fn with_content_digest(mut self, digest: String) -> Self {
        self.content_digest = Some(digest);
        self
    }

    /// Stable string key for cache storage.
    pub fn cache_key(&self) -> String {
        match &self.content_digest {
            Some(digest) => format!("sha256:{digest}"),
            None => format!(
                "{}|{}|{}",
                self.path.to_string_lossy(),
                self.file_size,
                self.modified_ms
            ),
        }
    }

    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| self.path.to_string_lossy().to_string())
    }
}

/// Source of decoded pixels for one photo. The engine does not do format
/// conversion itself; exotic containers are decoded by external
/// collaborators and handed in as memory sources.
pub trait PixelSource: Send + Sync {
    fn decode(&self) -> Result<DynamicImage, EngineError>;
}

/// Decodes pixels from a file on demand via the `image` crate.
#[derive(Debug, Clone)]
pub struct FilePixelSource {
    path: PathBuf,
}

impl FilePixelSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl PixelSource for FilePixelSource {
    fn decode(&self) -> Result<DynamicImage, EngineError> {
        Ok(image::open(&self.path)?)
    }
}

/// Wraps an already-decoded pixel buffer.
#[derive(Debug, Clone)]
pub struct MemoryPixelSource {
    image: DynamicImage,
}

impl MemoryPixelSource {
    pub fn new(image: DynamicImage) -> Self {
        Self { image }
    }
}

impl PixelSource for MemoryPixelSource {
    fn decode(&self) -> Result<DynamicImage, EngineError> {
        Ok(self.image.clone())
    }
}

/// One photo handed to the engine by the host.
#[derive(Clone)]
pub struct RawPhotoInput {
    pub identity: PhotoIdentity,
    /// Known pixel dimensions, if the host has them. Filled in from the
    /// decoded image otherwise.
    pub dimensions: Option<(u32, u32)>,
    pub source: Arc<dyn PixelSource>,
}

impl RawPhotoInput {
    pub fn from_file(identity: PhotoIdentity) -> Self {
        let source = Arc::new(FilePixelSource::new(identity.path.clone()));
        Self {
            identity,
            dimensions: None,
            source,
        }
    }

    pub fn from_image(identity: PhotoIdentity, image: DynamicImage) -> Self {
        let dimensions = Some((image.width(), image.height()));
        Self {
            identity,
            dimensions,
            source: Arc::new(MemoryPixelSource::new(image)),
        }
    }

    pub fn with_source(identity: PhotoIdentity, source: Arc<dyn PixelSource>) -> Self {
        Self {
            identity,
            dimensions: None,
            source,
        }
    }
}

impl std::fmt::Debug for RawPhotoInput {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RawPhotoInput")
            .field("identity", &self.identity)
            .field("dimensions", &self.dimensions)
            .finish_non_exhaustive()
    }
}

/// Processing lifecycle of one record. `Failed` is terminal; everything
/// before `Done` is owned and advanced by the batch scheduler only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProcessingState {
    Pending,
    Decoding,
    Hashing,
    ScoringQuality,
    Embedding,
    Done,
    Failed,
}

/// Per-photo result record. Pixel buffers are transient worker state and
/// never stored here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhotoRecord {
    pub identity: PhotoIdentity,
    /// Position in the batch as submitted; the deterministic tie-break of
    /// last resort for keeper selection.
    pub insertion_index: usize,
    pub dimensions: Option<(u32, u32)>,
    pub fingerprint: Option<Fingerprint>,
    pub quality: Option<QualityMetrics>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub feature: Option<Vec<f32>>,
    pub state: ProcessingState,
}

impl PhotoRecord {
    pub fn pending(identity: PhotoIdentity, insertion_index: usize) -> Self {
        Self {
            identity,
            insertion_index,
            dimensions: None,
            fingerprint: None,
            quality: None,
            feature: None,
            state: ProcessingState::Pending,
        }
    }

    pub fn is_done(&self) -> bool {
        self.state == ProcessingState::Done
    }

    /// Pixel area used in keeper tie-breaks; unknown dimensions count as 0.
    pub fn pixel_area(&self) -> u64 {
        self.dimensions
            .map(|(w, h)| u64::from(w) * u64::from(h))
            .unwrap_or(0)
    }
}

/// A group of near-duplicate photos. Immutable once returned; re-running
/// grouping at another threshold produces new groups instead of mutating
/// these.
///
/// Members are identified by insertion index, which is unique within a
/// batch even when byte-identical files share a digest-keyed cache
/// identity; `BatchOutcome::records` is indexed by it directly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimilarityGroup {
    pub id: Uuid,
    /// Member insertion indices, in insertion (discovery) order.
    pub members: Vec<usize>,
    /// Insertion index of the suggested photo to keep.
    pub keeper: usize,
    /// Mean pairwise similarity percentage across all member pairs.
    pub mean_similarity: f64,
}

impl SimilarityGroup {
    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

/// A per-photo failure surfaced alongside successes; carries enough
/// identity and reason to be displayed meaningfully by the host.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhotoFailure {
    pub identity: PhotoIdentity,
    pub kind: String,
    pub reason: String,
}

impl PhotoFailure {
    pub fn new(identity: PhotoIdentity, error: &EngineError) -> Self {
        Self {
            identity,
            kind: error.kind().to_string(),
            reason: error.to_string(),
        }
    }
}

/// Final result of one batch run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchOutcome {
    pub records: Vec<PhotoRecord>,
    pub groups: Vec<SimilarityGroup>,
    pub failures: Vec<PhotoFailure>,
    /// True when embedding refinement was requested but the model failed
    /// to initialize and grouping fell back to hash-only similarity.
    pub refinement_degraded: bool,
    pub cancelled: bool,
}

/// Progress event emitted after each scheduler chunk completes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchProgress {
    pub processed_count: usize,
    pub total_count: usize,
    pub percent: f64,
}

impl BatchProgress {
    pub fn new(processed_count: usize, total_count: usize) -> Self {
        let percent = if total_count == 0 {
            100.0
        } else {
            processed_count as f64 * 100.0 / total_count as f64
        };
        Self {
            processed_count,
            total_count,
            percent,
        }
    }
}

/// Convenience for hosts building identities from files on disk.
pub fn identity_from_path(path: &Path) -> std::io::Result<PhotoIdentity> {
    let metadata = std::fs::metadata(path)?;
    let modified = metadata.modified().unwrap_or(UNIX_EPOCH);
    Ok(PhotoIdentity::new(path, metadata.len(), modified))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn identity(path: &str) -> PhotoIdentity {
        PhotoIdentity::new(path, 1024, UNIX_EPOCH + Duration::from_secs(1_700_000_000))
    }

    #[test]
    fn cache_key_uses_path_size_mtime() {
        let id = identity("/photos/a.jpg");
        assert_eq!(id.cache_key(), "/photos/a.jpg|1024|1700000000000");
    }

    #[test]
    fn cache_key_prefers_content_digest() {
        let id = identity("/photos/a.jpg").with_content_digest("abc123".into());
        assert_eq!(id.cache_key(), "sha256:abc123");
    }

    #[test]
    fn identical_content_shares_cache_key_across_paths() {
        let a = identity("/photos/a.jpg").with_content_digest("d00d".into());
        let b = identity("/photos/copy of a.jpg").with_content_digest("d00d".into());
        assert_eq!(a.cache_key(), b.cache_key());
    }

    #[test]
    fn progress_percent_handles_empty_batch() {
        assert_eq!(BatchProgress::new(0, 0).percent, 100.0);
        assert_eq!(BatchProgress::new(1, 4).percent, 25.0);
    }

    #[test]
    fn pixel_area_defaults_to_zero() {
        let mut record = PhotoRecord::pending(identity("/p.jpg"), 0);
        assert_eq!(record.pixel_area(), 0);
        record.dimensions = Some((200, 100));
        assert_eq!(record.pixel_area(), 20_000);
    }
}
