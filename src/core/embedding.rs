use image::imageops::FilterType;
use image::DynamicImage;
use std::sync::OnceLock;

use crate::error::EngineError;

/// Grid edge for the built-in descriptor (16x16 = 256 dimensions).
const GRID: u32 = 16;

/// A heavyweight, swappable capability: produces a dense numeric vector
/// from pixel data, consulted only for hash matches inside the ambiguous
/// refinement band. Implementations are loaded once and reused for the
/// life of the process; `ensure_loaded` failure degrades grouping to
/// hash-only similarity instead of blocking the batch.
///
/// Hosts with a learned model (ONNX, burn, a sidecar process) implement
/// this trait and inject it via `Engine::with_embedder`.
pub trait FeatureEmbedder: Send + Sync {
    fn name(&self) -> &'static str;

    /// Length of the vectors `embed` returns.
    fn dimension(&self) -> usize;

    /// Lazy one-time initialization. Called before the first `embed` of a
    /// batch; an error here means the capability is unavailable.
    fn ensure_loaded(&self) -> Result<(), EngineError>;

    fn embed(&self, image: &DynamicImage) -> Result<Vec<f32>, EngineError>;
}

/// Built-in embedder: a 16x16 zero-mean, L2-normalized luminance grid.
/// A coarse visual descriptor, cheap enough to run on every photo, that
/// separates pairs a 64-bit hash cannot.
#[derive(Debug, Default)]
pub struct GridEmbedder {
    loaded: OnceLock<()>,
}

impl GridEmbedder {
    pub fn new() -> Self {
        Self::default()
    }
}

impl FeatureEmbedder for GridEmbedder {
    fn name(&self) -> &'static str {
        "grid-luma-16"
    }

    fn dimension(&self) -> usize {
        (GRID * GRID) as usize
    }

    fn ensure_loaded(&self) -> Result<(), EngineError> {
        self.loaded.get_or_init(|| ());
        Ok(())
    }

    fn embed(&self, image: &DynamicImage) -> Result<Vec<f32>, EngineError> {
        let small = image.resize_exact(GRID, GRID, FilterType::Triangle).to_luma8();

        let mut vector: Vec<f32> = small.pixels().map(|p| f32::from(p[0])).collect();
        let mean = vector.iter().sum::<f32>() / vector.len() as f32;
        for v in vector.iter_mut() {
            *v -= mean;
        }

        let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > f32::EPSILON {
            for v in vector.iter_mut() {
                *v /= norm;
            }
        }
        // Zero-variance images stay the zero vector; cosine distance
        // against anything is then maximal, which is the conservative
        // answer for refinement.
        Ok(vector)
    }
}

/// Fallback embedder: always unavailable, selecting hash-only grouping.
#[derive(Debug, Default)]
pub struct NoopEmbedder;

impl FeatureEmbedder for NoopEmbedder {
    fn name(&self) -> &'static str {
        "noop"
    }

    fn dimension(&self) -> usize {
        0
    }

    fn ensure_loaded(&self) -> Result<(), EngineError> {
        Err(EngineError::ModelUnavailable(
            "no embedding model configured".into(),
        ))
    }

    fn embed(&self, _image: &DynamicImage) -> Result<Vec<f32>, EngineError> {
        Err(EngineError::ModelUnavailable(
            "no embedding model configured".into(),
        ))
    }
}

/// Cosine distance in [0, 2]. Degenerate inputs (zero vectors, mismatched
/// lengths) report maximal unit distance rather than panicking.
pub fn cosine_distance(a: &[f32], b: &[f32]) -> f64 {
    if a.len() != b.len() || a.is_empty() {
        return 1.0;
    }

    let mut dot = 0.0f64;
    let mut norm_a = 0.0f64;
    let mut norm_b = 0.0f64;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += f64::from(*x) * f64::from(*y);
        norm_a += f64::from(*x) * f64::from(*x);
        norm_b += f64::from(*y) * f64::from(*y);
    }

    if norm_a <= f64::EPSILON || norm_b <= f64::EPSILON {
        return 1.0;
    }
    1.0 - dot / (norm_a.sqrt() * norm_b.sqrt())
}
