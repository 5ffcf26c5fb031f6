use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::timeout;

use crate::config::{recommended_concurrency, BatchOptions, EngineConfig, GroupingPolicy};
use crate::core::embedding::{FeatureEmbedder, GridEmbedder};
use crate::core::fingerprint::{Fingerprint, HashAlgorithm};
use crate::core::grouping::group_records;
use crate::core::quality::{score_image, QualityMetrics};
use crate::core::record::{
    BatchOutcome, BatchProgress, PhotoFailure, PhotoRecord, PixelSource, ProcessingState,
    RawPhotoInput, SimilarityGroup,
};
use crate::error::EngineError;
use crate::services::cache::{CacheEntry, FingerprintCache};

/// Result of one worker unit, returned by value through its join handle.
struct WorkerOutput {
    dimensions: (u32, u32),
    fingerprint: Fingerprint,
    quality: QualityMetrics,
    feature: Option<Vec<f32>>,
}

/// The decode/hash/score/embed pipeline for one photo. Runs on a blocking
/// worker; the decoded pixel buffer lives only for the duration of this
/// call. Embedding failure degrades to a hash-only record rather than
/// failing the photo.
fn run_photo_pipeline(
    source: &dyn PixelSource,
    algorithm: HashAlgorithm,
    embedder: Option<&dyn FeatureEmbedder>,
) -> Result<WorkerOutput, EngineError> {
    let image = source.decode()?;
    let dimensions = (image.width(), image.height());
    let fingerprint = Fingerprint::from_image(&image, algorithm);
    let quality = score_image(&image);
    let feature = embedder.and_then(|e| match e.embed(&image) {
        Ok(vector) => Some(vector),
        Err(err) => {
            log::warn!("embedding failed, record continues hash-only: {err}");
            None
        }
    });

    Ok(WorkerOutput {
        dimensions,
        fingerprint,
        quality,
        feature,
    })
}

/// Drives a batch of photos through the processing pipeline: consults the
/// fingerprint cache, fans misses out across a bounded pool of isolated
/// blocking workers, reports progress after each chunk, and supports
/// cooperative cancellation.
///
/// One scheduler instance runs one batch; nothing is retained afterwards.
pub struct BatchScheduler {
    config: EngineConfig,
    cache: Arc<FingerprintCache>,
    embedder: Arc<dyn FeatureEmbedder>,
    progress_sender: Option<mpsc::UnboundedSender<BatchProgress>>,
    cancellation: Arc<AtomicBool>,
}

impl BatchScheduler {
    pub fn new(
        config: EngineConfig,
        cache: Arc<FingerprintCache>,
        embedder: Arc<dyn FeatureEmbedder>,
    ) -> Self {
        Self {
            config,
            cache,
            embedder,
            progress_sender: None,
            cancellation: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn with_progress_sender(mut self, sender: mpsc::UnboundedSender<BatchProgress>) -> Self {
        self.progress_sender = Some(sender);
        self
    }

    /// Flag read cooperatively between chunks and before each dispatch.
    /// In-flight units are allowed to finish; no new work starts.
    pub fn cancellation_token(&self) -> Arc<AtomicBool> {
        self.cancellation.clone()
    }

    pub fn cancel(&self) {
        self.cancellation.store(true, Ordering::Relaxed);
    }

    fn is_cancelled(&self) -> bool {
        self.cancellation.load(Ordering::Relaxed)
    }

    fn send_progress(&self, processed: usize, total: usize) {
        if let Some(sender) = &self.progress_sender {
            let _ = sender.send(BatchProgress::new(processed, total));
        }
    }

    /// Process a batch to completion (or cancellation) and return the
    /// outcome. Per-photo failures never abort the batch; a cancelled
    /// batch returns the partial outcome with untouched records still
    /// `Pending`.
    pub async fn process(&self, inputs: Vec<RawPhotoInput>, options: &BatchOptions) -> BatchOutcome {
        let total = inputs.len();
        let workers = recommended_concurrency(
            options.worker_count.unwrap_or(self.config.worker_count),
        );

        // Embedding refinement degrades gracefully when the model cannot
        // initialize; the batch proceeds hash-only and says so.
        let mut refinement_degraded = false;
        let embed = options.enable_embedding_refinement
            && match self.embedder.ensure_loaded() {
                Ok(()) => true,
                Err(err) => {
                    log::warn!(
                        "embedding model '{}' unavailable, falling back to hash-only grouping: {err}",
                        self.embedder.name()
                    );
                    refinement_degraded = true;
                    false
                }
            };

        let mut records: Vec<PhotoRecord> = inputs
            .iter()
            .enumerate()
            .map(|(i, input)| {
                let mut record = PhotoRecord::pending(input.identity.clone(), i);
                record.dimensions = input.dimensions;
                record
            })
            .collect();
        let mut failures: Vec<PhotoFailure> = Vec::new();
        let mut processed = 0usize;

        let semaphore = Arc::new(Semaphore::new(workers));
        let chunk_size = self.config.chunk_size.max(1);
        let indices: Vec<usize> = (0..total).collect();

        'chunks: for chunk in indices.chunks(chunk_size) {
            if self.is_cancelled() {
                break 'chunks;
            }

            let mut handles: Vec<(usize, JoinHandle<Result<WorkerOutput, EngineError>>)> =
                Vec::new();

            for &idx in chunk {
                if self.is_cancelled() {
                    // Stop dispatching; fall through to harvest in-flight
                    // work below.
                    break;
                }

                let input = &inputs[idx];

                // Cache consult before any work is dispatched. A hit skips
                // the decode stage entirely.
                if let Some(entry) = self.cache.lookup(&input.identity) {
                    let record = &mut records[idx];
                    record.fingerprint = Some(entry.fingerprint);
                    record.quality = Some(entry.quality);
                    record.feature = entry.feature;
                    if record.dimensions.is_none() {
                        record.dimensions = entry.dimensions;
                    }
                    record.state = ProcessingState::Done;
                    processed += 1;
                    continue;
                }

                records[idx].state = ProcessingState::Decoding;

                let permit = semaphore
                    .clone()
                    .acquire_owned()
                    .await
                    .expect("worker semaphore closed");
                let source = input.source.clone();
                let algorithm = self.config.hash_algorithm;
                let embedder = embed.then(|| self.embedder.clone());
                let budget = self.config.task_timeout;

                let handle = tokio::spawn(async move {
                    let _permit = permit;
                    let work = tokio::task::spawn_blocking(move || {
                        run_photo_pipeline(source.as_ref(), algorithm, embedder.as_deref())
                    });
                    match timeout(budget, work).await {
                        Ok(Ok(result)) => result,
                        Ok(Err(join_err)) => Err(EngineError::Io(std::io::Error::other(
                            format!("worker panicked: {join_err}"),
                        ))),
                        // The blocking unit keeps running to completion in
                        // the background; its result is discarded.
                        Err(_) => Err(EngineError::Timeout(budget)),
                    }
                });
                handles.push((idx, handle));
            }

            for (idx, handle) in handles {
                let outcome = match handle.await {
                    Ok(result) => result,
                    Err(join_err) => Err(EngineError::Io(std::io::Error::other(format!(
                        "worker task failed: {join_err}"
                    )))),
                };
                processed += 1;

                let record = &mut records[idx];
                match outcome {
                    Ok(output) => {
                        record.dimensions = Some(output.dimensions);
                        record.fingerprint = Some(output.fingerprint);
                        record.quality = Some(output.quality);
                        record.feature = output.feature.clone();
                        record.state = ProcessingState::Done;

                        self.cache.store(
                            &record.identity,
                            CacheEntry::new(
                                output.fingerprint,
                                output.quality,
                                output.feature,
                                Some(output.dimensions),
                            ),
                        );
                    }
                    Err(err) => {
                        log::warn!(
                            "processing failed for {}: {err}",
                            record.identity.path.display()
                        );
                        record.state = ProcessingState::Failed;
                        failures.push(PhotoFailure::new(record.identity.clone(), &err));
                    }
                }
            }

            self.send_progress(processed, total);
        }

        let cancelled = self.is_cancelled();
        let policy = GroupingPolicy {
            threshold: options.clamped_threshold(),
            ..self.config.grouping.clone()
        };
        let groups = group_records(&records, &policy);

        log::info!(
            "batch complete: {} processed of {}, {} groups, {} failures{}",
            processed,
            total,
            groups.len(),
            failures.len(),
            if cancelled { " (cancelled)" } else { "" }
        );

        BatchOutcome {
            records,
            groups,
            failures,
            refinement_degraded,
            cancelled,
        }
    }
}

/// The engine owns the process-wide collaborators (config, fingerprint
/// cache, feature embedder) with explicit construction and injection;
/// there is no ambient global state. Each `process_batch` call runs on a
/// fresh scheduler.
pub struct Engine {
    config: EngineConfig,
    cache: Arc<FingerprintCache>,
    embedder: Arc<dyn FeatureEmbedder>,
}

impl Engine {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            cache: Arc::new(FingerprintCache::in_memory()),
            embedder: Arc::new(GridEmbedder::new()),
        }
    }

    /// Substitute the cache, e.g. a persistent one opened at startup.
    pub fn with_cache(mut self, cache: Arc<FingerprintCache>) -> Self {
        self.cache = cache;
        self
    }

    /// Substitute the embedding capability, e.g. a host-provided model.
    pub fn with_embedder(mut self, embedder: Arc<dyn FeatureEmbedder>) -> Self {
        self.embedder = embedder;
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn cache(&self) -> &Arc<FingerprintCache> {
        &self.cache
    }

    /// Build a scheduler for one batch. Hosts that need the progress
    /// channel or cancellation token drive this directly.
    pub fn scheduler(&self) -> BatchScheduler {
        BatchScheduler::new(self.config.clone(), self.cache.clone(), self.embedder.clone())
    }

    /// Process a batch end to end with default progress handling.
    pub async fn process_batch(
        &self,
        inputs: Vec<RawPhotoInput>,
        options: &BatchOptions,
    ) -> BatchOutcome {
        self.scheduler().process(inputs, options).await
    }

    /// Re-cluster previously completed records at a different threshold.
    /// Pure recomputation: records are not mutated and no pipeline work
    /// runs.
    pub fn regroup(&self, records: &[PhotoRecord], similarity_threshold: u8) -> Vec<SimilarityGroup> {
        let policy = GroupingPolicy {
            threshold: f64::from(similarity_threshold.clamp(50, 100)),
            ..self.config.grouping.clone()
        };
        group_records(records, &policy)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::embedding::NoopEmbedder;
    use crate::core::record::PhotoIdentity;
    use crate::services::intake::{collect_photo_inputs, IntakeOptions};
    use image::{DynamicImage, ImageBuffer, Rgb};
    use std::path::PathBuf;
    use std::sync::atomic::AtomicUsize;
    use std::time::{Duration, UNIX_EPOCH};
    use tempfile::TempDir;

    fn ramp_image(shift: u32) -> DynamicImage {
        let img = ImageBuffer::from_fn(128, 128, |x, y| {
            let v = ((x + shift + y) / 2).min(255) as u8;
            Rgb([v, v, v])
        });
        DynamicImage::ImageRgb8(img)
    }

    fn noise_image(seed: u32) -> DynamicImage {
        let img = ImageBuffer::from_fn(128, 128, |x, y| {
            let v = (x.wrapping_mul(31).wrapping_add(y.wrapping_mul(17 + seed)) % 256) as u8;
            Rgb([v, v, v])
        });
        DynamicImage::ImageRgb8(img)
    }

    /// Top half black, bottom half white: ~16 of 64 hash bits away from
    /// the diagonal ramp, far below any grouping threshold in use here.
    fn split_image() -> DynamicImage {
        let img = ImageBuffer::from_fn(128, 128, |_, y| {
            if y < 64 {
                Rgb([0u8, 0, 0])
            } else {
                Rgb([255u8, 255, 255])
            }
        });
        DynamicImage::ImageRgb8(img)
    }

    fn identity(path: &str, size: u64) -> PhotoIdentity {
        PhotoIdentity::new(path, size, UNIX_EPOCH + Duration::from_secs(1_700_000_000))
    }

    fn input(path: &str, image: DynamicImage) -> RawPhotoInput {
        RawPhotoInput::from_image(identity(path, 4096), image)
    }

    fn engine() -> Engine {
        Engine::new(EngineConfig::default())
    }

    fn options(threshold: u8) -> BatchOptions {
        BatchOptions {
            similarity_threshold: threshold,
            ..BatchOptions::default()
        }
    }

    /// Counts decode calls so tests can prove the cache skipped the
    /// decode stage.
    struct CountingSource {
        image: DynamicImage,
        decodes: Arc<AtomicUsize>,
    }

    impl PixelSource for CountingSource {
        fn decode(&self) -> Result<DynamicImage, EngineError> {
            self.decodes.fetch_add(1, Ordering::SeqCst);
            Ok(self.image.clone())
        }
    }

    /// Always fails, standing in for a corrupt file.
    struct FailingSource;

    impl PixelSource for FailingSource {
        fn decode(&self) -> Result<DynamicImage, EngineError> {
            Err(EngineError::Decode(image::ImageError::IoError(
                std::io::Error::other("unreadable pixel data"),
            )))
        }
    }

    /// Sleeps past any reasonable budget.
    struct SlowSource {
        delay: Duration,
        image: DynamicImage,
    }

    impl PixelSource for SlowSource {
        fn decode(&self) -> Result<DynamicImage, EngineError> {
            std::thread::sleep(self.delay);
            Ok(self.image.clone())
        }
    }

    /// Decodes normally, then trips the cancellation flag: the unit it
    /// belongs to finishes, and nothing after it may start.
    struct TripwireSource {
        image: DynamicImage,
        flag: Arc<AtomicBool>,
    }

    impl PixelSource for TripwireSource {
        fn decode(&self) -> Result<DynamicImage, EngineError> {
            self.flag.store(true, Ordering::Relaxed);
            Ok(self.image.clone())
        }
    }

    #[tokio::test]
    async fn duplicates_group_and_distinct_photo_stays_out() {
        let inputs = vec![
            input("/a.jpg", ramp_image(0)),
            input("/b.jpg", ramp_image(0)),
            input("/c.jpg", split_image()),
        ];

        let outcome = engine().process_batch(inputs, &options(95)).await;

        assert!(outcome.records.iter().all(|r| r.is_done()));
        assert!(outcome.failures.is_empty());
        assert!(!outcome.cancelled);
        assert_eq!(outcome.groups.len(), 1);
        assert_eq!(outcome.groups[0].members, vec![0, 1]);
    }

    #[tokio::test]
    async fn single_photo_batch_yields_no_groups() {
        let outcome = engine()
            .process_batch(vec![input("/only.jpg", ramp_image(0))], &options(90))
            .await;
        assert_eq!(outcome.records.len(), 1);
        assert!(outcome.groups.is_empty());
    }

    #[tokio::test]
    async fn empty_batch_completes_cleanly() {
        let outcome = engine().process_batch(Vec::new(), &options(90)).await;
        assert!(outcome.records.is_empty());
        assert!(outcome.groups.is_empty());
        assert!(outcome.failures.is_empty());
    }

    #[tokio::test]
    async fn one_bad_photo_does_not_abort_the_batch() {
        let inputs = vec![
            input("/good1.jpg", ramp_image(0)),
            RawPhotoInput::with_source(identity("/corrupt.jpg", 512), Arc::new(FailingSource)),
            input("/good2.jpg", ramp_image(0)),
        ];

        let outcome = engine().process_batch(inputs, &options(95)).await;

        assert_eq!(outcome.failures.len(), 1);
        assert_eq!(outcome.failures[0].kind, "decode");
        assert_eq!(
            outcome.failures[0].identity.path,
            PathBuf::from("/corrupt.jpg")
        );
        assert_eq!(outcome.records[1].state, ProcessingState::Failed);

        // The two good photos still processed and grouped.
        assert!(outcome.records[0].is_done());
        assert!(outcome.records[2].is_done());
        assert_eq!(outcome.groups.len(), 1);
    }

    #[tokio::test]
    async fn timeout_marks_the_record_failed_and_continues() {
        let mut config = EngineConfig::default();
        config.task_timeout = Duration::from_millis(50);
        let engine = Engine::new(config);

        let inputs = vec![
            input("/fast.jpg", ramp_image(0)),
            RawPhotoInput::with_source(
                identity("/stuck.jpg", 512),
                Arc::new(SlowSource {
                    delay: Duration::from_millis(400),
                    image: ramp_image(0),
                }),
            ),
        ];

        let outcome = engine.process_batch(inputs, &options(90)).await;
        assert_eq!(outcome.failures.len(), 1);
        assert_eq!(outcome.failures[0].kind, "timeout");
        assert!(outcome.records[0].is_done());
        assert_eq!(outcome.records[1].state, ProcessingState::Failed);
    }

    #[tokio::test]
    async fn rerun_with_unchanged_identity_skips_decoding() {
        let decodes = Arc::new(AtomicUsize::new(0));
        let make_inputs = |decodes: &Arc<AtomicUsize>| {
            vec![
                RawPhotoInput::with_source(
                    identity("/a.jpg", 4096),
                    Arc::new(CountingSource {
                        image: ramp_image(0),
                        decodes: decodes.clone(),
                    }),
                ),
                RawPhotoInput::with_source(
                    identity("/b.jpg", 4096),
                    Arc::new(CountingSource {
                        image: ramp_image(0),
                        decodes: decodes.clone(),
                    }),
                ),
            ]
        };

        let engine = engine();
        let first = engine.process_batch(make_inputs(&decodes), &options(95)).await;
        assert_eq!(decodes.load(Ordering::SeqCst), 2);

        let second = engine.process_batch(make_inputs(&decodes), &options(95)).await;
        assert_eq!(
            decodes.load(Ordering::SeqCst),
            2,
            "cache hits must not decode again"
        );

        // Cached values reproduce the first run exactly.
        for (a, b) in first.records.iter().zip(second.records.iter()) {
            assert_eq!(a.fingerprint, b.fingerprint);
            assert_eq!(a.quality.unwrap().score, b.quality.unwrap().score);
            assert_eq!(a.dimensions, b.dimensions);
            assert!(b.is_done());
        }
        assert_eq!(first.groups.len(), second.groups.len());
    }

    #[tokio::test]
    async fn cancellation_freezes_progress_and_leaves_rest_pending() {
        let mut config = EngineConfig::default();
        config.chunk_size = 1;
        let cache = Arc::new(FingerprintCache::in_memory());
        let scheduler = BatchScheduler::new(config, cache, Arc::new(GridEmbedder::new()));
        let (progress_tx, mut progress_rx) = mpsc::unbounded_channel();
        let scheduler = scheduler.with_progress_sender(progress_tx);
        let flag = scheduler.cancellation_token();

        // Photo 0 trips the flag while decoding: its unit finishes, the
        // three photos behind it must never start.
        let mut inputs = vec![RawPhotoInput::with_source(
            identity("/p0.jpg", 4096),
            Arc::new(TripwireSource {
                image: ramp_image(0),
                flag,
            }),
        )];
        for i in 1..4 {
            inputs.push(input(&format!("/p{i}.jpg"), ramp_image(0)));
        }

        let outcome = scheduler.process(inputs, &options(95)).await;

        assert!(outcome.cancelled);
        assert!(outcome.records[0].is_done());
        for record in &outcome.records[1..] {
            assert_eq!(record.state, ProcessingState::Pending);
        }

        let mut events = Vec::new();
        while let Ok(event) = progress_rx.try_recv() {
            events.push(event);
        }
        let last = events.last().expect("first chunk reported progress");
        assert_eq!(last.processed_count, 1);
        assert_eq!(last.total_count, 4);
    }

    #[tokio::test]
    async fn progress_counts_cover_the_whole_batch() {
        let mut config = EngineConfig::default();
        config.chunk_size = 2;
        let scheduler = BatchScheduler::new(
            config,
            Arc::new(FingerprintCache::in_memory()),
            Arc::new(GridEmbedder::new()),
        );
        let (progress_tx, mut progress_rx) = mpsc::unbounded_channel();
        let scheduler = scheduler.with_progress_sender(progress_tx);

        let inputs: Vec<_> = (0..5)
            .map(|i| input(&format!("/p{i}.jpg"), noise_image(i)))
            .collect();
        let outcome = scheduler.process(inputs, &options(95)).await;
        assert!(outcome.records.iter().all(|r| r.is_done()));

        let mut events = Vec::new();
        while let Ok(event) = progress_rx.try_recv() {
            events.push(event);
        }
        assert_eq!(events.len(), 3, "one event per chunk");
        let processed: Vec<usize> = events.iter().map(|e| e.processed_count).collect();
        assert_eq!(processed, vec![2, 4, 5]);
        assert_eq!(events.last().unwrap().percent, 100.0);
    }

    #[tokio::test]
    async fn unavailable_embedder_degrades_to_hash_only() {
        let engine = Engine::new(EngineConfig::default()).with_embedder(Arc::new(NoopEmbedder));
        let inputs = vec![
            input("/a.jpg", ramp_image(0)),
            input("/b.jpg", ramp_image(0)),
        ];

        let mut opts = options(95);
        opts.enable_embedding_refinement = true;
        let outcome = engine.process_batch(inputs, &opts).await;

        assert!(outcome.refinement_degraded);
        assert!(outcome.records.iter().all(|r| r.feature.is_none()));
        // Hash-only similarity still groups the identical pair.
        assert_eq!(outcome.groups.len(), 1);
    }

    #[tokio::test]
    async fn refinement_attaches_feature_vectors() {
        let engine = engine();
        let mut opts = options(95);
        opts.enable_embedding_refinement = true;

        let outcome = engine
            .process_batch(vec![input("/a.jpg", ramp_image(0))], &opts)
            .await;
        assert!(!outcome.refinement_degraded);
        let feature = outcome.records[0].feature.as_ref().unwrap();
        assert_eq!(feature.len(), GridEmbedder::new().dimension());
    }

    #[tokio::test]
    async fn regroup_is_pure_and_threshold_sensitive() {
        let engine = engine();
        let inputs = vec![
            input("/a.jpg", ramp_image(0)),
            input("/b.jpg", ramp_image(0)),
            input("/c.jpg", split_image()),
        ];
        let outcome = engine.process_batch(inputs, &options(95)).await;

        let snapshot = serde_json::to_string(&outcome.records).unwrap();
        let strict = engine.regroup(&outcome.records, 100);
        let loose = engine.regroup(&outcome.records, 50);
        assert_eq!(serde_json::to_string(&outcome.records).unwrap(), snapshot);

        // The identical pair survives any threshold; loosening can only
        // ever merge more.
        assert!(!strict.is_empty());
        assert!(loose[0].len() >= strict[0].len());
    }

    #[tokio::test]
    async fn end_to_end_from_directory_intake() {
        let temp_dir = TempDir::new().unwrap();
        let original = temp_dir.path().join("original.png");
        ramp_image(0).save(&original).unwrap();
        std::fs::copy(&original, temp_dir.path().join("copy.png")).unwrap();
        split_image().save(temp_dir.path().join("unrelated.png")).unwrap();

        let intake = IntakeOptions {
            compute_content_digests: true,
            ..IntakeOptions::default()
        };
        let inputs = collect_photo_inputs(&[temp_dir.path().to_path_buf()], &intake).unwrap();
        assert_eq!(inputs.len(), 3);

        let outcome = engine().process_batch(inputs, &options(95)).await;
        assert!(outcome.failures.is_empty());
        assert_eq!(outcome.groups.len(), 1);

        // Intake sorts by path: copy.png, original.png, unrelated.png.
        // The byte-identical pair groups; both carry the shared digest
        // identity and the earliest copy is the keeper on a full tie.
        assert_eq!(outcome.groups[0].members, vec![0, 1]);
        assert_eq!(outcome.groups[0].keeper, 0);
        assert_eq!(
            outcome.records[0].identity.cache_key(),
            outcome.records[1].identity.cache_key()
        );
        assert!(outcome.records[0].identity.cache_key().starts_with("sha256:"));
    }
}
