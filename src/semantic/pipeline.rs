//! Photo encoding pipeline.
//!
//! Turns a batch of photos into embeddings and persists them with a single
//! bulk upsert. Two execution modes are available:
//!
//! - `Sequential`: one thread loads, encodes and accumulates each photo.
//! - `Pipelined`: a producer thread loads thumbnails into a bounded channel
//!   while a pool of consumer threads runs inference. The producer signals
//!   completion by dropping its sender, which closes the channel once drained.
//!
//! At most one run is active per pipeline; a concurrent request is rejected
//! with `PipelineError::Busy` rather than queued.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use image::DynamicImage;
use serde::{Deserialize, Serialize};

use crate::semantic::codec::encode_bytes;
use crate::semantic::encoders::{EncoderError, ImageEncoder};
use crate::semantic::flight::Flight;
use crate::semantic::store::{EmbeddingStore, StoreError};
use crate::semantic::thumbnail::ThumbnailLoader;
use crate::semantic::types::{Embedding, Photo};

/// Callback receiving progress events.
pub type ProgressFn<'a> = dyn Fn(Progress) + Send + Sync + 'a;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EncodingMode {
    Sequential,
    #[default]
    Pipelined,
}

#[derive(Clone, Debug)]
pub struct PipelineOptions {
    pub mode: EncodingMode,
    /// Number of inference threads in pipelined mode
    pub consumers: usize,
    /// Maximum number of loaded thumbnails waiting for inference
    pub queue_capacity: usize,
    /// Minimum time between two progress events
    pub progress_interval: Duration,
    /// No progress events are emitted before this much time has passed
    pub progress_delay: Duration,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            mode: EncodingMode::Pipelined,
            consumers: 2,
            queue_capacity: 8,
            progress_interval: Duration::from_millis(500),
            progress_delay: Duration::from_millis(50),
        }
    }
}

/// A progress snapshot.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Progress {
    /// Photos encoded so far
    pub completed: usize,
    /// Photos skipped as unreadable or unencodable
    pub skipped: usize,
    pub total: usize,
    /// Average cost per encoded photo since the previous event
    pub recent_cost: Duration,
    /// Set only on the final event of a run
    pub finished: bool,
}

/// Summary of a finished run.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EncodeReport {
    pub total: usize,
    pub completed: usize,
    pub skipped: usize,
    pub cancelled: bool,
    pub elapsed: Duration,
}

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("an encoding run is already in progress")]
    Busy,

    #[error("failed to load the image model: {0}")]
    ModelLoad(#[source] EncoderError),

    #[error("failed to persist embeddings: {0}")]
    Store(#[from] StoreError),
}

/// Cooperative cancellation flag, checked between photos.
#[derive(Clone, Debug, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

pub struct EncodingPipeline {
    image_encoder: Arc<dyn ImageEncoder>,
    thumbnails: Arc<dyn ThumbnailLoader>,
    store: Arc<dyn EmbeddingStore>,
    options: PipelineOptions,
    flight: Flight,
}

impl EncodingPipeline {
    pub fn new(
        image_encoder: Arc<dyn ImageEncoder>,
        thumbnails: Arc<dyn ThumbnailLoader>,
        store: Arc<dyn EmbeddingStore>,
        options: PipelineOptions,
    ) -> Self {
        Self {
            image_encoder,
            thumbnails,
            store,
            options,
            flight: Flight::new(),
        }
    }

    pub fn is_running(&self) -> bool {
        self.flight.is_active()
    }

    /// Run `f` while holding the encoding slot, so no run can start meanwhile.
    pub fn exclusive<R>(&self, f: impl FnOnce() -> R) -> Result<R, PipelineError> {
        let _ticket = self.flight.try_acquire().ok_or(PipelineError::Busy)?;
        Ok(f())
    }

    /// Encode `photos` and persist the resulting embeddings.
    ///
    /// Unreadable photos are skipped. A model load failure aborts the run
    /// before any photo is touched. After the run (cancelled or not) the
    /// encoded embeddings are written with one bulk upsert and a final
    /// progress event with `finished == true` is delivered exactly once.
    pub fn encode(
        &self,
        photos: &[Photo],
        on_progress: Option<&ProgressFn<'_>>,
        cancel: &CancelToken,
    ) -> Result<EncodeReport, PipelineError> {
        let Some(ticket) = self.flight.try_acquire() else {
            log::warn!("encode: already encoding, request rejected");
            return Err(PipelineError::Busy);
        };

        let _span = tracing::info_span!("encode", photos = photos.len()).entered();
        let started = Instant::now();
        self.image_encoder.load_model().map_err(|e| {
            log::error!("encode: image model failed to load: {e}");
            PipelineError::ModelLoad(e)
        })?;

        log::info!(
            "encode: started {} photos in {:?} mode",
            photos.len(),
            self.options.mode
        );

        let tracker = ProgressTracker::new(photos.len(), &self.options, on_progress);
        let embeddings = std::thread::scope(|s| {
            // Dropping the sender stops the ticker
            let (stop, stopped) = crossbeam_channel::bounded::<()>(0);
            if tracker.wants_ticks() {
                let tracker = &tracker;
                s.spawn(move || tracker.tick_until(stopped));
            }

            let embeddings = match self.options.mode {
                EncodingMode::Sequential => self.run_sequential(photos, &tracker, cancel),
                EncodingMode::Pipelined => self.run_pipelined(photos, &tracker, cancel),
            };
            drop(stop);
            embeddings
        });

        let report = EncodeReport {
            total: photos.len(),
            completed: tracker.completed(),
            skipped: tracker.skipped(),
            cancelled: cancel.is_cancelled(),
            elapsed: started.elapsed(),
        };
        log::info!(
            "encode: done in {} ms, {} encoded, {} skipped{}",
            report.elapsed.as_millis(),
            report.completed,
            report.skipped,
            if report.cancelled { " (cancelled)" } else { "" }
        );

        let persisted = self.store.upsert_all(embeddings);
        drop(ticket);
        tracker.finish();

        persisted?;
        Ok(report)
    }

    fn run_sequential(
        &self,
        photos: &[Photo],
        tracker: &ProgressTracker,
        cancel: &CancelToken,
    ) -> Vec<Embedding> {
        let mut embeddings = Vec::with_capacity(photos.len());

        for photo in photos {
            if cancel.is_cancelled() {
                log::info!("encode: cancelled");
                break;
            }

            let Some(thumbnail) = self.thumbnails.load(photo) else {
                log::warn!("Unsupported file: '{}', skip encoding it.", photo.path.display());
                tracker.record_skipped();
                continue;
            };

            match self.encode_one(photo, &thumbnail) {
                Some(embedding) => {
                    embeddings.push(embedding);
                    tracker.record_completed();
                }
                None => tracker.record_skipped(),
            }
        }

        embeddings
    }

    fn run_pipelined(
        &self,
        photos: &[Photo],
        tracker: &ProgressTracker,
        cancel: &CancelToken,
    ) -> Vec<Embedding> {
        let consumers = self.options.consumers.max(1);
        let (tx, rx) = crossbeam_channel::bounded::<(&Photo, DynamicImage)>(
            self.options.queue_capacity.max(1),
        );
        let results = Mutex::new(Vec::with_capacity(photos.len()));

        std::thread::scope(|s| {
            let thumbnails = &self.thumbnails;
            s.spawn(move || {
                for photo in photos {
                    if cancel.is_cancelled() {
                        break;
                    }

                    match thumbnails.load(photo) {
                        Some(thumbnail) => {
                            // Every consumer is gone, nothing left to feed
                            if tx.send((photo, thumbnail)).is_err() {
                                break;
                            }
                        }
                        None => {
                            log::warn!(
                                "Unsupported file: '{}', skip encoding it.",
                                photo.path.display()
                            );
                            tracker.record_skipped();
                        }
                    }
                }
                log::debug!("encode: producer finished");
            });

            for worker in 0..consumers {
                let rx = rx.clone();
                let results = &results;
                s.spawn(move || {
                    let mut local = Vec::new();
                    for (photo, thumbnail) in rx.iter() {
                        if cancel.is_cancelled() {
                            break;
                        }
                        match self.encode_one(photo, &thumbnail) {
                            Some(embedding) => {
                                local.push(embedding);
                                tracker.record_completed();
                            }
                            None => tracker.record_skipped(),
                        }
                    }
                    log::debug!("encode: consumer {worker} finished with {} embeddings", local.len());

                    let mut results = results.lock().unwrap_or_else(|e| e.into_inner());
                    results.extend(local);
                });
            }

            drop(rx);
        });

        results.into_inner().unwrap_or_else(|e| e.into_inner())
    }

    fn encode_one(&self, photo: &Photo, thumbnail: &DynamicImage) -> Option<Embedding> {
        let vector = match self.image_encoder.encode(thumbnail) {
            Ok(vector) => vector,
            Err(e) => {
                log::warn!("Failed to encode '{}': {e}, skipping", photo.path.display());
                return None;
            }
        };

        let expected = self.image_encoder.dimensions();
        if vector.len() != expected {
            log::warn!(
                "Encoder returned {} dimensions for '{}', expected {expected}, skipping",
                vector.len(),
                photo.path.display()
            );
            return None;
        }

        Some(Embedding {
            photo_id: photo.id,
            album_id: photo.album_id,
            data: encode_bytes(&vector),
        })
    }
}

/// Shared counters plus rate-limited progress delivery.
///
/// Workers report each photo and a ticker thread fires every interval;
/// whichever finds the interval elapsed emits the event. Emission and the counter reads happen under one lock,
/// so observed counts never go backwards.
struct ProgressTracker<'a> {
    total: usize,
    completed: AtomicUsize,
    skipped: AtomicUsize,
    started: Instant,
    interval: Duration,
    delay: Duration,
    last: Mutex<LastEmission>,
    sink: Option<&'a ProgressFn<'a>>,
}

struct LastEmission {
    at: Option<Instant>,
    completed: usize,
}

impl<'a> ProgressTracker<'a> {
    fn new(total: usize, options: &PipelineOptions, sink: Option<&'a ProgressFn<'a>>) -> Self {
        Self {
            total,
            completed: AtomicUsize::new(0),
            skipped: AtomicUsize::new(0),
            started: Instant::now(),
            interval: options.progress_interval,
            delay: options.progress_delay,
            last: Mutex::new(LastEmission {
                at: None,
                completed: 0,
            }),
            sink,
        }
    }

    fn completed(&self) -> usize {
        self.completed.load(Ordering::Acquire)
    }

    fn skipped(&self) -> usize {
        self.skipped.load(Ordering::Acquire)
    }

    fn record_completed(&self) {
        self.completed.fetch_add(1, Ordering::AcqRel);
        self.maybe_emit();
    }

    fn record_skipped(&self) {
        self.skipped.fetch_add(1, Ordering::AcqRel);
        self.maybe_emit();
    }

    fn maybe_emit(&self) {
        let Some(sink) = self.sink else {
            return;
        };

        let now = Instant::now();
        if now.duration_since(self.started) < self.delay {
            return;
        }

        // Another worker is emitting right now, it will report our count too
        let Ok(mut last) = self.last.try_lock() else {
            return;
        };
        if let Some(at) = last.at {
            if now.duration_since(at) < self.interval {
                return;
            }
        }

        let progress = self.snapshot(&mut last, now, false);
        sink(progress);
    }

    fn wants_ticks(&self) -> bool {
        self.sink.is_some() && self.total > 0 && !self.interval.is_zero()
    }

    /// Emit on a fixed cadence until `stopped` disconnects, so a slow
    /// inference call still produces events.
    fn tick_until(&self, stopped: crossbeam_channel::Receiver<()>) {
        loop {
            match stopped.recv_timeout(self.interval) {
                Err(crossbeam_channel::RecvTimeoutError::Timeout) => self.maybe_emit(),
                _ => break,
            }
        }
    }

    /// Deliver the final event. Called once, after every worker has stopped.
    fn finish(&self) {
        let Some(sink) = self.sink else {
            return;
        };

        let mut last = self.last.lock().unwrap_or_else(|e| e.into_inner());
        let progress = self.snapshot(&mut last, Instant::now(), true);
        sink(progress);
    }

    fn snapshot(&self, last: &mut LastEmission, now: Instant, finished: bool) -> Progress {
        let completed = self.completed();
        let delta = completed.saturating_sub(last.completed);
        let window_start = last.at.unwrap_or(self.started);
        let recent_cost = if delta > 0 {
            now.duration_since(window_start) / delta as u32
        } else {
            Duration::ZERO
        };

        last.at = Some(now);
        last.completed = completed;

        Progress {
            completed,
            skipped: self.skipped(),
            total: self.total,
            recent_cost,
            finished,
        }
    }
}
