//! Search coordination.
//!
//! `SearchCoordinator` owns the encoding pipeline and answers queries:
//! - at most one search runs at a time, independently of encoding
//! - text queries are translated first when a translator is configured,
//!   falling back to the original text if translation fails
//! - every stored embedding in range is scored against the query vector and
//!   the best matches above the threshold are kept in a `BoundedTopK`

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, RwLock};

use rayon::prelude::*;
use serde::Serialize;

use crate::semantic::codec::{decode_vector, l2_norm, similarity_with_norm};
use crate::semantic::encoders::{EncoderError, ImageEncoder, TextEncoder};
use crate::semantic::flight::Flight;
use crate::semantic::pipeline::{
    CancelToken, EncodeReport, EncodingPipeline, PipelineError, PipelineOptions, ProgressFn,
};
use crate::semantic::store::{EmbeddingStore, StoreError};
use crate::semantic::thumbnail::ThumbnailLoader;
use crate::semantic::topk::{BoundedTopK, MatchResult};
use crate::semantic::translate::Translator;
use crate::semantic::types::{Embedding, Photo, QueryTarget, SearchQuery, SearchRange};
use crate::semantic::{DEFAULT_THRESHOLD, DEFAULT_TOP_K};

/// Default number of embeddings scored per parallel scan task
pub const DEFAULT_SCAN_CHUNK: usize = 4096;

#[derive(Debug, thiserror::Error)]
pub enum SearchError {
    #[error("a search is already in progress")]
    Busy,

    #[error("search query is empty")]
    EmptyQuery,

    #[error("failed to encode query: {0}")]
    Encoder(#[from] EncoderError),

    #[error("failed to read embeddings: {0}")]
    Store(#[from] StoreError),

    #[error(transparent)]
    Pipeline(#[from] PipelineError),
}

#[derive(Clone, Debug)]
pub struct SearchSettings {
    /// Minimum similarity for a match (inclusive)
    pub threshold: f32,
    /// Maximum number of matches returned
    pub top_k: usize,
    pub scan_chunk: usize,
}

impl Default for SearchSettings {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_THRESHOLD,
            top_k: DEFAULT_TOP_K,
            scan_chunk: DEFAULT_SCAN_CHUNK,
        }
    }
}

/// Where a search currently is.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum SearchPhase {
    Idle = 0,
    Translating = 1,
    Encoding = 2,
    Scanning = 3,
    Ranked = 4,
}

impl SearchPhase {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => SearchPhase::Translating,
            2 => SearchPhase::Encoding,
            3 => SearchPhase::Scanning,
            4 => SearchPhase::Ranked,
            _ => SearchPhase::Idle,
        }
    }
}

/// Something the user should be told about a search that still succeeded.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SearchNotice {
    /// Translation failed, the untranslated query was used
    TranslationFallback { reason: String },
}

#[derive(Clone, Debug, Serialize)]
pub struct SearchOutcome {
    /// Photo IDs, best match first
    pub ids: Vec<u64>,
    pub matches: Vec<MatchResult>,
    pub target: QueryTarget,
    /// The text that was actually encoded, for text queries
    pub effective_text: Option<String>,
    /// Embeddings considered
    pub scanned: usize,
    /// Embeddings skipped because their bytes were corrupt
    pub skipped: usize,
    pub notices: Vec<SearchNotice>,
}

/// The collaborators a coordinator is built from.
pub struct Collaborators {
    pub image_encoder: Arc<dyn ImageEncoder>,
    pub text_encoder: Arc<dyn TextEncoder>,
    pub thumbnails: Arc<dyn ThumbnailLoader>,
    pub store: Arc<dyn EmbeddingStore>,
    pub translator: Option<Arc<dyn Translator>>,
}

pub struct SearchCoordinator {
    image_encoder: Arc<dyn ImageEncoder>,
    text_encoder: Arc<dyn TextEncoder>,
    store: Arc<dyn EmbeddingStore>,
    translator: Option<Arc<dyn Translator>>,
    pipeline: EncodingPipeline,
    settings: SearchSettings,
    flight: Flight,
    phase: AtomicU8,
    last_result: RwLock<Vec<u64>>,
}

/// Resets the phase to `Idle` however the search ends.
struct PhaseReset<'a>(&'a AtomicU8);

impl Drop for PhaseReset<'_> {
    fn drop(&mut self) {
        self.0.store(SearchPhase::Idle as u8, Ordering::Release);
    }
}

impl SearchCoordinator {
    pub fn new(
        collaborators: Collaborators,
        settings: SearchSettings,
        pipeline_options: PipelineOptions,
    ) -> Self {
        let pipeline = EncodingPipeline::new(
            collaborators.image_encoder.clone(),
            collaborators.thumbnails,
            collaborators.store.clone(),
            pipeline_options,
        );

        Self {
            image_encoder: collaborators.image_encoder,
            text_encoder: collaborators.text_encoder,
            store: collaborators.store,
            translator: collaborators.translator,
            pipeline,
            settings,
            flight: Flight::new(),
            phase: AtomicU8::new(SearchPhase::Idle as u8),
            last_result: RwLock::new(Vec::new()),
        }
    }

    pub fn settings(&self) -> &SearchSettings {
        &self.settings
    }

    pub fn phase(&self) -> SearchPhase {
        SearchPhase::from_u8(self.phase.load(Ordering::Acquire))
    }

    pub fn is_searching(&self) -> bool {
        self.flight.is_active()
    }

    pub fn is_encoding(&self) -> bool {
        self.pipeline.is_running()
    }

    /// Encode photos through the owned pipeline.
    pub fn start_encoding(
        &self,
        photos: &[Photo],
        on_progress: Option<&ProgressFn<'_>>,
        cancel: &CancelToken,
    ) -> Result<EncodeReport, PipelineError> {
        self.pipeline.encode(photos, on_progress, cancel)
    }

    pub fn has_embeddings(&self) -> Result<bool, StoreError> {
        let total = self.store.count()?;
        log::debug!("Total embedding count {total}");
        Ok(total > 0)
    }

    /// Remove the embeddings of the given albums.
    ///
    /// Refused while an encoding run is active, so a run's bulk write can
    /// never resurrect what was just removed.
    pub fn forget_albums(&self, album_ids: &[u64]) -> Result<usize, SearchError> {
        let removed = self
            .pipeline
            .exclusive(|| self.store.remove_albums(album_ids))??;
        log::info!("Removed {removed} embeddings from {} albums", album_ids.len());
        Ok(removed)
    }

    /// Photo IDs of the most recent successful search.
    pub fn last_result(&self) -> Vec<u64> {
        self.last_result
            .read()
            .map(|ids| ids.clone())
            .unwrap_or_default()
    }

    /// Rank stored photos against `query` within `range`.
    pub fn search(
        &self,
        query: &SearchQuery,
        range: &SearchRange,
    ) -> Result<SearchOutcome, SearchError> {
        let Some(_ticket) = self.flight.try_acquire() else {
            log::warn!("search: already searching, request rejected");
            return Err(SearchError::Busy);
        };
        let _reset = PhaseReset(&self.phase);
        let _span = tracing::debug_span!("search", target = ?query.target()).entered();

        let mut notices = Vec::new();
        let (query_vector, effective_text) = match query {
            SearchQuery::Text(text) => {
                let text = text.trim();
                if text.is_empty() {
                    return Err(SearchError::EmptyQuery);
                }
                let text = self.translate_or_original(text, &mut notices);

                self.set_phase(SearchPhase::Encoding);
                log::debug!("Encode text: '{text}'");
                (self.text_encoder.encode(&text)?, Some(text))
            }
            SearchQuery::Image(image) => {
                self.set_phase(SearchPhase::Encoding);
                self.image_encoder.load_model()?;
                (self.image_encoder.encode(image)?, None)
            }
        };

        let dimensions = self.image_encoder.dimensions();
        if query_vector.len() != dimensions {
            return Err(EncoderError::DimensionMismatch {
                expected: dimensions,
                got: query_vector.len(),
            }
            .into());
        }

        self.set_phase(SearchPhase::Scanning);
        let embeddings = if range.is_all() {
            log::debug!("Search from all albums");
            self.store.get_all()?
        } else {
            log::debug!("Search from albums {:?}", range.albums);
            self.store.get_by_albums(&range.albums)?
        };
        log::debug!("Got {} photo embeddings", embeddings.len());

        let (topk, skipped) = self.scan(&query_vector, dimensions, &embeddings);
        let ids = topk.to_ordered_ids();
        log::debug!("Search result: found {} photos", ids.len());

        self.set_phase(SearchPhase::Ranked);
        if let Ok(mut last) = self.last_result.write() {
            *last = ids.clone();
        }

        Ok(SearchOutcome {
            ids,
            matches: topk.into_matches(),
            target: query.target(),
            effective_text,
            scanned: embeddings.len(),
            skipped,
            notices,
        })
    }

    fn translate_or_original(&self, text: &str, notices: &mut Vec<SearchNotice>) -> String {
        let Some(translator) = &self.translator else {
            return text.to_string();
        };

        self.set_phase(SearchPhase::Translating);
        match translator.translate(text) {
            Ok(translated) => translated,
            Err(e) => {
                log::warn!("translation failed, searching with the original text: {e}");
                notices.push(SearchNotice::TranslationFallback {
                    reason: e.to_string(),
                });
                text.to_string()
            }
        }
    }

    /// Score every embedding and keep the best `top_k` at or above the
    /// threshold. Returns the accumulator and the number of corrupt entries.
    ///
    /// Chunks are scored in parallel and merged in input order, which gives
    /// the same ranking (ties included) as a single sequential pass.
    fn scan(
        &self,
        query: &[f32],
        dimensions: usize,
        embeddings: &[Embedding],
    ) -> (BoundedTopK, usize) {
        let top_k = self.settings.top_k;
        let threshold = self.settings.threshold;
        let query_norm = l2_norm(query);

        let partials: Vec<(BoundedTopK, usize)> = embeddings
            .par_chunks(self.settings.scan_chunk.max(1))
            .map(|chunk| {
                let mut topk = BoundedTopK::new(top_k);
                let mut corrupt = 0;
                for embedding in chunk {
                    match decode_vector(&embedding.data, dimensions) {
                        Ok(vector) => {
                            let score = similarity_with_norm(query, query_norm, &vector);
                            if score >= threshold {
                                topk.offer(embedding.photo_id, score);
                            }
                        }
                        Err(e) => {
                            log::warn!("Skipping embedding of photo {}: {e}", embedding.photo_id);
                            corrupt += 1;
                        }
                    }
                }
                (topk, corrupt)
            })
            .collect();

        let mut merged = BoundedTopK::new(top_k);
        let mut skipped = 0;
        for (topk, corrupt) in partials {
            merged.merge(topk);
            skipped += corrupt;
        }
        (merged, skipped)
    }

    fn set_phase(&self, phase: SearchPhase) {
        self.phase.store(phase as u8, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::semantic::codec::encode_bytes;
    use crate::semantic::store::FileEmbeddingStore;
    use crate::tests::support::{FakeImageEncoder, FakeTextEncoder, FakeThumbnails};

    fn coordinator(
        store: Arc<FileEmbeddingStore>,
        text: FakeTextEncoder,
        settings: SearchSettings,
    ) -> SearchCoordinator {
        SearchCoordinator::new(
            Collaborators {
                image_encoder: Arc::new(FakeImageEncoder::new(2)),
                text_encoder: Arc::new(text),
                thumbnails: Arc::new(FakeThumbnails::readable()),
                store,
                translator: None,
            },
            settings,
            PipelineOptions::default(),
        )
    }

    fn emb(photo_id: u64, album_id: u64, data: Vec<u8>) -> Embedding {
        Embedding {
            photo_id,
            album_id,
            data,
        }
    }

    #[test]
    fn test_threshold_scenario() {
        let store = Arc::new(FileEmbeddingStore::in_memory());
        store
            .upsert_all(vec![
                emb(2, 1, encode_bytes(&[1.0, 0.0])),
                emb(3, 1, encode_bytes(&[0.0, 1.0])),
            ])
            .unwrap();

        let settings = SearchSettings {
            threshold: 0.5,
            ..Default::default()
        };
        let text = FakeTextEncoder::new(2).with("a", vec![1.0, 0.0]);
        let coordinator = coordinator(store, text, settings);

        let outcome = coordinator
            .search(&SearchQuery::Text("a".into()), &SearchRange::all())
            .unwrap();

        assert_eq!(outcome.ids, vec![2]);
        assert!((outcome.matches[0].score - 1.0).abs() < 1e-6);
        assert_eq!(outcome.scanned, 2);
    }

    #[test]
    fn test_empty_query_rejected_and_guard_released() {
        let store = Arc::new(FileEmbeddingStore::in_memory());
        let coordinator = coordinator(store, FakeTextEncoder::new(2), SearchSettings::default());

        let result = coordinator.search(&SearchQuery::Text("   ".into()), &SearchRange::all());
        assert!(matches!(result, Err(SearchError::EmptyQuery)));
        assert!(!coordinator.is_searching());
        assert_eq!(coordinator.phase(), SearchPhase::Idle);
    }

    #[test]
    fn test_corrupt_embedding_is_skipped() {
        let store = Arc::new(FileEmbeddingStore::in_memory());
        store
            .upsert_all(vec![
                emb(1, 1, vec![0, 1, 2]),
                emb(2, 1, encode_bytes(&[1.0, 0.0])),
            ])
            .unwrap();

        let text = FakeTextEncoder::new(2).with("x", vec![1.0, 0.0]);
        let coordinator = coordinator(store, text, SearchSettings::default());

        let outcome = coordinator
            .search(&SearchQuery::Text("x".into()), &SearchRange::all())
            .unwrap();
        assert_eq!(outcome.ids, vec![2]);
        assert_eq!(outcome.skipped, 1);
    }

    #[test]
    fn test_album_range_limits_scan() {
        let store = Arc::new(FileEmbeddingStore::in_memory());
        store
            .upsert_all(vec![
                emb(1, 10, encode_bytes(&[1.0, 0.0])),
                emb(2, 20, encode_bytes(&[0.9, 0.1])),
                emb(3, 30, encode_bytes(&[0.8, 0.2])),
            ])
            .unwrap();

        let text = FakeTextEncoder::new(2).with("x", vec![1.0, 0.0]);
        let coordinator = coordinator(store, text, SearchSettings::default());

        let outcome = coordinator
            .search(&SearchQuery::Text("x".into()), &SearchRange::albums(vec![20, 30]))
            .unwrap();
        assert_eq!(outcome.ids, vec![2, 3]);
        assert_eq!(outcome.scanned, 2);

        // Empty album list means everything
        let outcome = coordinator
            .search(&SearchQuery::Text("x".into()), &SearchRange::albums(vec![]))
            .unwrap();
        assert_eq!(outcome.ids, vec![1, 2, 3]);
    }

    #[test]
    fn test_parallel_scan_matches_sequential_ties() {
        let store = Arc::new(FileEmbeddingStore::in_memory());
        let embeddings = (1..=40u64)
            .map(|id| {
                // Four distinct scores, many ties
                let v = match id % 4 {
                    0 => [1.0, 0.0],
                    1 => [1.0, 0.5],
                    2 => [1.0, 1.0],
                    _ => [0.5, 1.0],
                };
                emb(id, 1, encode_bytes(&v))
            })
            .collect();
        store.upsert_all(embeddings).unwrap();

        let settings = SearchSettings {
            threshold: 0.0,
            top_k: 7,
            scan_chunk: 3,
        };
        let text = FakeTextEncoder::new(2).with("x", vec![1.0, 0.0]);
        let coordinator = coordinator(store, text, settings);

        let outcome = coordinator
            .search(&SearchQuery::Text("x".into()), &SearchRange::all())
            .unwrap();

        // Exact matches (id % 4 == 0) first, in ascending id order
        assert_eq!(outcome.ids, vec![4, 8, 12, 16, 20, 24, 28]);
    }

    #[test]
    fn test_last_result_is_retained() {
        let store = Arc::new(FileEmbeddingStore::in_memory());
        store
            .upsert_all(vec![emb(5, 1, encode_bytes(&[1.0, 0.0]))])
            .unwrap();

        let text = FakeTextEncoder::new(2).with("x", vec![1.0, 0.0]);
        let coordinator = coordinator(store, text, SearchSettings::default());
        assert!(coordinator.last_result().is_empty());

        coordinator
            .search(&SearchQuery::Text("x".into()), &SearchRange::all())
            .unwrap();
        assert_eq!(coordinator.last_result(), vec![5]);
    }

    #[test]
    fn test_query_dimension_mismatch_is_error() {
        let store = Arc::new(FileEmbeddingStore::in_memory());
        let text = FakeTextEncoder::new(3).with("x", vec![1.0, 0.0, 0.0]);
        let coordinator = coordinator(store, text, SearchSettings::default());

        let result = coordinator.search(&SearchQuery::Text("x".into()), &SearchRange::all());
        assert!(matches!(
            result,
            Err(SearchError::Encoder(EncoderError::DimensionMismatch { .. }))
        ));
        assert!(!coordinator.is_searching());
    }

    #[test]
    fn test_phase_is_idle_after_search() {
        let store = Arc::new(FileEmbeddingStore::in_memory());
        let coordinator = coordinator(store, FakeTextEncoder::new(2), SearchSettings::default());
        assert_eq!(coordinator.phase(), SearchPhase::Idle);

        let outcome = coordinator
            .search(&SearchQuery::Text("anything".into()), &SearchRange::all())
            .unwrap();
        assert!(outcome.ids.is_empty());
        assert_eq!(coordinator.phase(), SearchPhase::Idle);
    }
}
