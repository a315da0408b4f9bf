//! On-device semantic photo search.
//!
//! Photos are encoded into CLIP embeddings by the encoding pipeline and
//! stored as opaque byte blobs. Text or image queries are encoded into the
//! same space and ranked against every stored embedding by cosine similarity.
//!
//! # Architecture
//!
//! - `codec`: vector <-> bytes conversion and cosine similarity
//! - `topk`: bounded, ordered accumulator of the best matches
//! - `store`: embedding persistence (`embeddings.bin`)
//! - `encoders`: image/text encoder traits and their fastembed implementations
//! - `thumbnail`: photo decoding for the pipeline
//! - `translate`: optional query translation
//! - `pipeline`: producer/consumer photo encoding
//! - `coordinator`: single-flight search over the store

pub mod codec;
pub mod coordinator;
pub mod encoders;
mod flight;
pub mod pipeline;
pub mod store;
pub mod thumbnail;
pub mod topk;
pub mod translate;
pub mod types;

pub use coordinator::{Collaborators, SearchCoordinator, SearchNotice, SearchSettings};
pub use encoders::{ClipImageEncoder, ClipTextEncoder, ModelSettings};
pub use pipeline::{CancelToken, EncodingMode, PipelineOptions, Progress};
pub use store::{EmbeddingStore, FileEmbeddingStore};
pub use thumbnail::ImageThumbnailLoader;
pub use translate::HttpTranslator;
pub use types::{Album, Photo, SearchQuery, SearchRange};

/// Default similarity threshold for a match
pub const DEFAULT_THRESHOLD: f32 = 0.25;

/// Default number of results returned by a search
pub const DEFAULT_TOP_K: usize = 30;
