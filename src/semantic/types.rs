use std::path::PathBuf;

use image::DynamicImage;
use serde::{Deserialize, Serialize};

/// A photo as supplied by the catalog.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Photo {
    pub id: u64,
    pub album_id: u64,
    pub path: PathBuf,
}

/// An album, used as the unit of a search range.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Album {
    pub id: u64,
    pub label: String,
    pub count: usize,
}

/// A stored embedding. `data` is the codec's byte encoding of the vector.
#[derive(Clone, Debug, PartialEq)]
pub struct Embedding {
    pub photo_id: u64,
    pub album_id: u64,
    pub data: Vec<u8>,
}

/// Which albums a search scans.
///
/// An empty album list behaves the same as `all`.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SearchRange {
    pub albums: Vec<u64>,
    pub all: bool,
}

impl SearchRange {
    pub fn all() -> Self {
        Self {
            albums: vec![],
            all: true,
        }
    }

    pub fn albums(albums: Vec<u64>) -> Self {
        Self { albums, all: false }
    }

    pub fn is_all(&self) -> bool {
        self.all || self.albums.is_empty()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum QueryTarget {
    Image,
    Text,
}

/// A search query. The variant selects the encoder for the query vector.
#[derive(Clone, Debug)]
pub enum SearchQuery {
    Text(String),
    Image(DynamicImage),
}

impl SearchQuery {
    pub fn target(&self) -> QueryTarget {
        match self {
            SearchQuery::Text(_) => QueryTarget::Text,
            SearchQuery::Image(_) => QueryTarget::Image,
        }
    }
}
