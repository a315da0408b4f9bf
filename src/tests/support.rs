//! In-crate fakes shared by unit and scenario tests.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use image::{DynamicImage, GenericImageView, Rgba, RgbaImage};

use crate::semantic::encoders::{EncoderError, ImageEncoder, TextEncoder};
use crate::semantic::pipeline::CancelToken;
use crate::semantic::thumbnail::ThumbnailLoader;
use crate::semantic::translate::{TranslateError, Translator};
use crate::semantic::types::Photo;

/// Photos with IDs `1..=n` in one album.
pub fn photos(n: u64, album_id: u64) -> Vec<Photo> {
    (1..=n)
        .map(|id| Photo {
            id,
            album_id,
            path: PathBuf::from(format!("/photos/{album_id}/{id}.jpg")),
        })
        .collect()
}

/// A 1x1 image whose pixel carries the photo ID.
pub fn id_image(id: u64) -> DynamicImage {
    let bytes = (id as u32).to_le_bytes();
    DynamicImage::ImageRgba8(RgbaImage::from_pixel(1, 1, Rgba(bytes)))
}

fn image_id(image: &DynamicImage) -> u64 {
    let Rgba(bytes) = image.get_pixel(0, 0);
    u32::from_le_bytes(bytes) as u64
}

/// One-hot-ish vector derived from the ID, so different photos differ.
pub fn default_vector(id: u64, dims: usize) -> Vec<f32> {
    let mut v = vec![0.1; dims];
    v[id as usize % dims] = 1.0;
    v
}

pub struct FakeThumbnails {
    unreadable: HashSet<u64>,
}

impl FakeThumbnails {
    pub fn readable() -> Self {
        Self {
            unreadable: HashSet::new(),
        }
    }

    pub fn unreadable(ids: &[u64]) -> Self {
        Self {
            unreadable: ids.iter().copied().collect(),
        }
    }
}

impl ThumbnailLoader for FakeThumbnails {
    fn load(&self, photo: &Photo) -> Option<DynamicImage> {
        if self.unreadable.contains(&photo.id) {
            return None;
        }
        Some(id_image(photo.id))
    }
}

/// Image encoder that reads the photo ID back out of the thumbnail.
pub struct FakeImageEncoder {
    dims: usize,
    reported_dims: usize,
    calls: Arc<AtomicUsize>,
    fail_load: bool,
    failing: HashSet<u64>,
    vectors: HashMap<u64, Vec<f32>>,
    cancel_after: Option<(usize, CancelToken)>,
    delay: Duration,
}

impl FakeImageEncoder {
    pub fn new(dims: usize) -> Self {
        Self {
            dims,
            reported_dims: dims,
            calls: Arc::new(AtomicUsize::new(0)),
            fail_load: false,
            failing: HashSet::new(),
            vectors: HashMap::new(),
            cancel_after: None,
            delay: Duration::ZERO,
        }
    }

    /// Counter of `encode` calls.
    pub fn calls(&self) -> Arc<AtomicUsize> {
        self.calls.clone()
    }

    pub fn failing_load(mut self) -> Self {
        self.fail_load = true;
        self
    }

    pub fn failing_for(mut self, ids: &[u64]) -> Self {
        self.failing = ids.iter().copied().collect();
        self
    }

    /// Claim `dims` output dimensions while producing the constructor's.
    pub fn reporting_dimensions(mut self, dims: usize) -> Self {
        self.reported_dims = dims;
        self
    }

    /// Trigger `cancel` once `n` photos have been encoded.
    pub fn cancelling_after(mut self, n: usize, cancel: CancelToken) -> Self {
        self.cancel_after = Some((n, cancel));
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn with_vector(mut self, id: u64, vector: Vec<f32>) -> Self {
        self.vectors.insert(id, vector);
        self
    }
}

impl ImageEncoder for FakeImageEncoder {
    fn load_model(&self) -> Result<(), EncoderError> {
        if self.fail_load {
            return Err(EncoderError::InitFailed("model file missing".to_string()));
        }
        Ok(())
    }

    fn encode(&self, image: &DynamicImage) -> Result<Vec<f32>, EncoderError> {
        if !self.delay.is_zero() {
            std::thread::sleep(self.delay);
        }
        let calls = self.calls.fetch_add(1, Ordering::SeqCst) + 1;

        let id = image_id(image);
        if self.failing.contains(&id) {
            return Err(EncoderError::EncodeFailed(format!("photo {id} failed")));
        }

        if let Some((n, cancel)) = &self.cancel_after {
            if calls >= *n {
                cancel.cancel();
            }
        }

        Ok(self
            .vectors
            .get(&id)
            .cloned()
            .unwrap_or_else(|| default_vector(id, self.dims)))
    }

    fn dimensions(&self) -> usize {
        self.reported_dims
    }
}

/// Text encoder with fixed answers. Unknown text encodes to zeros.
pub struct FakeTextEncoder {
    dims: usize,
    vectors: HashMap<String, Vec<f32>>,
    received: Arc<Mutex<Vec<String>>>,
    delay: Duration,
}

impl FakeTextEncoder {
    pub fn new(dims: usize) -> Self {
        Self {
            dims,
            vectors: HashMap::new(),
            received: Arc::new(Mutex::new(Vec::new())),
            delay: Duration::ZERO,
        }
    }

    pub fn with(mut self, text: &str, vector: Vec<f32>) -> Self {
        self.vectors.insert(text.to_string(), vector);
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Every text passed to `encode`, in order.
    pub fn received(&self) -> Arc<Mutex<Vec<String>>> {
        self.received.clone()
    }
}

impl TextEncoder for FakeTextEncoder {
    fn encode(&self, text: &str) -> Result<Vec<f32>, EncoderError> {
        if !self.delay.is_zero() {
            std::thread::sleep(self.delay);
        }
        self.received.lock().unwrap().push(text.to_string());
        Ok(self
            .vectors
            .get(text)
            .cloned()
            .unwrap_or_else(|| vec![0.0; self.dims]))
    }
}

pub struct FakeTranslator {
    table: HashMap<String, String>,
    fail: bool,
}

impl FakeTranslator {
    pub fn ok(pairs: &[(&str, &str)]) -> Self {
        Self {
            table: pairs
                .iter()
                .map(|(from, to)| (from.to_string(), to.to_string()))
                .collect(),
            fail: false,
        }
    }

    pub fn failing() -> Self {
        Self {
            table: HashMap::new(),
            fail: true,
        }
    }
}

impl Translator for FakeTranslator {
    fn translate(&self, text: &str) -> Result<String, TranslateError> {
        if self.fail {
            return Err(TranslateError::Service {
                status: 503,
                message: "service unavailable".to_string(),
            });
        }
        Ok(self
            .table
            .get(text)
            .cloned()
            .unwrap_or_else(|| text.to_string()))
    }
}
