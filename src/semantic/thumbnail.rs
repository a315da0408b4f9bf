//! Thumbnail loading for the encoding pipeline.

use std::path::Path;

use image::{DynamicImage, GenericImageView, ImageReader};

use crate::semantic::types::Photo;

/// Loads a downscaled image for a photo.
///
/// `None` means the photo is unsupported or unreadable; the pipeline skips it.
pub trait ThumbnailLoader: Send + Sync {
    fn load(&self, photo: &Photo) -> Option<DynamicImage>;
}

/// Decodes photos from disk with the `image` crate and scales them down so
/// neither side exceeds `max_dimension`.
pub struct ImageThumbnailLoader {
    max_dimension: u32,
}

impl ImageThumbnailLoader {
    pub fn new(max_dimension: u32) -> Self {
        Self {
            max_dimension: max_dimension.max(1),
        }
    }

    /// Decode the image at `path` and scale it down to the loader's bound.
    ///
    /// Also used for image queries, so they reach the encoder at the same
    /// size as indexed photos.
    pub fn open(&self, path: &Path) -> anyhow::Result<DynamicImage> {
        use anyhow::Context;

        let img = ImageReader::open(path)
            .context("Failed to open image")?
            .with_guessed_format()
            .context("Failed to detect image format")?
            .decode()
            .context("Failed to decode image")?;

        let (w, h) = img.dimensions();
        if w <= self.max_dimension && h <= self.max_dimension {
            return Ok(img);
        }

        Ok(img.thumbnail(self.max_dimension, self.max_dimension))
    }
}

impl ThumbnailLoader for ImageThumbnailLoader {
    fn load(&self, photo: &Photo) -> Option<DynamicImage> {
        match self.open(&photo.path) {
            Ok(img) => Some(img),
            Err(e) => {
                log::debug!("thumbnail for '{}' failed: {e:#}", photo.path.display());
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_png(path: &Path, width: u32, height: u32) {
        let img = image::RgbImage::from_pixel(width, height, image::Rgb([10, 200, 30]));
        img.save(path).unwrap();
    }

    fn photo(path: &Path) -> Photo {
        Photo {
            id: 1,
            album_id: 1,
            path: path.to_path_buf(),
        }
    }

    #[test]
    fn test_large_image_is_downscaled() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("big.png");
        write_png(&path, 400, 200);

        let thumb = ImageThumbnailLoader::new(100).load(&photo(&path)).unwrap();
        let (w, h) = thumb.dimensions();
        assert!(w <= 100 && h <= 100);
        assert_eq!(w, 100);
    }

    #[test]
    fn test_small_image_is_kept() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("small.png");
        write_png(&path, 20, 10);

        let thumb = ImageThumbnailLoader::new(100).load(&photo(&path)).unwrap();
        assert_eq!(thumb.dimensions(), (20, 10));
    }

    #[test]
    fn test_unreadable_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.jpg");
        std::fs::write(&path, b"definitely not a jpeg").unwrap();

        let loader = ImageThumbnailLoader::new(100);
        assert!(loader.load(&photo(&path)).is_none());
        assert!(loader.load(&photo(&dir.path().join("missing.png"))).is_none());
    }

    #[test]
    fn test_open_query_image_is_downscaled_or_errors() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("query.png");
        write_png(&path, 300, 600);

        let loader = ImageThumbnailLoader::new(150);
        let img = loader.open(&path).unwrap();
        assert_eq!(img.dimensions().1, 150);

        let err = loader.open(&dir.path().join("missing.png")).unwrap_err();
        assert!(format!("{err:#}").contains("Failed to open image"));
    }
}
