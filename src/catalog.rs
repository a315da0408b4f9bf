//! Photo catalog built from a directory tree.
//!
//! Every supported image file becomes a `Photo`; its parent directory is its
//! album. IDs are derived from the canonical path, so they survive rescans.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use walkdir::WalkDir;

use crate::semantic::{Album, Photo};

const MANIFEST_FILE_NAME: &str = "catalog.json";

const SUPPORTED_EXTENSIONS: &[&str] = &[
    "jpg", "jpeg", "png", "gif", "bmp", "webp", "tif", "tiff", "ico", "pnm", "tga", "qoi",
];

pub struct Catalog {
    photos: Vec<Photo>,
    albums: Vec<Album>,
}

/// Stable 64-bit ID for a path: the first 8 bytes of its SHA-256.
pub fn stable_id(path: &Path) -> u64 {
    let digest = Sha256::digest(path.to_string_lossy().as_bytes());
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest[..8]);
    u64::from_le_bytes(prefix)
}

fn is_supported(path: &Path) -> bool {
    path.extension()
        .map(|ext| ext.to_string_lossy().to_lowercase())
        .is_some_and(|ext| SUPPORTED_EXTENSIONS.contains(&ext.as_str()))
}

impl Catalog {
    /// Walk `root` recursively and collect every supported image.
    pub fn scan(root: &Path) -> anyhow::Result<Self> {
        let root = root
            .canonicalize()
            .with_context(|| format!("Failed to resolve '{}'", root.display()))?;
        if !root.is_dir() {
            bail!("'{}' is not a directory", root.display());
        }

        log::info!("Scanning '{}'", root.display());
        let mut photos: Vec<Photo> = WalkDir::new(&root)
            .follow_links(true)
            .into_iter()
            .filter_map(|entry| match entry {
                Ok(entry) => Some(entry),
                Err(e) => {
                    log::warn!("Skipping unreadable entry: {e}");
                    None
                }
            })
            .filter(|entry| entry.file_type().is_file() && is_supported(entry.path()))
            .map(|entry| {
                let path = entry.into_path();
                let album = path.parent().unwrap_or(&root);
                Photo {
                    id: stable_id(&path),
                    album_id: stable_id(album),
                    path,
                }
            })
            .collect();
        photos.sort_by(|a, b| a.path.cmp(&b.path));

        let albums = Self::collect_albums(&root, &photos);
        log::info!("Found {} photos in {} albums", photos.len(), albums.len());

        Ok(Self { photos, albums })
    }

    fn collect_albums(root: &Path, photos: &[Photo]) -> Vec<Album> {
        let mut by_id: HashMap<u64, Album> = HashMap::new();
        for photo in photos {
            by_id
                .entry(photo.album_id)
                .or_insert_with(|| {
                    let dir = photo.path.parent().unwrap_or(root);
                    Album {
                        id: photo.album_id,
                        label: album_label(root, dir),
                        count: 0,
                    }
                })
                .count += 1;
        }

        let mut albums: Vec<Album> = by_id.into_values().collect();
        albums.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.label.cmp(&b.label)));
        albums
    }

    pub fn photos(&self) -> &[Photo] {
        &self.photos
    }

    /// Albums, largest first.
    pub fn albums(&self) -> &[Album] {
        &self.albums
    }

    /// Photos belonging to any of `album_ids`.
    pub fn photos_in(&self, album_ids: &[u64]) -> Vec<Photo> {
        self.photos
            .iter()
            .filter(|p| album_ids.contains(&p.album_id))
            .cloned()
            .collect()
    }
}

/// Albums and photo paths seen by previous `index` runs.
///
/// Lets `search` and `albums` resolve IDs without rescanning the library.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct Manifest {
    albums: BTreeMap<u64, Album>,
    photos: BTreeMap<u64, Photo>,
    #[serde(skip)]
    path: PathBuf,
}

impl Manifest {
    pub fn load(base_path: &Path) -> anyhow::Result<Self> {
        let path = base_path.join(MANIFEST_FILE_NAME);
        let mut manifest = if path.exists() {
            let data = std::fs::read(&path)
                .with_context(|| format!("Failed to read '{}'", path.display()))?;
            serde_json::from_slice::<Self>(&data).context("Catalog manifest is malformed")?
        } else {
            Self::default()
        };
        manifest.path = path;
        Ok(manifest)
    }

    pub fn save(&self) -> anyhow::Result<()> {
        let data = serde_json::to_vec_pretty(self)?;
        std::fs::write(&self.path, data)
            .with_context(|| format!("Failed to write '{}'", self.path.display()))
    }

    /// Replace the listed albums (and their photos) with what `catalog` holds.
    pub fn record(&mut self, catalog: &Catalog, album_ids: &[u64]) {
        self.forget(album_ids);
        for album in catalog.albums().iter().filter(|a| album_ids.contains(&a.id)) {
            self.albums.insert(album.id, album.clone());
        }
        for photo in catalog.photos_in(album_ids) {
            self.photos.insert(photo.id, photo);
        }
    }

    pub fn forget(&mut self, album_ids: &[u64]) {
        self.albums.retain(|id, _| !album_ids.contains(id));
        self.photos.retain(|_, p| !album_ids.contains(&p.album_id));
    }

    /// Albums, largest first.
    pub fn albums(&self) -> Vec<&Album> {
        let mut albums: Vec<&Album> = self.albums.values().collect();
        albums.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.label.cmp(&b.label)));
        albums
    }

    pub fn photo(&self, id: u64) -> Option<&Photo> {
        self.photos.get(&id)
    }
}

fn album_label(root: &Path, dir: &Path) -> String {
    match dir.strip_prefix(root) {
        Ok(rel) if rel.as_os_str().is_empty() => root
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| root.display().to_string()),
        Ok(rel) => rel.display().to_string(),
        Err(_) => dir.display().to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn touch(path: &Path) {
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, b"x").unwrap();
    }

    #[test]
    fn test_scan_groups_by_directory() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        touch(&root.join("a.jpg"));
        touch(&root.join("trip/1.JPG"));
        touch(&root.join("trip/2.png"));
        touch(&root.join("trip/notes.txt"));
        touch(&root.join("trip/day2/3.webp"));

        let catalog = Catalog::scan(root).unwrap();
        assert_eq!(catalog.photos().len(), 4);

        let labels: Vec<(&str, usize)> = catalog
            .albums()
            .iter()
            .map(|a| (a.label.as_str(), a.count))
            .collect();
        assert_eq!(labels[0], ("trip", 2));
        assert_eq!(catalog.albums().len(), 3);

        let trip = &catalog.albums()[0];
        let trip_photos = catalog.photos_in(&[trip.id]);
        assert_eq!(trip_photos.len(), 2);
        assert!(trip_photos.iter().all(|p| p.path.parent().unwrap().ends_with("trip")));
    }

    #[test]
    fn test_ids_are_stable_across_scans() {
        let dir = tempfile::tempdir().unwrap();
        touch(&dir.path().join("album/x.jpg"));
        touch(&dir.path().join("album/y.jpg"));

        let first = Catalog::scan(dir.path()).unwrap();
        let second = Catalog::scan(dir.path()).unwrap();

        let ids = |c: &Catalog| c.photos().iter().map(|p| p.id).collect::<Vec<_>>();
        assert_eq!(ids(&first), ids(&second));
        assert_ne!(first.photos()[0].id, first.photos()[1].id);
        assert_eq!(first.photos()[0].album_id, first.photos()[1].album_id);
    }

    #[test]
    fn test_scan_rejects_file() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("a.jpg");
        touch(&file);
        assert!(Catalog::scan(&file).is_err());
        assert!(Catalog::scan(&dir.path().join("missing")).is_err());
    }

    #[test]
    fn test_manifest_record_and_forget() {
        let dir = tempfile::tempdir().unwrap();
        let library = dir.path().join("library");
        touch(&library.join("a/1.jpg"));
        touch(&library.join("a/2.jpg"));
        touch(&library.join("b/3.jpg"));
        let catalog = Catalog::scan(&library).unwrap();
        let all: Vec<u64> = catalog.albums().iter().map(|a| a.id).collect();

        let mut manifest = Manifest::load(dir.path()).unwrap();
        manifest.record(&catalog, &all);
        manifest.save().unwrap();

        let mut manifest = Manifest::load(dir.path()).unwrap();
        assert_eq!(manifest.albums().len(), 2);
        assert_eq!(manifest.albums()[0].label, "a");
        let photo = &catalog.photos()[0];
        assert_eq!(manifest.photo(photo.id), Some(photo));

        let a = manifest.albums()[0].id;
        manifest.forget(&[a]);
        assert_eq!(manifest.albums().len(), 1);
        assert!(manifest.photo(photo.id).is_none());
    }
}
