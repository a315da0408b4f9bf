//! Embedding persistence.
//!
//! File format: embeddings.bin
//!
//! Header (47 bytes):
//! - version: u8 (1)
//! - model_id: [u8; 32] (SHA256 hash of the image model name)
//! - dimensions: u16 (little-endian)
//! - entry_count: u64 (little-endian)
//! - checksum: u32 (CRC32 of header fields before checksum)
//!
//! Entries (repeated):
//! - photo_id: u64 (little-endian)
//! - album_id: u64 (little-endian)
//! - data_len: u32 (little-endian)
//! - data: [u8; data_len] (codec-encoded vector, kept opaque here)

use std::collections::{BTreeMap, HashMap};
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use crate::semantic::types::Embedding;

/// Current file format version
const FORMAT_VERSION: u8 = 1;

/// Header size in bytes: version(1) + model_id(32) + dimensions(2) + entry_count(8) + checksum(4)
const HEADER_SIZE: usize = 47;

/// Largest vector dimension the header can record
pub const MAX_DIMENSIONS: usize = u16::MAX as usize;

/// Upper bound on a single entry's data, anything larger is a broken file.
const MAX_ENTRY_BYTES: u32 = 1 << 20;

/// Errors that can occur during storage operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid file format: {0}")]
    InvalidFormat(String),

    #[error("Version mismatch: file version {0}, supported version {1}")]
    VersionMismatch(u8, u8),

    #[error("Model mismatch: file uses different model")]
    ModelMismatch,

    #[error("Checksum mismatch: file may be corrupted")]
    ChecksumMismatch,

    #[error("Dimension mismatch: expected {expected}, file has {got}")]
    DimensionMismatch { expected: usize, got: usize },

    #[error("Store lock poisoned")]
    Poisoned,
}

/// Persists embeddings keyed by photo ID.
///
/// Implementations must be safe to share between threads. A later write for
/// a photo ID replaces the earlier one.
pub trait EmbeddingStore: Send + Sync {
    fn upsert_all(&self, embeddings: Vec<Embedding>) -> Result<(), StoreError>;
    fn get_all(&self) -> Result<Vec<Embedding>, StoreError>;
    fn get_by_albums(&self, album_ids: &[u64]) -> Result<Vec<Embedding>, StoreError>;
    fn count(&self) -> Result<usize, StoreError>;
    /// Drop every embedding belonging to the given albums. Returns how many were removed.
    fn remove_albums(&self, album_ids: &[u64]) -> Result<usize, StoreError>;
    /// Number of stored embeddings per album ID.
    fn album_counts(&self) -> Result<HashMap<u64, usize>, StoreError>;
}

/// Embedding store held in memory and optionally mirrored to a file.
///
/// Reads return embeddings ordered by photo ID. Every write rewrites the
/// backing file atomically (temp file, fsync, rename) before the in-memory
/// state is replaced, so a failed write leaves both unchanged.
pub struct FileEmbeddingStore {
    entries: RwLock<BTreeMap<u64, Embedding>>,
    file: Option<StoreFile>,
}

struct StoreFile {
    path: PathBuf,
    model_id: [u8; 32],
    dimensions: usize,
}

impl FileEmbeddingStore {
    /// A store that never touches the filesystem.
    pub fn in_memory() -> Self {
        Self {
            entries: RwLock::new(BTreeMap::new()),
            file: None,
        }
    }

    /// Open the store at `path`, loading existing entries.
    ///
    /// A file written for another model or by a newer format version is
    /// ignored and will be replaced on the next write.
    pub fn open(
        path: PathBuf,
        model_id: [u8; 32],
        dimensions: usize,
    ) -> Result<Self, StoreError> {
        let file = StoreFile {
            path,
            model_id,
            dimensions,
        };

        let entries = if file.path.exists() {
            match file.load() {
                Ok(entries) => {
                    log::info!("Loaded {} embeddings from storage", entries.len());
                    entries
                }
                Err(StoreError::ModelMismatch) => {
                    log::warn!("Model changed, starting with an empty embedding store");
                    BTreeMap::new()
                }
                Err(StoreError::VersionMismatch(file_ver, _)) => {
                    log::warn!(
                        "Storage version {} unsupported, starting with an empty embedding store",
                        file_ver
                    );
                    BTreeMap::new()
                }
                Err(e) => {
                    log::error!("Failed to load embeddings: {}", e);
                    return Err(e);
                }
            }
        } else {
            log::info!("No existing embedding store, starting fresh");
            BTreeMap::new()
        };

        Ok(Self {
            entries: RwLock::new(entries),
            file: Some(file),
        })
    }

    /// Apply `mutate` to a copy of the entries, persist it, then swap it in.
    ///
    /// A failed save leaves the in-memory entries untouched. The copy means a
    /// write holds two full maps at once.
    fn commit(
        &self,
        mutate: impl FnOnce(&mut BTreeMap<u64, Embedding>) -> usize,
    ) -> Result<usize, StoreError> {
        let mut guard = self.entries.write().map_err(|_| StoreError::Poisoned)?;

        let mut next = guard.clone();
        let changed = mutate(&mut next);

        if let Some(file) = &self.file {
            file.save(&next)?;
        }

        *guard = next;
        Ok(changed)
    }

    fn read<R>(&self, f: impl FnOnce(&BTreeMap<u64, Embedding>) -> R) -> Result<R, StoreError> {
        let guard = self.entries.read().map_err(|_| StoreError::Poisoned)?;
        Ok(f(&guard))
    }
}

impl EmbeddingStore for FileEmbeddingStore {
    fn upsert_all(&self, embeddings: Vec<Embedding>) -> Result<(), StoreError> {
        if embeddings.is_empty() {
            return Ok(());
        }

        self.commit(|entries| {
            let count = embeddings.len();
            for embedding in embeddings {
                entries.insert(embedding.photo_id, embedding);
            }
            count
        })?;
        Ok(())
    }

    fn get_all(&self) -> Result<Vec<Embedding>, StoreError> {
        self.read(|entries| entries.values().cloned().collect())
    }

    fn get_by_albums(&self, album_ids: &[u64]) -> Result<Vec<Embedding>, StoreError> {
        self.read(|entries| {
            entries
                .values()
                .filter(|e| album_ids.contains(&e.album_id))
                .cloned()
                .collect()
        })
    }

    fn count(&self) -> Result<usize, StoreError> {
        self.read(|entries| entries.len())
    }

    fn remove_albums(&self, album_ids: &[u64]) -> Result<usize, StoreError> {
        let present = self.read(|entries| {
            entries
                .values()
                .any(|e| album_ids.contains(&e.album_id))
        })?;
        if !present {
            return Ok(0);
        }

        self.commit(|entries| {
            let before = entries.len();
            entries.retain(|_, e| !album_ids.contains(&e.album_id));
            before - entries.len()
        })
    }

    fn album_counts(&self) -> Result<HashMap<u64, usize>, StoreError> {
        self.read(|entries| {
            let mut counts = HashMap::new();
            for e in entries.values() {
                *counts.entry(e.album_id).or_insert(0) += 1;
            }
            counts
        })
    }
}

impl StoreFile {
    fn load(&self) -> Result<BTreeMap<u64, Embedding>, StoreError> {
        let file = File::open(&self.path)?;
        let mut reader = BufReader::new(file);

        let header = read_header(&mut reader)?;
        self.validate_header(&header)?;
        log::debug!(
            "Reading {} entries (format v{}) from {}",
            header.entry_count,
            header.version,
            self.path.display()
        );

        let mut entries = BTreeMap::new();
        for _ in 0..header.entry_count {
            let embedding = read_entry(&mut reader)?;
            entries.insert(embedding.photo_id, embedding);
        }

        Ok(entries)
    }

    fn save(&self, entries: &BTreeMap<u64, Embedding>) -> Result<(), StoreError> {
        let temp_path = self.path.with_extension("tmp");

        let result = self.write_to_file(&temp_path, entries);
        if result.is_err() {
            let _ = std::fs::remove_file(&temp_path);
            return result;
        }

        std::fs::rename(&temp_path, &self.path)?;
        Ok(())
    }

    fn write_to_file(
        &self,
        path: &Path,
        entries: &BTreeMap<u64, Embedding>,
    ) -> Result<(), StoreError> {
        let dimensions = u16::try_from(self.dimensions).map_err(|_| {
            StoreError::InvalidFormat(format!("dimensions {} do not fit the header", self.dimensions))
        })?;

        let file = File::create(path)?;
        let mut writer = BufWriter::new(file);

        let header = Header {
            version: FORMAT_VERSION,
            model_id: self.model_id,
            dimensions,
            entry_count: entries.len() as u64,
        };
        write_header(&mut writer, &header)?;

        for embedding in entries.values() {
            write_entry(&mut writer, embedding)?;
        }

        writer.flush()?;
        let file = writer.into_inner().map_err(|e| e.into_error())?;
        file.sync_all()?;

        Ok(())
    }

    fn validate_header(&self, header: &Header) -> Result<(), StoreError> {
        if header.model_id != self.model_id {
            return Err(StoreError::ModelMismatch);
        }

        if header.dimensions as usize != self.dimensions {
            return Err(StoreError::DimensionMismatch {
                expected: self.dimensions,
                got: header.dimensions as usize,
            });
        }

        Ok(())
    }
}

/// File header structure.
#[derive(Debug)]
struct Header {
    version: u8,
    model_id: [u8; 32],
    dimensions: u16,
    entry_count: u64,
}

fn read_header(reader: &mut impl Read) -> Result<Header, StoreError> {
    let mut header_bytes = [0u8; HEADER_SIZE];
    reader.read_exact(&mut header_bytes)?;

    let version = header_bytes[0];
    if version > FORMAT_VERSION {
        return Err(StoreError::VersionMismatch(version, FORMAT_VERSION));
    }
    if version == 0 {
        return Err(StoreError::InvalidFormat("version 0".to_string()));
    }

    let computed_checksum = crc32fast::hash(&header_bytes[0..43]);
    let stored_checksum = u32::from_le_bytes(slice_array(&header_bytes[43..47]));
    if stored_checksum != computed_checksum {
        return Err(StoreError::ChecksumMismatch);
    }

    Ok(Header {
        version,
        model_id: slice_array(&header_bytes[1..33]),
        dimensions: u16::from_le_bytes(slice_array(&header_bytes[33..35])),
        entry_count: u64::from_le_bytes(slice_array(&header_bytes[35..43])),
    })
}

fn write_header(writer: &mut impl Write, header: &Header) -> Result<(), StoreError> {
    let mut header_bytes = [0u8; HEADER_SIZE];

    header_bytes[0] = header.version;
    header_bytes[1..33].copy_from_slice(&header.model_id);
    header_bytes[33..35].copy_from_slice(&header.dimensions.to_le_bytes());
    header_bytes[35..43].copy_from_slice(&header.entry_count.to_le_bytes());

    let checksum = crc32fast::hash(&header_bytes[0..43]);
    header_bytes[43..47].copy_from_slice(&checksum.to_le_bytes());

    writer.write_all(&header_bytes)?;
    Ok(())
}

fn read_entry(reader: &mut impl Read) -> Result<Embedding, StoreError> {
    let mut word = [0u8; 8];
    reader.read_exact(&mut word)?;
    let photo_id = u64::from_le_bytes(word);

    reader.read_exact(&mut word)?;
    let album_id = u64::from_le_bytes(word);

    let mut len_bytes = [0u8; 4];
    reader.read_exact(&mut len_bytes)?;
    let data_len = u32::from_le_bytes(len_bytes);
    if data_len > MAX_ENTRY_BYTES {
        return Err(StoreError::InvalidFormat(format!(
            "entry for photo {photo_id} claims {data_len} bytes"
        )));
    }

    let mut data = vec![0u8; data_len as usize];
    reader.read_exact(&mut data)?;

    Ok(Embedding {
        photo_id,
        album_id,
        data,
    })
}

fn write_entry(writer: &mut impl Write, embedding: &Embedding) -> Result<(), StoreError> {
    let data_len = u32::try_from(embedding.data.len())
        .ok()
        .filter(|len| *len <= MAX_ENTRY_BYTES)
        .ok_or_else(|| {
            StoreError::InvalidFormat(format!(
                "embedding for photo {} is too large",
                embedding.photo_id
            ))
        })?;

    writer.write_all(&embedding.photo_id.to_le_bytes())?;
    writer.write_all(&embedding.album_id.to_le_bytes())?;
    writer.write_all(&data_len.to_le_bytes())?;
    writer.write_all(&embedding.data)?;
    Ok(())
}

fn slice_array<const N: usize>(bytes: &[u8]) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(bytes);
    out
}
