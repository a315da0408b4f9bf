use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::semantic::coordinator::DEFAULT_SCAN_CHUNK;
use crate::semantic::encoders::{DEFAULT_DIMENSIONS, DEFAULT_IMAGE_MODEL, DEFAULT_TEXT_MODEL};
use crate::semantic::store::MAX_DIMENSIONS;
use crate::semantic::{
    EncodingMode, ModelSettings, PipelineOptions, SearchSettings, DEFAULT_THRESHOLD, DEFAULT_TOP_K,
};

const CONFIG_FILE_NAME: &str = "config.yaml";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to access {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("config is malformed: {0}")]
    Malformed(#[from] serde_yml::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SearchConfig {
    /// Minimum cosine similarity for a match [-1.0, 1.0]
    #[serde(default = "default_threshold")]
    pub threshold: f32,

    /// Maximum number of results
    #[serde(default = "default_top_k")]
    pub top_k: usize,

    /// Embeddings scored per parallel scan task
    #[serde(default = "default_scan_chunk")]
    pub scan_chunk: usize,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_THRESHOLD,
            top_k: DEFAULT_TOP_K,
            scan_chunk: DEFAULT_SCAN_CHUNK,
        }
    }
}

fn default_threshold() -> f32 {
    DEFAULT_THRESHOLD
}

fn default_top_k() -> usize {
    DEFAULT_TOP_K
}

fn default_scan_chunk() -> usize {
    DEFAULT_SCAN_CHUNK
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EncodingConfig {
    #[serde(default)]
    pub mode: EncodingMode,

    /// Inference threads in pipelined mode
    #[serde(default = "default_consumers")]
    pub consumers: usize,

    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    #[serde(default = "default_progress_interval_ms")]
    pub progress_interval_ms: u64,

    #[serde(default = "default_progress_delay_ms")]
    pub progress_delay_ms: u64,

    /// Longest side of the thumbnails handed to the image encoder
    #[serde(default = "default_thumbnail_size")]
    pub thumbnail_size: u32,
}

impl Default for EncodingConfig {
    fn default() -> Self {
        Self {
            mode: EncodingMode::default(),
            consumers: default_consumers(),
            queue_capacity: default_queue_capacity(),
            progress_interval_ms: default_progress_interval_ms(),
            progress_delay_ms: default_progress_delay_ms(),
            thumbnail_size: default_thumbnail_size(),
        }
    }
}

fn default_consumers() -> usize {
    2
}

fn default_queue_capacity() -> usize {
    8
}

fn default_progress_interval_ms() -> u64 {
    500
}

fn default_progress_delay_ms() -> u64 {
    50
}

fn default_thumbnail_size() -> u32 {
    224
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ModelsConfig {
    #[serde(default = "default_image_model")]
    pub image: String,

    #[serde(default = "default_text_model")]
    pub text: String,

    /// Output dimensions shared by both models
    #[serde(default = "default_dimensions")]
    pub dimensions: usize,

    /// Model download directory, relative paths resolve against the base path
    #[serde(default = "default_cache_dir")]
    pub cache_dir: PathBuf,
}

impl Default for ModelsConfig {
    fn default() -> Self {
        Self {
            image: default_image_model(),
            text: default_text_model(),
            dimensions: default_dimensions(),
            cache_dir: default_cache_dir(),
        }
    }
}

fn default_image_model() -> String {
    DEFAULT_IMAGE_MODEL.to_string()
}

fn default_text_model() -> String {
    DEFAULT_TEXT_MODEL.to_string()
}

fn default_dimensions() -> usize {
    DEFAULT_DIMENSIONS
}

fn default_cache_dir() -> PathBuf {
    PathBuf::from("models")
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TranslationConfig {
    #[serde(default)]
    pub enabled: bool,

    /// LibreTranslate-compatible service root
    #[serde(default = "default_endpoint")]
    pub endpoint: String,

    #[serde(default = "default_source")]
    pub source: String,

    #[serde(default = "default_target")]
    pub target: String,

    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
}

impl Default for TranslationConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            endpoint: default_endpoint(),
            source: default_source(),
            target: default_target(),
            timeout_secs: default_timeout_secs(),
            api_key: None,
        }
    }
}

fn default_endpoint() -> String {
    "http://127.0.0.1:5000".to_string()
}

fn default_source() -> String {
    "auto".to_string()
}

fn default_target() -> String {
    "en".to_string()
}

fn default_timeout_secs() -> u64 {
    10
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub search: SearchConfig,
    #[serde(default)]
    pub encoding: EncodingConfig,
    #[serde(default)]
    pub models: ModelsConfig,
    #[serde(default)]
    pub translation: TranslationConfig,

    #[serde(skip_serializing, skip_deserializing)]
    base_path: PathBuf,
}

impl Config {
    fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::Invalid(msg));

        if !(-1.0..=1.0).contains(&self.search.threshold) {
            return invalid(format!(
                "search.threshold must be between -1.0 and 1.0, got {}",
                self.search.threshold
            ));
        }
        if self.search.top_k == 0 {
            return invalid("search.top_k must be greater than 0".to_string());
        }
        if self.search.scan_chunk == 0 {
            return invalid("search.scan_chunk must be greater than 0".to_string());
        }

        let enc = &self.encoding;
        if enc.consumers == 0 {
            return invalid("encoding.consumers must be greater than 0".to_string());
        }
        if enc.queue_capacity == 0 {
            return invalid("encoding.queue_capacity must be greater than 0".to_string());
        }
        if enc.thumbnail_size == 0 {
            return invalid("encoding.thumbnail_size must be greater than 0".to_string());
        }

        if self.models.dimensions == 0 {
            return invalid("models.dimensions must be greater than 0".to_string());
        }
        if self.models.dimensions > MAX_DIMENSIONS {
            return invalid(format!("models.dimensions must be at most {MAX_DIMENSIONS}"));
        }

        let tr = &self.translation;
        if tr.enabled && tr.endpoint.trim().is_empty() {
            return invalid("translation.endpoint is required when translation is enabled".to_string());
        }
        if tr.timeout_secs == 0 {
            return invalid("translation.timeout_secs must be greater than 0".to_string());
        }

        Ok(())
    }

    /// Load `config.yaml` from `base_path`, creating it with defaults if missing.
    pub fn load_with(base_path: &Path) -> Result<Self, ConfigError> {
        let path = base_path.join(CONFIG_FILE_NAME);
        let io_err = |source| ConfigError::Io {
            path: path.clone(),
            source,
        };

        std::fs::create_dir_all(base_path).map_err(io_err)?;

        // create new if does not exist
        if !path.exists() {
            let defaults = serde_yml::to_string(&Self::default())?;
            std::fs::write(&path, defaults).map_err(io_err)?;
        }

        let config_str = std::fs::read_to_string(&path).map_err(io_err)?;
        let mut config: Self = serde_yml::from_str(&config_str)?;
        config.base_path = base_path.to_path_buf();

        config.validate()?;

        // resave in case config version needs an upgrade
        if config_str != serde_yml::to_string(&config)? {
            config.save()?;
        }

        Ok(config)
    }

    pub fn save(&self) -> Result<(), ConfigError> {
        let path = self.base_path.join(CONFIG_FILE_NAME);
        let config_str = serde_yml::to_string(&self)?;
        std::fs::write(&path, config_str).map_err(|source| ConfigError::Io { path, source })
    }

    pub fn embeddings_path(&self) -> PathBuf {
        self.base_path.join("embeddings.bin")
    }

    pub fn model_settings(&self) -> ModelSettings {
        let cache_dir = if self.models.cache_dir.is_absolute() {
            self.models.cache_dir.clone()
        } else {
            self.base_path.join(&self.models.cache_dir)
        };

        ModelSettings {
            image_model: self.models.image.clone(),
            text_model: self.models.text.clone(),
            dimensions: self.models.dimensions,
            cache_dir,
        }
    }

    pub fn search_settings(&self) -> SearchSettings {
        SearchSettings {
            threshold: self.search.threshold,
            top_k: self.search.top_k,
            scan_chunk: self.search.scan_chunk,
        }
    }

    pub fn pipeline_options(&self) -> PipelineOptions {
        PipelineOptions {
            mode: self.encoding.mode,
            consumers: self.encoding.consumers,
            queue_capacity: self.encoding.queue_capacity,
            progress_interval: Duration::from_millis(self.encoding.progress_interval_ms),
            progress_delay: Duration::from_millis(self.encoding.progress_delay_ms),
        }
    }
}
