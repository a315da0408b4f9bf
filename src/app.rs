use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use homedir::my_home;

use crate::config::Config;
use crate::semantic::translate::Translator;
use crate::semantic::{
    ClipImageEncoder, ClipTextEncoder, Collaborators, FileEmbeddingStore, HttpTranslator,
    ImageThumbnailLoader, SearchCoordinator,
};

/// Application paths
#[derive(Debug, Clone)]
pub struct AppPaths {
    pub base_path: PathBuf,
}

/// Builds configuration, storage and the search coordinator.
pub struct AppFactory;

impl AppFactory {
    pub fn get_paths() -> Result<AppPaths> {
        let base_path = Self::get_base_path()?;

        std::fs::create_dir_all(&base_path)
            .context("Failed to create application base directory")?;

        Ok(AppPaths { base_path })
    }

    fn get_base_path() -> Result<PathBuf> {
        if let Ok(path) = std::env::var("PICSIFT_BASE_PATH") {
            return Ok(PathBuf::from(path));
        }

        let home = my_home()
            .map_err(|e| anyhow::anyhow!("Could not determine home directory: {e:?}"))?
            .context("Home directory path is empty")?;
        Ok(home.join(".local/share/picsift"))
    }

    pub fn create_config(paths: &AppPaths) -> Result<Config> {
        Config::load_with(&paths.base_path).context("Failed to load config.yaml")
    }

    pub fn create_store(config: &Config) -> Result<Arc<FileEmbeddingStore>> {
        let settings = config.model_settings();
        let store = FileEmbeddingStore::open(
            config.embeddings_path(),
            settings.model_id_hash(),
            settings.dimensions,
        )
        .context("Failed to open embedding store")?;
        Ok(Arc::new(store))
    }

    fn create_translator(config: &Config) -> Result<Option<Arc<dyn Translator>>> {
        let tr = &config.translation;
        if !tr.enabled {
            return Ok(None);
        }

        log::debug!("Using translation service at {}", tr.endpoint);
        let translator = HttpTranslator::new(
            &tr.endpoint,
            &tr.source,
            &tr.target,
            tr.api_key.clone(),
            Duration::from_secs(tr.timeout_secs),
        )
        .context("Failed to create translation client")?;
        let translator: Arc<dyn Translator> = Arc::new(translator);
        Ok(Some(translator))
    }

    /// Wire the default collaborators around `config`.
    pub fn create_coordinator(config: &Config) -> Result<SearchCoordinator> {
        let settings = config.model_settings();

        let collaborators = Collaborators {
            image_encoder: Arc::new(ClipImageEncoder::new(settings.clone())),
            text_encoder: Arc::new(ClipTextEncoder::new(settings)),
            thumbnails: Arc::new(ImageThumbnailLoader::new(config.encoding.thumbnail_size)),
            store: Self::create_store(config)?,
            translator: Self::create_translator(config)?,
        };

        Ok(SearchCoordinator::new(
            collaborators,
            config.search_settings(),
            config.pipeline_options(),
        ))
    }
}
