use std::path::Path;

use anyhow::{bail, Context};
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use serde::Serialize;
use tracing_subscriber::EnvFilter;

mod app;
mod catalog;
mod cli;
mod config;
mod lock;
mod semantic;
#[cfg(test)]
mod tests;

use app::{AppFactory, AppPaths};
use catalog::{Catalog, Manifest};
use lock::StoreLock;
use semantic::{
    CancelToken, EmbeddingStore, EncodingMode, ImageThumbnailLoader, Progress, SearchNotice,
    SearchQuery, SearchRange,
};

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let args = cli::Args::parse();
    let paths = AppFactory::get_paths()?;

    match args.command {
        cli::Command::Index {
            dir,
            albums,
            sequential,
        } => index(&paths, &dir, albums, sequential),

        cli::Command::Search {
            text,
            image,
            albums,
            threshold,
            limit,
            json,
        } => {
            let mut config = AppFactory::create_config(&paths)?;
            if let Some(threshold) = threshold {
                if !(-1.0..=1.0).contains(&threshold) {
                    bail!("--threshold must be between -1.0 and 1.0");
                }
                config.search.threshold = threshold;
            }
            if let Some(limit) = limit {
                if limit == 0 {
                    bail!("--limit must be greater than 0");
                }
                config.search.top_k = limit;
            }

            let coordinator = AppFactory::create_coordinator(&config)?;
            if !coordinator.has_embeddings()? {
                println!("No photos indexed yet, run `picsift index <DIR>` first");
                return Ok(());
            }

            let query = match image {
                Some(path) => SearchQuery::Image(
                    ImageThumbnailLoader::new(config.encoding.thumbnail_size)
                        .open(&path)
                        .with_context(|| format!("Failed to open '{}'", path.display()))?,
                ),
                None => SearchQuery::Text(text.unwrap_or_default()),
            };

            let outcome = coordinator.search(&query, &SearchRange::albums(albums))?;
            for notice in &outcome.notices {
                match notice {
                    SearchNotice::TranslationFallback { reason } => {
                        eprintln!("Translation unavailable ({reason}), searched with the original text")
                    }
                }
            }

            let manifest = Manifest::load(&paths.base_path)?;
            let hits: Vec<SearchHit> = outcome
                .matches
                .iter()
                .map(|m| SearchHit {
                    photo_id: m.photo_id,
                    score: m.score,
                    path: manifest
                        .photo(m.photo_id)
                        .map(|p| p.path.display().to_string()),
                })
                .collect();

            if json {
                println!("{}", serde_json::to_string_pretty(&hits)?);
                return Ok(());
            }

            if hits.is_empty() {
                println!("No matches");
                return Ok(());
            }
            for hit in hits {
                let path = hit.path.unwrap_or_else(|| format!("#{}", hit.photo_id));
                println!("{:.3}  {}", hit.score, path);
            }
            Ok(())
        }

        cli::Command::Albums { json } => {
            let config = AppFactory::create_config(&paths)?;
            let store = AppFactory::create_store(&config)?;
            let indexed = store.album_counts()?;
            let manifest = Manifest::load(&paths.base_path)?;

            let albums: Vec<AlbumState> = manifest
                .albums()
                .into_iter()
                .map(|album| {
                    let indexed = indexed.get(&album.id).copied().unwrap_or(0);
                    AlbumState {
                        id: album.id,
                        label: album.label.clone(),
                        photos: album.count,
                        indexed,
                        searchable: indexed > 0,
                    }
                })
                .collect();

            if json {
                println!("{}", serde_json::to_string_pretty(&albums)?);
                return Ok(());
            }

            for album in albums {
                let state = if album.searchable { "searchable" } else { "pending" };
                println!(
                    "{:>20}  {:>6}/{:<6} {:<10} {}",
                    album.id, album.indexed, album.photos, state, album.label
                );
            }
            Ok(())
        }

        cli::Command::Forget { albums } => {
            let _lock = StoreLock::acquire(&paths.base_path)
                .context("Failed to lock the embedding store")?;
            let config = AppFactory::create_config(&paths)?;
            let coordinator = AppFactory::create_coordinator(&config)?;

            let removed = coordinator.forget_albums(&albums)?;

            let mut manifest = Manifest::load(&paths.base_path)?;
            manifest.forget(&albums);
            manifest.save()?;

            println!("{removed} embeddings removed");
            Ok(())
        }

        cli::Command::Status {} => {
            let config = AppFactory::create_config(&paths)?;
            let store = AppFactory::create_store(&config)?;
            let manifest = Manifest::load(&paths.base_path)?;

            println!("base path:   {}", paths.base_path.display());
            println!("image model: {}", config.models.image);
            println!("text model:  {}", config.models.text);
            println!("embeddings:  {}", store.count()?);
            println!(
                "albums:      {} searchable, {} known",
                store.album_counts()?.len(),
                manifest.albums().len()
            );
            println!(
                "translation: {}",
                if config.translation.enabled { config.translation.endpoint.as_str() } else { "disabled" }
            );
            Ok(())
        }
    }
}

#[derive(Serialize)]
struct SearchHit {
    photo_id: u64,
    score: f32,
    path: Option<String>,
}

#[derive(Serialize)]
struct AlbumState {
    id: u64,
    label: String,
    photos: usize,
    indexed: usize,
    searchable: bool,
}

fn index(paths: &AppPaths, dir: &Path, albums: Vec<u64>, sequential: bool) -> anyhow::Result<()> {
    let _lock =
        StoreLock::acquire(&paths.base_path).context("Failed to lock the embedding store")?;

    let mut config = AppFactory::create_config(paths)?;
    if sequential {
        config.encoding.mode = EncodingMode::Sequential;
    }

    let catalog = Catalog::scan(dir)?;
    let album_ids: Vec<u64> = if albums.is_empty() {
        catalog.albums().iter().map(|a| a.id).collect()
    } else {
        albums
    };
    let photos = catalog.photos_in(&album_ids);
    if photos.is_empty() {
        println!("No photos to index");
        return Ok(());
    }

    let coordinator = AppFactory::create_coordinator(&config)?;

    let cancel = CancelToken::new();
    {
        let cancel = cancel.clone();
        ctrlc::set_handler(move || {
            log::info!("Interrupted, stopping after the current photos");
            cancel.cancel();
        })
        .context("Failed to set Ctrl-C handler")?;
    }

    let pb = ProgressBar::new(photos.len() as u64).with_style(pb_style()?);
    pb.set_message("loading model");
    let on_progress = |progress: Progress| {
        pb.set_position((progress.completed + progress.skipped) as u64);
        if progress.finished {
            pb.finish_and_clear();
        } else if !progress.recent_cost.is_zero() {
            pb.set_message(format!("{} ms/photo", progress.recent_cost.as_millis()));
        }
    };

    let report = coordinator.start_encoding(&photos, Some(&on_progress), &cancel)?;

    let mut manifest = Manifest::load(&paths.base_path)?;
    manifest.record(&catalog, &album_ids);
    manifest.save()?;

    println!(
        "{}/{} photos encoded, {} skipped in {:.1}s{}",
        report.completed,
        report.total,
        report.skipped,
        report.elapsed.as_secs_f32(),
        if report.cancelled { " (cancelled)" } else { "" }
    );
    Ok(())
}

fn pb_style() -> anyhow::Result<ProgressStyle> {
    Ok(ProgressStyle::default_bar()
        .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta}) {msg}")?
        .progress_chars("#>-"))
}
