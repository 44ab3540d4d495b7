//! # mediastore - Accès aux médias mis en cache
//!
//! Point d'entrée des appelants : combine le cache des médias principaux
//! (`mediacache`) et le cache des vignettes (`mediathumbs`).
//!
//! Les deux caches sont indépendants. Une vignette qui échoue ne fait jamais
//! échouer ni ne retarde le média principal correspondant.
//!
//! ## Utilisation
//!
//! ```rust,no_run
//! use mediaconfig::Config;
//! use mediastore::{init_logging, MediaStore};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load_config("")?;
//!     init_logging(&config);
//!
//!     let store = MediaStore::from_config(&config).await?;
//!     let path = store
//!         .ensure_cached("42", "https://example.com/clip.mp4", "clip.mp4")
//!         .await?;
//!     println!("{}", path.display());
//!     Ok(())
//! }
//! ```

pub mod logging;

use futures_util::future::join_all;
use mediacache::{
    AssetConfig, Cache, CacheConfigExt, CacheSettings, CacheStats, CancellationToken, ClearReport,
    Result, SpaceProbe,
};
use mediaconfig::Config;
use mediathumbs::{ThumbnailCache, ThumbnailCacheConfigExt};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::task::JoinHandle;
use tracing::{info, warn};

pub use logging::init_logging;

const DEFAULT_ASSET_CACHE_DIR: &str = "cache_media";

/// Élément d'un préchargement
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreloadItem {
    pub id: String,
    pub url: String,
    #[serde(default, alias = "fileName")]
    pub file_name: String,
    #[serde(default, alias = "thumbnailUrl", skip_serializing_if = "Option::is_none")]
    pub thumbnail_url: Option<String>,
}

impl PreloadItem {
    /// Lit une liste d'éléments au format JSON
    pub fn parse_manifest(json: &str) -> serde_json::Result<Vec<PreloadItem>> {
        serde_json::from_str(json)
    }
}

/// Bilan d'un préchargement
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PreloadReport {
    pub successful: usize,
    pub total: usize,
}

/// Statistiques des deux caches
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StoreStats {
    pub item_count: usize,
    pub total_bytes: u64,
    pub in_flight: usize,
    pub thumbnails: CacheStats,
}

type ThumbnailTask = JoinHandle<Option<PathBuf>>;

/// Cache des médias et des vignettes
#[derive(Debug, Clone)]
pub struct MediaStore {
    assets: Arc<Cache<AssetConfig>>,
    thumbnails: ThumbnailCache,
    /// Vignettes lancées par `preload` et pas encore attendues
    thumbnail_tasks: Arc<Mutex<Vec<ThumbnailTask>>>,
}

impl MediaStore {
    pub fn new(assets: Arc<Cache<AssetConfig>>, thumbnails: ThumbnailCache) -> Self {
        Self {
            assets,
            thumbnails,
            thumbnail_tasks: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Ouvre les deux caches avec les paramètres fournis
    pub async fn open(assets: CacheSettings, thumbnails: CacheSettings) -> Result<Self> {
        let assets = Cache::<AssetConfig>::open(assets).await?;
        let thumbnails = ThumbnailCache::open(thumbnails).await?;
        Ok(Self::new(Arc::new(assets), thumbnails))
    }

    /// Comme [`MediaStore::open`], avec une mesure d'espace disque fournie
    pub async fn open_with_probe(
        assets: CacheSettings,
        thumbnails: CacheSettings,
        probe: Arc<dyn SpaceProbe>,
    ) -> Result<Self> {
        let assets = Cache::<AssetConfig>::open_with_probe(assets, Arc::clone(&probe)).await?;
        let thumbnails = ThumbnailCache::open_with_probe(thumbnails, probe).await?;
        Ok(Self::new(Arc::new(assets), thumbnails))
    }

    /// Ouvre les deux caches selon la configuration (`host.media`, `host.thumbnails`)
    pub async fn from_config(config: &Config) -> anyhow::Result<Self> {
        let assets = config.create_cache::<AssetConfig>(DEFAULT_ASSET_CACHE_DIR).await?;
        let thumbnails = config.create_thumbnail_cache().await?;
        Ok(Self::new(assets, thumbnails))
    }

    pub fn assets(&self) -> &Arc<Cache<AssetConfig>> {
        &self.assets
    }

    pub fn thumbnails(&self) -> &ThumbnailCache {
        &self.thumbnails
    }

    /// Chemin du média en cache, sans téléchargement
    pub async fn get_cached_path(&self, id: &str) -> Option<PathBuf> {
        self.assets.get(id).await
    }

    /// Chemin du média, téléchargé si nécessaire
    pub async fn ensure_cached(&self, id: &str, url: &str, file_name: &str) -> Result<PathBuf> {
        self.assets.ensure_cached(id, url, file_name).await
    }

    pub async fn ensure_cached_with_cancel(
        &self,
        id: &str,
        url: &str,
        file_name: &str,
        cancel: &CancellationToken,
    ) -> Result<PathBuf> {
        self.assets
            .ensure_cached_with_cancel(id, url, file_name, Some(cancel))
            .await
    }

    /// Chemin de la vignette en cache, sans téléchargement
    pub async fn get_thumbnail_path(&self, id: &str) -> Option<PathBuf> {
        self.thumbnails.get(id).await
    }

    /// Interrompt le téléchargement en cours d'un média
    pub async fn cancel(&self, id: &str) -> bool {
        self.assets.cancel(id).await
    }

    /// Met en cache une liste de médias
    ///
    /// Les vignettes sont lancées en tâche de fond et ne comptent pas dans le
    /// bilan ; [`MediaStore::wait_thumbnails`] permet de les attendre. Les
    /// médias sont téléchargés en parallèle ; un échec est journalisé et
    /// n'interrompt pas les autres.
    pub async fn preload(&self, items: &[PreloadItem]) -> PreloadReport {
        let started: Vec<ThumbnailTask> = items
            .iter()
            .filter(|item| item.thumbnail_url.is_some())
            .map(|item| {
                self.thumbnails
                    .preload_detached(item.id.clone(), item.thumbnail_url.clone())
            })
            .collect();
        self.lock_tasks().extend(started);

        let results = join_all(
            items
                .iter()
                .map(|item| self.assets.ensure_cached(&item.id, &item.url, &item.file_name)),
        )
        .await;

        let mut successful = 0;
        for (item, result) in items.iter().zip(results) {
            match result {
                Ok(_) => successful += 1,
                Err(e) => warn!(id = %item.id, code = e.code(), error = %e, "Preload failed"),
            }
        }

        let report = PreloadReport {
            successful,
            total: items.len(),
        };
        info!(
            "Preload finished: {}/{} assets cached",
            report.successful, report.total
        );
        report
    }

    /// Attend les vignettes lancées par [`MediaStore::preload`]
    ///
    /// Retourne le nombre de vignettes disponibles en cache parmi elles.
    pub async fn wait_thumbnails(&self) -> usize {
        let tasks = std::mem::take(&mut *self.lock_tasks());
        let mut cached = 0;
        for result in join_all(tasks).await {
            match result {
                Ok(Some(_)) => cached += 1,
                Ok(None) => {}
                Err(e) => warn!(error = %e, "Thumbnail task failed"),
            }
        }
        cached
    }

    fn lock_tasks(&self) -> std::sync::MutexGuard<'_, Vec<ThumbnailTask>> {
        self.thumbnail_tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Vide les deux caches
    pub async fn clear(&self) -> ClearReport {
        let assets = self.assets.clear().await;
        let thumbnails = self.thumbnails.clear().await;
        ClearReport {
            deleted_count: assets.deleted_count + thumbnails.deleted_count,
        }
    }

    pub async fn stats(&self) -> StoreStats {
        let assets = self.assets.stats().await;
        StoreStats {
            item_count: assets.item_count,
            total_bytes: assets.total_bytes,
            in_flight: assets.in_flight,
            thumbnails: self.thumbnails.stats().await,
        }
    }
}
