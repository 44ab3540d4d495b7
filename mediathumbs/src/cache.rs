//! Module de gestion du cache de vignettes
//!
//! Ce module spécialise le cache générique de `mediacache` pour les vignettes
//! de prévisualisation. Les échecs sont journalisés et jamais propagés : une
//! vignette manquante ne doit pas bloquer le média principal.

use mediacache::{
    CacheConfig, CacheSettings, CacheStats, ClearReport, Result, SpaceProbe, SysinfoProbe,
};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::task::JoinHandle;

/// Configuration pour le cache de vignettes.
///
/// Fichiers `thumb-{id}.{ext}`, extension `jpg` si l'URL n'en porte pas.
pub struct ThumbnailConfig;

impl CacheConfig for ThumbnailConfig {
    fn file_prefix() -> &'static str {
        "thumb"
    }

    fn cache_name() -> &'static str {
        "thumbnails"
    }

    fn default_extension() -> &'static str {
        "jpg"
    }

    fn default_max_items() -> usize {
        200
    }
}

/// Type alias pour le cache générique de vignettes.
pub type Cache = mediacache::Cache<ThumbnailConfig>;

/// Cache de vignettes à échec non bloquant
#[derive(Debug, Clone)]
pub struct ThumbnailCache {
    cache: Arc<Cache>,
}

impl ThumbnailCache {
    /// Ouvre le cache de vignettes
    pub async fn open(settings: CacheSettings) -> Result<Self> {
        Self::open_with_probe(settings, Arc::new(SysinfoProbe)).await
    }

    pub async fn open_with_probe(settings: CacheSettings, probe: Arc<dyn SpaceProbe>) -> Result<Self> {
        let cache = Cache::open_with_probe(settings, probe).await?;
        Ok(Self {
            cache: Arc::new(cache),
        })
    }

    /// Accès au cache générique sous-jacent
    pub fn inner(&self) -> &Arc<Cache> {
        &self.cache
    }

    /// Chemin de la vignette `id` si elle est en cache
    pub async fn get(&self, id: &str) -> Option<PathBuf> {
        self.cache.get(id).await
    }

    /// Récupère (ou télécharge) la vignette `id`
    ///
    /// Retourne `None` sans erreur si aucune URL n'est fournie ou si le
    /// téléchargement échoue.
    pub async fn request(&self, id: &str, url: Option<&str>) -> Option<PathBuf> {
        let url = url.filter(|u| !u.trim().is_empty())?;

        match self.cache.ensure_cached(id, url, "").await {
            Ok(path) => Some(path),
            Err(e) => {
                tracing::warn!(
                    "Thumbnail {} unavailable ({}): {}",
                    id,
                    e.code(),
                    e
                );
                None
            }
        }
    }

    /// Lance la récupération de la vignette en tâche de fond
    ///
    /// L'appelant peut ignorer le handle : le résultat est alors perdu mais
    /// la vignette est tout de même mise en cache.
    pub fn preload_detached(&self, id: String, url: Option<String>) -> JoinHandle<Option<PathBuf>> {
        let this = self.clone();
        tokio::spawn(async move { this.request(&id, url.as_deref()).await })
    }

    pub async fn clear(&self) -> ClearReport {
        self.cache.clear().await
    }

    pub async fn stats(&self) -> CacheStats {
        self.cache.stats().await
    }
}
