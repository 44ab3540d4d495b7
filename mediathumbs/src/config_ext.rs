//! Extension pour intégrer le cache de vignettes dans mediaconfig
//!
//! Ce module fournit le trait `ThumbnailCacheConfigExt` qui ajoute à
//! `mediaconfig::Config` les méthodes de gestion du cache de vignettes
//! (section `host.thumbnails`).

use crate::cache::{ThumbnailCache, ThumbnailConfig};
use anyhow::Result;
use mediacache::CacheConfigExt;
use mediaconfig::Config;

const DEFAULT_THUMBNAIL_CACHE_DIR: &str = "cache_thumbnails";
const DEFAULT_THUMBNAIL_CACHE_SIZE: usize = 200;

/// Trait d'extension pour gérer le cache de vignettes dans mediaconfig
///
/// # Exemple
///
/// ```rust,ignore
/// use mediaconfig::Config;
/// use mediathumbs::ThumbnailCacheConfigExt;
///
/// let config = Config::load_config("")?;
/// let thumbs = config.create_thumbnail_cache().await?;
/// let path = thumbs.request("42", Some("https://example.com/42.jpg")).await;
/// ```
pub trait ThumbnailCacheConfigExt {
    /// Répertoire du cache de vignettes (default: "cache_thumbnails")
    fn get_thumbnails_dir(&self) -> Result<String>;

    /// Définit le répertoire du cache de vignettes
    fn set_thumbnails_dir(&self, directory: String) -> Result<()>;

    /// Nombre maximal de vignettes (default: 200)
    fn get_thumbnails_size(&self) -> Result<usize>;

    /// Définit le nombre maximal de vignettes
    fn set_thumbnails_size(&self, size: usize) -> Result<()>;

    /// Crée le cache de vignettes configuré
    fn create_thumbnail_cache(
        &self,
    ) -> impl std::future::Future<Output = Result<ThumbnailCache>> + Send;
}

impl ThumbnailCacheConfigExt for Config {
    fn get_thumbnails_dir(&self) -> Result<String> {
        self.get_cache_dir("thumbnails", DEFAULT_THUMBNAIL_CACHE_DIR)
    }

    fn set_thumbnails_dir(&self, directory: String) -> Result<()> {
        self.set_cache_dir("thumbnails", directory)
    }

    fn get_thumbnails_size(&self) -> Result<usize> {
        self.get_cache_size("thumbnails", DEFAULT_THUMBNAIL_CACHE_SIZE)
    }

    fn set_thumbnails_size(&self, size: usize) -> Result<()> {
        self.set_cache_size("thumbnails", size)
    }

    async fn create_thumbnail_cache(&self) -> Result<ThumbnailCache> {
        let settings = self.cache_settings::<ThumbnailConfig>(DEFAULT_THUMBNAIL_CACHE_DIR)?;
        Ok(ThumbnailCache::open(settings).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_thumbnail_settings() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load_config(&dir.path().to_string_lossy()).unwrap();

        assert_eq!(config.get_thumbnails_size().unwrap(), 200);
        config.set_thumbnails_size(50).unwrap();
        assert_eq!(config.get_thumbnails_size().unwrap(), 50);

        let thumbs_dir = config.get_thumbnails_dir().unwrap();
        assert!(thumbs_dir.ends_with("cache_thumbnails"));
    }
}
