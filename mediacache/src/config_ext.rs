//! Extension pour intégrer la gestion des caches dans mediaconfig
//!
//! Ce module fournit le trait `CacheConfigExt` qui ajoute à
//! `mediaconfig::Config` les méthodes de lecture des paramètres d'un cache
//! (`host.<cache_name>.*`) et des téléchargements (`host.downloads.*`).

use crate::cache::{Cache, CacheConfig, CacheSettings, DEFAULT_MAX_BYTES};
use crate::disk_guard::MB;
use crate::eviction::EvictionKind;
use crate::retry::RetryPolicy;
use anyhow::Result;
use mediaconfig::Config;
use serde_yaml::{Number, Value};
use std::sync::Arc;
use std::time::Duration;

/// Trait d'extension pour ajouter la gestion des caches à mediaconfig
///
/// # Exemple
///
/// ```rust,ignore
/// use mediaconfig::Config;
/// use mediacache::{AssetConfig, CacheConfigExt};
///
/// let config = Config::load_config("")?;
/// let cache_dir = config.get_cache_dir("media", "cache_media")?;
/// let cache = config.create_cache::<AssetConfig>("cache_media").await?;
/// ```
pub trait CacheConfigExt {
    /// Récupère le répertoire d'un cache (créé s'il n'existe pas)
    fn get_cache_dir(&self, cache_name: &str, default: &str) -> Result<String>;

    /// Définit le répertoire d'un cache (absolu ou relatif au config_dir)
    fn set_cache_dir(&self, cache_name: &str, directory: String) -> Result<()>;

    /// Récupère le nombre maximal d'éléments d'un cache
    fn get_cache_size(&self, cache_name: &str, default: usize) -> Result<usize>;

    /// Définit le nombre maximal d'éléments d'un cache
    fn set_cache_size(&self, cache_name: &str, size: usize) -> Result<()>;

    /// Politique d'éviction (`count` ou `bytes`)
    fn get_cache_eviction(&self, cache_name: &str) -> Result<EvictionKind>;

    /// Quota en octets de la politique `bytes`
    fn get_cache_max_bytes(&self, cache_name: &str) -> Result<u64>;

    /// Construit les paramètres complets d'un cache
    fn cache_settings<C: CacheConfig>(&self, default_dir: &str) -> Result<CacheSettings>;

    /// Crée une instance de cache configurée
    fn create_cache<C: CacheConfig>(
        &self,
        default_dir: &str,
    ) -> impl std::future::Future<Output = Result<Arc<Cache<C>>>> + Send;
}

impl CacheConfigExt for Config {
    fn get_cache_dir(&self, cache_name: &str, default: &str) -> Result<String> {
        self.get_managed_dir(&["host", cache_name, "directory"], default)
    }

    fn set_cache_dir(&self, cache_name: &str, directory: String) -> Result<()> {
        self.set_managed_dir(&["host", cache_name, "directory"], directory)
    }

    fn get_cache_size(&self, cache_name: &str, default: usize) -> Result<usize> {
        match self.get_value(&["host", cache_name, "size"]) {
            Ok(Value::Number(n)) => Ok(n.as_u64().map(|v| v as usize).unwrap_or(default)),
            _ => Ok(default),
        }
    }

    fn set_cache_size(&self, cache_name: &str, size: usize) -> Result<()> {
        let n = Number::from(size);
        self.set_value(&["host", cache_name, "size"], Value::Number(n))
    }

    fn get_cache_eviction(&self, cache_name: &str) -> Result<EvictionKind> {
        match self.get_value(&["host", cache_name, "eviction"]) {
            Ok(Value::String(s)) => match s.parse::<EvictionKind>() {
                Ok(kind) => Ok(kind),
                Err(e) => {
                    tracing::warn!("{} for cache '{}', using count", e, cache_name);
                    Ok(EvictionKind::default())
                }
            },
            _ => Ok(EvictionKind::default()),
        }
    }

    fn get_cache_max_bytes(&self, cache_name: &str) -> Result<u64> {
        match self.get_value(&["host", cache_name, "max_bytes"]) {
            Ok(Value::Number(n)) => Ok(n.as_u64().unwrap_or(DEFAULT_MAX_BYTES)),
            _ => Ok(DEFAULT_MAX_BYTES),
        }
    }

    fn cache_settings<C: CacheConfig>(&self, default_dir: &str) -> Result<CacheSettings> {
        let name = C::cache_name();
        let dir = self.get_cache_dir(name, default_dir)?;

        let mut settings = CacheSettings::new(dir, self.get_cache_size(name, C::default_max_items())?);
        settings.eviction = self.get_cache_eviction(name)?;
        settings.max_bytes = self.get_cache_max_bytes(name)?;
        settings.safety_buffer = self.get_download_safety_buffer_mb()? * MB;
        settings.low_space_threshold = self.get_download_low_space_warning_mb()? * MB;
        settings.estimated_size = self.get_download_estimated_size_mb()? * MB;
        settings.timeout = Duration::from_secs(self.get_download_timeout_secs()?);
        settings.max_redirects = self.get_download_max_redirects()?;
        settings.retry = RetryPolicy::new(
            self.get_download_retry_attempts()? as u32,
            Duration::from_millis(self.get_download_retry_initial_delay_ms()?),
        );
        Ok(settings)
    }

    async fn create_cache<C: CacheConfig>(&self, default_dir: &str) -> Result<Arc<Cache<C>>> {
        let settings = self.cache_settings::<C>(default_dir)?;
        Ok(Arc::new(Cache::<C>::open(settings).await?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::AssetConfig;

    #[test]
    fn test_settings_from_config() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load_config(&dir.path().to_string_lossy()).unwrap();
        config.set_cache_size("media", 42).unwrap();
        config
            .set_value(&["host", "media", "eviction"], Value::String("bytes".into()))
            .unwrap();

        let settings = config.cache_settings::<AssetConfig>("cache_media").unwrap();
        assert_eq!(settings.max_items, 42);
        assert_eq!(settings.eviction, EvictionKind::Bytes);
        assert_eq!(settings.safety_buffer, 500 * MB);
        assert_eq!(settings.estimated_size, 100 * MB);
        assert_eq!(settings.timeout, Duration::from_secs(300));
        assert_eq!(settings.max_redirects, 5);
        assert!(settings.dir.starts_with(dir.path()));
        assert!(settings.dir.is_dir());
    }
}
