//! Module de gestion du cache générique
//!
//! Ce module fournit une interface générique pour gérer un cache de fichiers
//! indexé en mémoire. L'index est reconstruit au démarrage à partir du
//! contenu du répertoire, les fichiers manquants sont élagués à la lecture.

use crate::disk_guard::{DiskSpaceGuard, SpaceProbe, SysinfoProbe, MB};
use crate::disk_guard::{DEFAULT_LOW_SPACE_THRESHOLD, DEFAULT_SAFETY_BUFFER};
use crate::download::{
    CoordinatorOptions, DownloadCoordinator, DownloadProgress, DEFAULT_ESTIMATED_SIZE,
    DEFAULT_TIMEOUT,
};
use crate::error::{CacheError, Result};
use crate::eviction::{
    delete_files, delete_victims, take_victims, ByteQuotaPolicy, EvictionKind, EvictionPolicy,
    LruCountPolicy,
};
use crate::fetch::{HttpFetcher, DEFAULT_MAX_REDIRECTS};
use crate::index::{AssetIndex, CacheEntry, SharedIndex};
use crate::naming::validate_id;
use crate::retry::{retry_access, RetryPolicy};
use serde::Serialize;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Quota en octets par défaut de la politique `bytes`
pub const DEFAULT_MAX_BYTES: u64 = 10 * 1024 * MB;

/// Paramètres statiques d'un cache spécialisé.
pub trait CacheConfig: Send + Sync + 'static {
    /// Préfixe des fichiers du cache (ex: `"media"` pour `media-42.mp4`).
    fn file_prefix() -> &'static str;
    /// Nom du cache (ex: `"media"`, `"thumbnails"`). Sert de clé de configuration.
    fn cache_name() -> &'static str {
        "cache"
    }
    /// Extension utilisée quand ni le nom fourni ni l'URL n'en portent.
    fn default_extension() -> &'static str {
        "bin"
    }
    /// Nombre maximal d'éléments par défaut.
    fn default_max_items() -> usize {
        500
    }
}

/// Configuration du cache des médias principaux (vidéo, image, audio)
pub struct AssetConfig;

impl CacheConfig for AssetConfig {
    fn file_prefix() -> &'static str {
        "media"
    }

    fn cache_name() -> &'static str {
        "media"
    }
}

/// Paramètres d'exécution d'un cache
#[derive(Debug, Clone)]
pub struct CacheSettings {
    /// Répertoire de stockage
    pub dir: PathBuf,
    /// Nombre maximal d'éléments (politique `count`)
    pub max_items: usize,
    pub eviction: EvictionKind,
    /// Quota en octets (politique `bytes`)
    pub max_bytes: u64,
    pub safety_buffer: u64,
    pub low_space_threshold: u64,
    /// Taille supposée d'un fichier avant d'en connaître la taille réelle
    pub estimated_size: u64,
    pub timeout: Duration,
    pub max_redirects: usize,
    pub retry: RetryPolicy,
}

impl CacheSettings {
    pub fn new(dir: impl Into<PathBuf>, max_items: usize) -> Self {
        Self {
            dir: dir.into(),
            max_items: max_items.max(1),
            eviction: EvictionKind::default(),
            max_bytes: DEFAULT_MAX_BYTES,
            safety_buffer: DEFAULT_SAFETY_BUFFER,
            low_space_threshold: DEFAULT_LOW_SPACE_THRESHOLD,
            estimated_size: DEFAULT_ESTIMATED_SIZE,
            timeout: DEFAULT_TIMEOUT,
            max_redirects: DEFAULT_MAX_REDIRECTS,
            retry: RetryPolicy::default(),
        }
    }

    /// Paramètres par défaut pour la configuration `C`
    pub fn for_config<C: CacheConfig>(dir: impl Into<PathBuf>) -> Self {
        Self::new(dir, C::default_max_items())
    }

    fn policy(&self) -> Arc<dyn EvictionPolicy> {
        match self.eviction {
            EvictionKind::Count => Arc::new(LruCountPolicy::new(self.max_items)),
            EvictionKind::Bytes => Arc::new(ByteQuotaPolicy::new(self.max_bytes)),
        }
    }
}

/// Statistiques d'un cache
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct CacheStats {
    pub item_count: usize,
    pub total_bytes: u64,
    /// Téléchargements en cours
    pub in_flight: usize,
}

/// Résultat d'un vidage du cache
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct ClearReport {
    pub deleted_count: usize,
}

/// Cache générique de fichiers téléchargés
///
/// # Paramètres de type
///
/// * `C` - Configuration du cache (implémente `CacheConfig`)
///
/// Les clones ne sont pas fournis : le cache est construit une fois puis
/// partagé derrière un `Arc<Cache<C>>`.
pub struct Cache<C: CacheConfig> {
    settings: CacheSettings,
    index: SharedIndex,
    coordinator: DownloadCoordinator,
    _phantom: PhantomData<C>,
}

impl<C: CacheConfig> std::fmt::Debug for Cache<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cache")
            .field("name", &C::cache_name())
            .field("dir", &self.settings.dir)
            .finish()
    }
}

impl<C: CacheConfig> Cache<C> {
    /// Ouvre le cache : crée le répertoire si besoin et reconstruit l'index
    pub async fn open(settings: CacheSettings) -> Result<Self> {
        Self::open_with_probe(settings, Arc::new(SysinfoProbe)).await
    }

    /// Comme [`Cache::open`], avec une mesure d'espace disque fournie
    pub async fn open_with_probe(settings: CacheSettings, probe: Arc<dyn SpaceProbe>) -> Result<Self> {
        let dir = settings.dir.clone();
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| CacheError::from_io(&dir, &e))?;

        let mut index = AssetIndex::new();
        index
            .hydrate(&dir, C::file_prefix())
            .await
            .map_err(|e| CacheError::from_io(&dir, &e))?;

        let policy = settings.policy();
        let victims = take_victims(&mut index, policy.as_ref());
        delete_victims(&victims).await;

        let index = SharedIndex::new(index);
        let guard = DiskSpaceGuard::new(probe, settings.safety_buffer, settings.low_space_threshold);
        let fetcher = HttpFetcher::new(settings.max_redirects)?;
        let options = CoordinatorOptions {
            dir: dir.clone(),
            prefix: C::file_prefix().to_string(),
            default_extension: C::default_extension().to_string(),
            estimated_size: settings.estimated_size,
            timeout: settings.timeout,
            retry: settings.retry,
        };
        let coordinator = DownloadCoordinator::new(options, index.clone(), fetcher, guard, policy);

        tracing::info!(
            "Cache '{}' opened in {} ({} entries)",
            C::cache_name(),
            dir.display(),
            index.lock().len()
        );

        Ok(Self {
            settings,
            index,
            coordinator,
            _phantom: PhantomData,
        })
    }

    pub fn cache_dir(&self) -> &Path {
        &self.settings.dir
    }

    pub fn settings(&self) -> &CacheSettings {
        &self.settings
    }

    pub fn contains(&self, id: &str) -> bool {
        self.index.lock().contains(id)
    }

    /// Copie des entrées, de la moins récemment utilisée à la plus récente
    pub fn entries(&self) -> Vec<CacheEntry> {
        self.index.lock().entries()
    }

    /// Chemin du fichier en cache pour `id`
    ///
    /// Le fichier est vérifié avant d'être retourné. S'il a disparu, l'entrée
    /// est retirée de l'index. S'il reste verrouillé après les tentatives, le
    /// chemin est retourné quand même : le fichier existe.
    pub async fn get(&self, id: &str) -> Option<PathBuf> {
        let path = self.index.lock().get(id).map(|e| e.file_path.clone())?;

        match retry_access(&path, self.settings.retry).await {
            Ok(()) => {
                self.index.lock().touch(id);
                tracing::debug!("Cache hit for {}", id);
                Some(path)
            }
            Err(CacheError::NotFound { .. }) => {
                tracing::warn!(
                    "Cached file for {} disappeared ({}), pruning entry",
                    id,
                    path.display()
                );
                self.prune(id, &path);
                None
            }
            Err(e @ CacheError::MaxRetries { .. }) => {
                tracing::warn!("Cached file for {} still locked: {}", id, e);
                self.index.lock().touch(id);
                Some(path)
            }
            Err(e) => {
                tracing::warn!("Cached file for {} is not readable: {}", id, e);
                None
            }
        }
    }

    /// Retire l'entrée `id` si elle pointe toujours vers `path`
    fn prune(&self, id: &str, path: &Path) -> bool {
        let mut index = self.index.lock();
        if index.get(id).is_some_and(|e| e.file_path == path) {
            index.remove(id);
            true
        } else {
            false
        }
    }

    /// Retourne le chemin en cache, en téléchargeant le fichier si nécessaire
    pub async fn ensure_cached(&self, id: &str, url: &str, file_name: &str) -> Result<PathBuf> {
        self.ensure_cached_with_cancel(id, url, file_name, None).await
    }

    /// Comme [`Cache::ensure_cached`], annulable par l'appelant
    ///
    /// L'annulation détache l'appelant ; le transfert n'est interrompu que
    /// lorsque tous les appelants rattachés ont annulé.
    pub async fn ensure_cached_with_cancel(
        &self,
        id: &str,
        url: &str,
        file_name: &str,
        cancel: Option<&CancellationToken>,
    ) -> Result<PathBuf> {
        if let Some(path) = self.get(id).await {
            return Ok(path);
        }
        self.coordinator.request(id, url, file_name, cancel).await
    }

    /// Indexe un fichier déjà présent sur disque
    pub async fn register(&self, id: &str, path: &Path) -> Result<CacheEntry> {
        validate_id(id)?;
        let metadata = tokio::fs::metadata(path)
            .await
            .map_err(|e| CacheError::from_io(path, &e))?;

        let (entry, victims) = {
            let mut index = self.index.lock();
            let stamp = index.stamp();
            let entry = CacheEntry::new(id, path, metadata.len(), stamp);
            index.register(entry.clone());
            (entry, take_victims(&mut index, self.coordinator.policy()))
        };
        delete_victims(&victims).await;

        tracing::debug!("Registered {} -> {}", id, path.display());
        Ok(entry)
    }

    /// Met à jour la date de dernier accès
    pub fn touch(&self, id: &str) -> bool {
        self.index.lock().touch(id).is_some()
    }

    /// Supprime un élément du cache (entrée et fichier)
    ///
    /// Retourne `false` si l'identifiant n'était pas indexé.
    pub async fn remove(&self, id: &str) -> Result<bool> {
        let entry = self.index.lock().remove(id);
        let Some(entry) = entry else {
            return Ok(false);
        };

        match tokio::fs::remove_file(&entry.file_path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(CacheError::from_io(&entry.file_path, &e)),
        }
        tracing::debug!("Removed {} from cache '{}'", id, C::cache_name());
        Ok(true)
    }

    /// Vide le cache
    ///
    /// Les téléchargements en cours ne sont pas interrompus : ils
    /// enregistreront leur résultat à la fin du transfert.
    pub async fn clear(&self) -> ClearReport {
        let entries = self.index.lock().drain();
        let deleted_count = delete_files(&entries).await;
        tracing::info!(
            "Cache '{}' cleared: {} of {} files deleted",
            C::cache_name(),
            deleted_count,
            entries.len()
        );
        ClearReport { deleted_count }
    }

    /// Retire de l'index les entrées dont le fichier a disparu
    ///
    /// Retourne le nombre d'entrées retirées.
    pub async fn consolidate(&self) -> usize {
        let entries = self.entries();
        let mut pruned = 0;
        for entry in entries {
            match tokio::fs::metadata(&entry.file_path).await {
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    if self.prune(&entry.id, &entry.file_path) {
                        pruned += 1;
                    }
                }
                _ => {}
            }
        }
        if pruned > 0 {
            tracing::info!(
                "Consolidation of cache '{}' pruned {} entries",
                C::cache_name(),
                pruned
            );
        }
        pruned
    }

    pub async fn stats(&self) -> CacheStats {
        let (item_count, total_bytes) = {
            let index = self.index.lock();
            (index.len(), index.total_bytes())
        };
        CacheStats {
            item_count,
            total_bytes,
            in_flight: self.coordinator.in_flight().await,
        }
    }

    /// Interrompt le téléchargement en cours pour `id`
    pub async fn cancel(&self, id: &str) -> bool {
        self.coordinator.cancel(id).await
    }

    /// Progression du téléchargement en cours pour `id`
    pub async fn progress(&self, id: &str) -> Option<DownloadProgress> {
        self.coordinator.progress(id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::disk_guard::StaticSpaceProbe;

    struct TestConfig;

    impl CacheConfig for TestConfig {
        fn file_prefix() -> &'static str {
            "test"
        }
    }

    async fn open(dir: &Path, max_items: usize) -> Cache<TestConfig> {
        let settings = CacheSettings::new(dir, max_items);
        Cache::open_with_probe(settings, Arc::new(StaticSpaceProbe::failing()))
            .await
            .unwrap()
    }

    #[test]
    fn test_settings_clamp_max_items() {
        assert_eq!(CacheSettings::new("/tmp/x", 0).max_items, 1);
        assert_eq!(CacheSettings::for_config::<AssetConfig>("/tmp/x").max_items, 500);
    }

    #[tokio::test]
    async fn test_open_evicts_over_bound() {
        let dir = tempfile::tempdir().unwrap();
        for id in ["1", "2", "3"] {
            std::fs::write(dir.path().join(format!("test-{id}.bin")), id).unwrap();
        }

        let cache = open(dir.path(), 2).await;
        assert_eq!(cache.stats().await.item_count, 2);
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 2);
    }

    #[tokio::test]
    async fn test_register_remove_and_consolidate() {
        let dir = tempfile::tempdir().unwrap();
        let cache = open(dir.path(), 10).await;

        let a = dir.path().join("test-a.bin");
        let b = dir.path().join("test-b.bin");
        std::fs::write(&a, b"aaaa").unwrap();
        std::fs::write(&b, b"bb").unwrap();

        let entry = cache.register("a", &a).await.unwrap();
        assert_eq!(entry.size_bytes, 4);
        cache.register("b", &b).await.unwrap();
        assert_eq!(cache.stats().await.total_bytes, 6);

        assert!(cache.remove("a").await.unwrap());
        assert!(!a.exists());
        assert!(!cache.remove("a").await.unwrap());

        std::fs::remove_file(&b).unwrap();
        assert_eq!(cache.consolidate().await, 1);
        assert!(!cache.contains("b"));
    }

    #[tokio::test]
    async fn test_get_prunes_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("test-7.bin"), b"x").unwrap();
        let cache = open(dir.path(), 10).await;

        assert_eq!(cache.get("7").await, Some(dir.path().join("test-7.bin")));

        std::fs::remove_file(dir.path().join("test-7.bin")).unwrap();
        assert_eq!(cache.get("7").await, None);
        assert!(!cache.contains("7"));
    }

    #[tokio::test]
    async fn test_clear_counts_deleted_files() {
        let dir = tempfile::tempdir().unwrap();
        for id in ["1", "2"] {
            std::fs::write(dir.path().join(format!("test-{id}.bin")), id).unwrap();
        }
        let cache = open(dir.path(), 10).await;

        assert_eq!(cache.clear().await, ClearReport { deleted_count: 2 });
        assert_eq!(cache.stats().await, CacheStats::default());
    }
}
