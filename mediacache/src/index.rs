//! Index en mémoire des fichiers du cache
//!
//! L'index associe un identifiant à une [`CacheEntry`]. Il est reconstruit au
//! démarrage en listant le répertoire du cache (voir [`crate::naming`]) : il
//! n'existe aucune base de données ni manifeste.
//!
//! Les horodatages d'accès sont émis par une horloge monotone propre à
//! l'index : deux accès successifs n'ont jamais le même horodatage, ce qui
//! garantit un ordre LRU fidèle à l'ordre réel des accès.

use crate::naming::{parse_cached_name, PART_SUFFIX};
use crate::retry::is_transient_lock;
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, info, warn};

/// Nature d'un média, déduite de l'extension du fichier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AssetKind {
    Video,
    Image,
    Audio,
    Other,
}

impl AssetKind {
    pub fn from_extension(extension: &str) -> Self {
        match extension.to_ascii_lowercase().as_str() {
            "mp4" | "mov" | "m4v" | "webm" | "mkv" | "avi" | "mxf" => AssetKind::Video,
            "jpg" | "jpeg" | "png" | "gif" | "webp" | "bmp" | "tif" | "tiff" | "heic" => {
                AssetKind::Image
            }
            "mp3" | "wav" | "aac" | "m4a" | "flac" | "ogg" | "opus" | "aiff" => AssetKind::Audio,
            _ => AssetKind::Other,
        }
    }

    pub fn from_path(path: &Path) -> Self {
        path.extension()
            .and_then(|e| e.to_str())
            .map(Self::from_extension)
            .unwrap_or(AssetKind::Other)
    }
}

/// Entrée de l'index représentant un fichier présent dans le cache
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CacheEntry {
    /// Identifiant unique dans l'espace de noms du cache
    pub id: String,
    /// Chemin complet du fichier sur disque
    pub file_path: PathBuf,
    /// Nom du fichier (dernier composant de `file_path`)
    pub file_name: String,
    /// Taille en octets
    pub size_bytes: u64,
    /// Dernier accès (ou date de modification pour une entrée réhydratée)
    pub last_accessed: DateTime<Utc>,
    pub asset_kind: AssetKind,
    /// Ordre d'insertion, départage les horodatages égaux
    #[serde(skip)]
    pub(crate) seq: u64,
}

impl CacheEntry {
    pub fn new(
        id: impl Into<String>,
        file_path: impl Into<PathBuf>,
        size_bytes: u64,
        last_accessed: DateTime<Utc>,
    ) -> Self {
        let file_path = file_path.into();
        let file_name = file_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let asset_kind = AssetKind::from_path(&file_path);
        Self {
            id: id.into(),
            file_path,
            file_name,
            size_bytes,
            last_accessed,
            asset_kind,
            seq: 0,
        }
    }
}

/// Index partagé entre le cache et le coordinateur de téléchargements
///
/// Le verrou n'est jamais conservé à travers un `.await`.
#[derive(Debug, Clone, Default)]
pub struct SharedIndex(Arc<Mutex<AssetIndex>>);

impl SharedIndex {
    pub fn new(index: AssetIndex) -> Self {
        Self(Arc::new(Mutex::new(index)))
    }

    pub fn lock(&self) -> MutexGuard<'_, AssetIndex> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Map `id -> CacheEntry` avec suivi de l'ordre d'accès
#[derive(Debug, Default)]
pub struct AssetIndex {
    entries: HashMap<String, CacheEntry>,
    next_seq: u64,
    last_stamp: Option<DateTime<Utc>>,
}

impl AssetIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.entries.contains_key(id)
    }

    /// Récupère une entrée sans mettre à jour son dernier accès
    pub fn get(&self, id: &str) -> Option<&CacheEntry> {
        self.entries.get(id)
    }

    /// Somme des tailles de toutes les entrées
    pub fn total_bytes(&self) -> u64 {
        self.entries.values().map(|e| e.size_bytes).sum()
    }

    /// Copie des entrées, de la moins récemment utilisée à la plus récente
    pub fn entries(&self) -> Vec<CacheEntry> {
        self.lru_order().into_iter().cloned().collect()
    }

    /// Entrées triées par dernier accès croissant (égalités : ordre d'insertion)
    pub fn lru_order(&self) -> Vec<&CacheEntry> {
        let mut entries: Vec<&CacheEntry> = self.entries.values().collect();
        entries.sort_by(|a, b| {
            a.last_accessed
                .cmp(&b.last_accessed)
                .then(a.seq.cmp(&b.seq))
        });
        entries
    }

    /// Horodatage strictement supérieur à tous ceux déjà émis
    pub fn stamp(&mut self) -> DateTime<Utc> {
        let now = Utc::now();
        let stamp = match self.last_stamp {
            Some(last) if now <= last => last + Duration::microseconds(1),
            _ => now,
        };
        self.last_stamp = Some(stamp);
        stamp
    }

    /// Ajoute ou remplace une entrée
    ///
    /// Retourne l'entrée précédente pour cet identifiant, s'il y en avait une.
    pub fn register(&mut self, mut entry: CacheEntry) -> Option<CacheEntry> {
        entry.seq = self.next_seq;
        self.next_seq += 1;
        if self.last_stamp.is_none_or(|last| entry.last_accessed > last) {
            self.last_stamp = Some(entry.last_accessed);
        }
        self.entries.insert(entry.id.clone(), entry)
    }

    /// Marque une entrée comme utilisée maintenant
    ///
    /// Retourne le chemin du fichier si l'entrée existe.
    pub fn touch(&mut self, id: &str) -> Option<PathBuf> {
        if !self.entries.contains_key(id) {
            return None;
        }
        let stamp = self.stamp();
        let entry = self.entries.get_mut(id)?;
        if stamp > entry.last_accessed {
            entry.last_accessed = stamp;
        }
        Some(entry.file_path.clone())
    }

    pub fn remove(&mut self, id: &str) -> Option<CacheEntry> {
        self.entries.remove(id)
    }

    /// Vide l'index et retourne toutes les entrées
    pub fn drain(&mut self) -> Vec<CacheEntry> {
        self.entries.drain().map(|(_, e)| e).collect()
    }

    /// Reconstruit l'index à partir du contenu de `dir`
    ///
    /// Seuls les fichiers `{prefix}-{id}.{ext}` sont retenus. Un fichier
    /// illisible (verrou, permission, autre erreur) est ignoré avec un
    /// avertissement : un fichier défectueux ne doit jamais empêcher le
    /// démarrage. Les fichiers temporaires `*.part` laissés par un transfert
    /// interrompu sont supprimés.
    ///
    /// Retourne le nombre d'entrées chargées.
    pub async fn hydrate(&mut self, dir: &Path, prefix: &str) -> std::io::Result<usize> {
        let mut found: HashMap<String, CacheEntry> = HashMap::new();
        let mut dir_entries = tokio::fs::read_dir(dir).await?;

        loop {
            let dir_entry = match dir_entries.next_entry().await {
                Ok(Some(entry)) => entry,
                Ok(None) => break,
                Err(e) => {
                    warn!(dir = %dir.display(), error = %e, "Directory listing interrupted");
                    break;
                }
            };

            let path = dir_entry.path();
            let file_name = match dir_entry.file_name().into_string() {
                Ok(name) => name,
                Err(_) => continue, // nom de fichier non UTF-8 : on l'ignore
            };

            if file_name.ends_with(PART_SUFFIX) {
                match tokio::fs::remove_file(&path).await {
                    Ok(()) => debug!(file = %file_name, "Removed leftover partial file"),
                    Err(e) => warn!(file = %file_name, error = %e, "Unable to remove partial file"),
                }
                continue;
            }

            let Some(id) = parse_cached_name(prefix, &file_name) else {
                debug!(file = %file_name, "Ignoring file outside naming convention");
                continue;
            };

            let metadata = match tokio::fs::metadata(&path).await {
                Ok(m) => m,
                Err(e) if is_transient_lock(&e) => {
                    warn!(file = %file_name, error = %e, "File locked during hydration, skipped");
                    continue;
                }
                Err(e) => {
                    warn!(file = %file_name, error = %e, "Unable to stat cached file, skipped");
                    continue;
                }
            };

            if !metadata.is_file() {
                continue;
            }

            let modified = metadata
                .modified()
                .map(DateTime::<Utc>::from)
                .unwrap_or_else(|_| Utc::now());
            let entry = CacheEntry::new(id.clone(), path, metadata.len(), modified);

            match found.get(&id) {
                Some(existing) if existing.last_accessed >= entry.last_accessed => {
                    debug!(id = %id, file = %file_name, "Duplicate id, keeping newer file");
                }
                _ => {
                    found.insert(id, entry);
                }
            }
        }

        // Ordre d'insertion déterministe : date puis nom
        let mut loaded: Vec<CacheEntry> = found.into_values().collect();
        loaded.sort_by(|a, b| {
            a.last_accessed
                .cmp(&b.last_accessed)
                .then_with(|| a.file_name.cmp(&b.file_name))
        });

        let count = loaded.len();
        for entry in loaded {
            self.register(entry);
        }

        info!(dir = %dir.display(), entries = count, "Cache index hydrated");
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(id: &str) -> CacheEntry {
        CacheEntry::new(id, format!("/cache/media-{id}.mp4"), 10, Utc::now())
    }

    #[test]
    fn test_asset_kind() {
        assert_eq!(AssetKind::from_extension("MP4"), AssetKind::Video);
        assert_eq!(AssetKind::from_extension("jpg"), AssetKind::Image);
        assert_eq!(AssetKind::from_extension("wav"), AssetKind::Audio);
        assert_eq!(AssetKind::from_extension("psd"), AssetKind::Other);
        assert_eq!(entry("1").asset_kind, AssetKind::Video);
        assert_eq!(entry("1").file_name, "media-1.mp4");
    }

    #[test]
    fn test_touch_reorders() {
        let mut index = AssetIndex::new();
        for id in ["a", "b", "c"] {
            let mut e = entry(id);
            e.last_accessed = index.stamp();
            index.register(e);
        }

        let before = index.get("a").unwrap().last_accessed;
        assert!(index.touch("a").is_some());
        assert!(index.get("a").unwrap().last_accessed > before);

        let order: Vec<&str> = index.lru_order().iter().map(|e| e.id.as_str()).collect();
        assert_eq!(order, vec!["b", "c", "a"]);
        assert!(index.touch("missing").is_none());
    }

    #[test]
    fn test_equal_stamps_follow_insertion_order() {
        let mut index = AssetIndex::new();
        let t = Utc::now();
        for id in ["x", "y", "z"] {
            let mut e = entry(id);
            e.last_accessed = t;
            index.register(e);
        }
        let order: Vec<&str> = index.lru_order().iter().map(|e| e.id.as_str()).collect();
        assert_eq!(order, vec!["x", "y", "z"]);
    }

    #[test]
    fn test_stamp_is_strictly_increasing() {
        let mut index = AssetIndex::new();
        let mut future = entry("f");
        future.last_accessed = Utc::now() + Duration::hours(1);
        index.register(future.clone());

        let stamp = index.stamp();
        assert!(stamp > future.last_accessed);
        assert!(index.stamp() > stamp);
    }

    #[test]
    fn test_remove_and_totals() {
        let mut index = AssetIndex::new();
        index.register(entry("a"));
        index.register(entry("b"));
        assert_eq!(index.len(), 2);
        assert_eq!(index.total_bytes(), 20);

        assert!(index.remove("a").is_some());
        assert!(index.remove("a").is_none());
        assert_eq!(index.len(), 1);

        assert_eq!(index.drain().len(), 1);
        assert!(index.is_empty());
    }

    #[tokio::test]
    async fn test_hydrate_from_directory() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("media-7.mp4"), b"0123456789").unwrap();
        std::fs::write(dir.path().join("media-8.png"), b"png").unwrap();
        std::fs::write(dir.path().join("notes.txt"), b"unrelated").unwrap();
        std::fs::write(dir.path().join("media-9.mp4.part"), b"partial").unwrap();
        std::fs::create_dir(dir.path().join("media-10.dir")).unwrap();

        let mut index = AssetIndex::new();
        let count = index.hydrate(dir.path(), "media").await.unwrap();

        assert_eq!(count, 2);
        let seven = index.get("7").unwrap();
        assert_eq!(seven.file_path, dir.path().join("media-7.mp4"));
        assert_eq!(seven.size_bytes, 10);
        assert_eq!(seven.asset_kind, AssetKind::Video);
        assert_eq!(index.get("8").unwrap().asset_kind, AssetKind::Image);
        assert!(index.get("10").is_none());
        assert!(!dir.path().join("media-9.mp4.part").exists());
    }

    #[tokio::test]
    async fn test_hydrate_missing_directory_fails() {
        let dir = tempfile::tempdir().unwrap();
        let mut index = AssetIndex::new();
        assert!(index
            .hydrate(&dir.path().join("absent"), "media")
            .await
            .is_err());
    }
}
