//! Politiques d'éviction du cache
//!
//! Deux politiques partagent le même ordre (dernier accès croissant, égalités
//! départagées par l'ordre d'insertion) :
//! - [`LruCountPolicy`] borne le nombre d'éléments (politique par défaut)
//! - [`ByteQuotaPolicy`] borne la taille totale en octets

use crate::index::{AssetIndex, CacheEntry};
use std::fmt;
use std::str::FromStr;
use tracing::{info, warn};

/// Choix des éléments à évincer
pub trait EvictionPolicy: Send + Sync + fmt::Debug {
    /// Identifiants à supprimer, du moins récemment utilisé au plus récent
    fn select_victims(&self, index: &AssetIndex) -> Vec<String>;

    fn needs_eviction(&self, index: &AssetIndex) -> bool {
        !self.select_victims(index).is_empty()
    }
}

/// Borne sur le nombre d'éléments
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LruCountPolicy {
    max_items: usize,
}

impl LruCountPolicy {
    pub fn new(max_items: usize) -> Self {
        Self {
            max_items: max_items.max(1),
        }
    }
}

impl EvictionPolicy for LruCountPolicy {
    fn select_victims(&self, index: &AssetIndex) -> Vec<String> {
        let excess = index.len().saturating_sub(self.max_items);
        index
            .lru_order()
            .into_iter()
            .take(excess)
            .map(|e| e.id.clone())
            .collect()
    }

    fn needs_eviction(&self, index: &AssetIndex) -> bool {
        index.len() > self.max_items
    }
}

/// Borne sur la taille totale des fichiers
///
/// L'entrée la plus récente est toujours conservée, même si elle dépasse à
/// elle seule le quota.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteQuotaPolicy {
    max_bytes: u64,
}

impl ByteQuotaPolicy {
    pub fn new(max_bytes: u64) -> Self {
        Self { max_bytes }
    }
}

impl EvictionPolicy for ByteQuotaPolicy {
    fn select_victims(&self, index: &AssetIndex) -> Vec<String> {
        let mut total = index.total_bytes();
        let mut victims = Vec::new();
        let order = index.lru_order();
        let candidates = order.len().saturating_sub(1);
        for entry in order.into_iter().take(candidates) {
            if total <= self.max_bytes {
                break;
            }
            total = total.saturating_sub(entry.size_bytes);
            victims.push(entry.id.clone());
        }
        victims
    }

    fn needs_eviction(&self, index: &AssetIndex) -> bool {
        index.len() > 1 && index.total_bytes() > self.max_bytes
    }
}

/// Type de politique, tel qu'exprimé dans la configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EvictionKind {
    #[default]
    Count,
    Bytes,
}

impl FromStr for EvictionKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "count" | "lru" | "items" => Ok(EvictionKind::Count),
            "bytes" | "quota" | "size" => Ok(EvictionKind::Bytes),
            other => Err(format!("unknown eviction policy '{other}'")),
        }
    }
}

impl fmt::Display for EvictionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EvictionKind::Count => write!(f, "count"),
            EvictionKind::Bytes => write!(f, "bytes"),
        }
    }
}

/// Retire de l'index les entrées désignées par la politique
///
/// L'index est modifié en une seule fois ; la suppression des fichiers se
/// fait ensuite avec [`delete_victims`], hors du verrou de l'index.
pub fn take_victims(index: &mut AssetIndex, policy: &dyn EvictionPolicy) -> Vec<CacheEntry> {
    if !policy.needs_eviction(index) {
        return Vec::new();
    }
    policy
        .select_victims(index)
        .iter()
        .filter_map(|id| index.remove(id))
        .collect()
}

/// Supprime les fichiers d'une liste d'entrées
///
/// Un échec de suppression est journalisé et n'interrompt pas la passe.
/// Retourne le nombre de fichiers effectivement supprimés (un fichier déjà
/// absent compte comme supprimé).
pub async fn delete_files(entries: &[CacheEntry]) -> usize {
    let mut deleted = 0;
    for entry in entries {
        match tokio::fs::remove_file(&entry.file_path).await {
            Ok(()) => deleted += 1,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => deleted += 1,
            Err(e) => {
                warn!(
                    id = %entry.id,
                    file = %entry.file_path.display(),
                    error = %e,
                    "Unable to delete cached file, continuing"
                );
            }
        }
    }
    deleted
}

/// Supprime les fichiers des entrées évincées
pub async fn delete_victims(victims: &[CacheEntry]) -> usize {
    let deleted = delete_files(victims).await;
    if !victims.is_empty() {
        info!(
            "LRU eviction: removed {} entries ({} files deleted)",
            victims.len(),
            deleted
        );
    }
    deleted
}
