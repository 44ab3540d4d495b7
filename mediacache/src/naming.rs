//! Conventions de nommage des fichiers du cache
//!
//! Format d'un fichier en cache : `{prefix}-{id}.{ext}` (ex: `media-42.mp4`,
//! `thumb-7.jpg`). L'index est reconstruit uniquement à partir de ces noms,
//! il n'existe pas de fichier manifeste.
//!
//! Règle d'extraction de l'identifiant :
//! 1. retirer le préfixe `{prefix}-` (les autres fichiers sont ignorés)
//! 2. retirer la dernière extension (`.mp4`)
//! 3. retirer un éventuel suffixe de collision ` (n)`

use crate::error::{CacheError, Result};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

/// Suffixe des fichiers temporaires en cours d'écriture
pub const PART_SUFFIX: &str = ".part";

/// Construit le nom de fichier conventionnel `{prefix}-{id}.{ext}`
pub fn cached_file_name(prefix: &str, id: &str, extension: &str) -> String {
    if extension.is_empty() {
        format!("{prefix}-{id}")
    } else {
        format!("{prefix}-{id}.{extension}")
    }
}

/// Vérifie qu'un identifiant peut être écrit dans un nom de fichier et
/// relu à l'identique par [`parse_cached_name`]
pub fn validate_id(id: &str) -> Result<()> {
    let reason = if id.is_empty() {
        Some("empty id")
    } else if id.contains(['/', '\\', ':']) {
        Some("contains a path separator")
    } else if id.contains("..") {
        Some("contains '..'")
    } else if id.chars().any(char::is_control) {
        Some("contains a control character")
    } else if strip_collision_suffix(id) != id {
        Some("ends with a collision suffix ' (n)'")
    } else {
        None
    };

    match reason {
        Some(reason) => Err(CacheError::InvalidId {
            id: id.to_string(),
            reason,
        }),
        None => Ok(()),
    }
}

/// Sépare un nom de fichier en (base, extension) sur le dernier `.`
///
/// Un nom commençant par un point (`.hidden`) n'a pas d'extension.
pub fn split_extension(file_name: &str) -> (&str, Option<&str>) {
    match file_name.rfind('.') {
        Some(pos) if pos > 0 => (&file_name[..pos], Some(&file_name[pos + 1..])),
        _ => (file_name, None),
    }
}

/// Retire un suffixe de collision ` (n)` en fin de base
fn strip_collision_suffix(base: &str) -> &str {
    if let Some(inner) = base.strip_suffix(')') {
        if let Some(pos) = inner.rfind(" (") {
            let digits = &inner[pos + 2..];
            if !digits.is_empty() && digits.chars().all(|c| c.is_ascii_digit()) {
                return &base[..pos];
            }
        }
    }
    base
}

/// Extrait l'identifiant d'un nom de fichier `{prefix}-{id}.{ext}`
///
/// Renvoie `None` si le préfixe ne correspond pas ou si l'identifiant est vide.
pub fn parse_cached_name(prefix: &str, file_name: &str) -> Option<String> {
    let rest = file_name.strip_prefix(prefix)?.strip_prefix('-')?;
    let base = match rest.rfind('.') {
        Some(pos) => &rest[..pos],
        None => rest,
    };
    let id = strip_collision_suffix(base);
    if id.is_empty() {
        None
    } else {
        Some(id.to_string())
    }
}

/// Nom de fichier disambiguïsé : `base (n).ext`
pub fn disambiguated(file_name: &str, n: u32) -> String {
    if n == 0 {
        return file_name.to_string();
    }
    match split_extension(file_name) {
        (base, Some(ext)) => format!("{base} ({n}).{ext}"),
        (base, None) => format!("{base} ({n})"),
    }
}

/// Réduit un nom fourni par l'appelant à son dernier composant
///
/// Empêche d'écrire hors du répertoire du cache (`../x`, chemins absolus).
pub fn sanitize_file_name(file_name: &str) -> Option<String> {
    let name = Path::new(file_name.trim()).file_name()?.to_str()?;
    if name.is_empty() || name == "." || name == ".." || name.ends_with(PART_SUFFIX) {
        None
    } else {
        Some(name.to_string())
    }
}

fn valid_extension(ext: &str) -> bool {
    !ext.is_empty() && ext.len() <= 10 && ext.chars().all(|c| c.is_ascii_alphanumeric())
}

/// Extension du fichier à écrire
///
/// Par ordre de préférence : celle du nom fourni par l'appelant, celle du
/// dernier segment de l'URL, puis `default`.
pub fn pick_extension(file_name: &str, url: &str, default: &str) -> String {
    let from_name = sanitize_file_name(file_name)
        .and_then(|name| split_extension(&name).1.map(str::to_string));

    let from_url = || {
        let parsed = url::Url::parse(url).ok()?;
        let last = parsed.path_segments()?.next_back()?.to_string();
        split_extension(&last).1.map(str::to_string)
    };

    from_name
        .filter(|e| valid_extension(e))
        .or_else(|| from_url().filter(|e| valid_extension(e)))
        .map(|e| e.to_ascii_lowercase())
        .unwrap_or_else(|| default.to_string())
}

/// Chemin du fichier temporaire associé à une destination
pub fn part_path(destination: &Path) -> PathBuf {
    let mut name = destination
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(PART_SUFFIX);
    destination.with_file_name(name)
}

/// Choisit un nom libre dans `dir` : `file_name`, puis `base (1).ext`, `base (2).ext`…
///
/// Un nom est libre s'il n'existe pas sur disque et n'est pas déjà réservé par
/// un autre transfert. Le nom choisi est ajouté aux réservations.
pub async fn reserve_unique_path(
    dir: &Path,
    file_name: &str,
    reserved: &Mutex<HashSet<PathBuf>>,
) -> PathBuf {
    let mut n = 0;
    loop {
        let candidate = dir.join(disambiguated(file_name, n));
        let on_disk = tokio::fs::try_exists(&candidate).await.unwrap_or(false)
            || tokio::fs::try_exists(part_path(&candidate))
                .await
                .unwrap_or(false);

        if !on_disk {
            let mut set = reserved.lock().unwrap_or_else(PoisonError::into_inner);
            if set.insert(candidate.clone()) {
                return candidate;
            }
        }
        n += 1;
    }
}
