//! Gestion des erreurs du cache
//!
//! Chaque erreur porte un code stable (`code()`) que l'appelant peut utiliser
//! pour choisir le message à afficher. Les erreurs sont `Clone` : un même échec
//! de téléchargement est renvoyé à tous les appelants rattachés à la tâche.

use std::path::PathBuf;
use thiserror::Error;

/// Type Result personnalisé pour mediacache
pub type Result<T> = std::result::Result<T, CacheError>;

/// Erreurs possibles lors de l'utilisation du cache
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CacheError {
    /// Échec de transport (DNS, connexion refusée, flux interrompu…)
    #[error("Network error: {0}")]
    Network(String),

    /// Statut HTTP hors 2xx
    #[error("HTTP error: status {status}")]
    Http { status: u16 },

    /// Espace disque insuffisant pour accueillir le fichier
    #[error("Insufficient disk space: {available} bytes available, {required} bytes required")]
    DiskFull { available: u64, required: u64 },

    /// Fichier verrouillé par un autre processus (transitoire)
    #[error("File is locked: {}", path.display())]
    FileLocked { path: PathBuf, code: String },

    /// Le transfert a dépassé le délai maximal
    #[error("Download timed out after {secs}s")]
    Timeout { secs: u64 },

    /// Fichier absent du disque
    #[error("File not found: {}", path.display())]
    NotFound { path: PathBuf },

    /// Nombre maximal de tentatives atteint sur un fichier verrouillé
    #[error("Gave up on {} after {attempts} attempts (last error: {code})", path.display())]
    MaxRetries {
        path: PathBuf,
        attempts: u32,
        code: String,
    },

    /// Chaîne de redirections trop longue
    #[error("Too many redirects (more than {max}) starting from {url}")]
    TooManyRedirects { url: String, max: usize },

    /// Identifiant inutilisable comme nom de fichier
    #[error("Invalid asset id {id:?}: {reason}")]
    InvalidId { id: String, reason: &'static str },

    /// Le téléchargement a été annulé
    #[error("Download cancelled")]
    Cancelled,

    /// Erreur d'entrée/sortie non transitoire
    #[error("I/O error on {} ({code}): {message}", path.display())]
    Io {
        path: PathBuf,
        code: String,
        message: String,
    },

    /// La tâche de téléchargement s'est arrêtée sans produire de résultat
    #[error("Internal error: {0}")]
    Internal(String),
}

impl CacheError {
    /// Code stable de l'erreur
    pub fn code(&self) -> &'static str {
        match self {
            CacheError::Network(_) => "NETWORK_ERROR",
            CacheError::Http { .. } => "HTTP_ERROR",
            CacheError::DiskFull { .. } => "DISK_FULL",
            CacheError::FileLocked { .. } => "FILE_LOCKED",
            CacheError::Timeout { .. } => "TIMEOUT",
            CacheError::NotFound { .. } => "NOT_FOUND",
            CacheError::MaxRetries { .. } => "MAX_RETRIES",
            CacheError::TooManyRedirects { .. } => "TOO_MANY_REDIRECTS",
            CacheError::InvalidId { .. } => "INVALID_ID",
            CacheError::Cancelled => "CANCELLED",
            CacheError::Io { .. } => "IO_ERROR",
            CacheError::Internal(_) => "INTERNAL",
        }
    }

    /// Construit une erreur à partir d'une erreur d'entrée/sortie sur `path`
    ///
    /// Les verrous transitoires deviennent `FileLocked`, l'absence de fichier
    /// devient `NotFound`, le reste `Io`.
    pub fn from_io(path: impl Into<PathBuf>, err: &std::io::Error) -> Self {
        let path = path.into();
        if err.kind() == std::io::ErrorKind::NotFound {
            return CacheError::NotFound { path };
        }
        let code = crate::retry::io_error_code(err);
        if crate::retry::is_transient_lock(err) {
            CacheError::FileLocked { path, code }
        } else {
            CacheError::Io {
                path,
                code,
                message: err.to_string(),
            }
        }
    }

    /// Vérifie si l'erreur doit être présentée à l'utilisateur
    pub fn is_user_facing(&self) -> bool {
        matches!(self, CacheError::DiskFull { .. } | CacheError::Http { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[test]
    fn test_codes_are_stable() {
        assert_eq!(CacheError::Http { status: 404 }.code(), "HTTP_ERROR");
        assert_eq!(
            CacheError::DiskFull {
                available: 1,
                required: 2
            }
            .code(),
            "DISK_FULL"
        );
        assert_eq!(
            CacheError::TooManyRedirects {
                url: "http://x".into(),
                max: 5
            }
            .code(),
            "TOO_MANY_REDIRECTS"
        );
        assert_eq!(CacheError::Cancelled.code(), "CANCELLED");
    }

    #[test]
    fn test_from_io_classification() {
        let not_found = io::Error::from(io::ErrorKind::NotFound);
        assert_eq!(CacheError::from_io("/a", &not_found).code(), "NOT_FOUND");

        let denied = io::Error::from(io::ErrorKind::PermissionDenied);
        assert_eq!(CacheError::from_io("/a", &denied).code(), "FILE_LOCKED");

        let invalid = io::Error::from(io::ErrorKind::InvalidData);
        assert_eq!(CacheError::from_io("/a", &invalid).code(), "IO_ERROR");
    }

    #[test]
    fn test_user_facing() {
        assert!(CacheError::Http { status: 500 }.is_user_facing());
        assert!(!CacheError::Network("reset".into()).is_user_facing());
    }
}
