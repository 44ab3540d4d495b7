//! Accès aux fichiers avec reprise sur verrou transitoire
//!
//! Un fichier du cache peut être momentanément tenu ouvert par une autre
//! application (éditeur vidéo, logiciel de montage…). Les opérations d'export
//! doivent tolérer ce cas : on réessaie avec un délai exponentiel, sans jamais
//! bloquer le thread du runtime.

use crate::error::{CacheError, Result};
use std::future::Future;
use std::io;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, warn};

/// Nombre de tentatives par défaut
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Délai initial par défaut entre deux tentatives
pub const DEFAULT_INITIAL_DELAY: Duration = Duration::from_millis(50);

#[cfg(windows)]
const LOCK_OS_CODES: &[(i32, &str)] = &[
    (32, "ERROR_SHARING_VIOLATION"),
    (33, "ERROR_LOCK_VIOLATION"),
];

#[cfg(not(windows))]
const LOCK_OS_CODES: &[(i32, &str)] = &[(16, "EBUSY"), (26, "ETXTBSY")];

/// Politique de reprise : nombre de tentatives et délai initial
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            initial_delay: DEFAULT_INITIAL_DELAY,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, initial_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            initial_delay,
        }
    }

    /// Délai d'attente après le `failed`-ième échec (à partir de 1)
    ///
    /// `initial_delay * 2^(failed - 1)`
    pub fn delay_after(&self, failed: u32) -> Duration {
        let factor = 2u32.saturating_pow(failed.saturating_sub(1));
        self.initial_delay.saturating_mul(factor)
    }
}

/// Indique si l'erreur correspond à un verrou transitoire (fichier occupé,
/// verrouillé, ou permission refusée le temps qu'un autre processus le relâche)
pub fn is_transient_lock(err: &io::Error) -> bool {
    if let Some(raw) = err.raw_os_error() {
        if LOCK_OS_CODES.iter().any(|(code, _)| *code == raw) {
            return true;
        }
    }
    matches!(
        err.kind(),
        io::ErrorKind::PermissionDenied | io::ErrorKind::WouldBlock | io::ErrorKind::ResourceBusy
    )
}

/// Code textuel stable d'une erreur d'entrée/sortie (ex: `EBUSY`, `ENOENT`)
pub fn io_error_code(err: &io::Error) -> String {
    if let Some(raw) = err.raw_os_error() {
        if let Some((_, name)) = LOCK_OS_CODES.iter().find(|(code, _)| *code == raw) {
            return (*name).to_string();
        }
    }
    let code = match err.kind() {
        io::ErrorKind::NotFound => "ENOENT",
        io::ErrorKind::PermissionDenied => "EACCES",
        io::ErrorKind::WouldBlock => "EAGAIN",
        io::ErrorKind::ResourceBusy => "EBUSY",
        io::ErrorKind::AlreadyExists => "EEXIST",
        io::ErrorKind::Interrupted => "EINTR",
        kind => {
            return match err.raw_os_error() {
                Some(raw) => format!("OS_{raw}"),
                None => format!("{kind:?}").to_uppercase(),
            };
        }
    };
    code.to_string()
}

/// Exécute `op` en réessayant tant que l'erreur est un verrou transitoire
///
/// Toute autre erreur (fichier absent, chemin invalide…) est renvoyée
/// immédiatement. Après `max_attempts` échecs, renvoie
/// [`CacheError::MaxRetries`] avec le code de la dernière erreur.
pub async fn retry_with<T, F, Fut>(path: &Path, policy: RetryPolicy, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = io::Result<T>>,
{
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if is_transient_lock(&err) => {
                let code = io_error_code(&err);
                if attempt >= policy.max_attempts {
                    warn!(
                        path = %path.display(),
                        attempts = attempt,
                        code = %code,
                        "File still locked, giving up"
                    );
                    return Err(CacheError::MaxRetries {
                        path: path.to_path_buf(),
                        attempts: attempt,
                        code,
                    });
                }

                let delay = policy.delay_after(attempt);
                debug!(
                    path = %path.display(),
                    attempt,
                    code = %code,
                    delay_ms = delay.as_millis() as u64,
                    "File locked, retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(err) => return Err(CacheError::from_io(path, &err)),
        }
    }
}

/// Vérifie qu'un fichier peut être ouvert en lecture, avec reprise sur verrou
pub async fn retry_access(path: &Path, policy: RetryPolicy) -> Result<()> {
    retry_with(path, policy, || async move {
        tokio::fs::File::open(path).await.map(|_| ())
    })
    .await
}
