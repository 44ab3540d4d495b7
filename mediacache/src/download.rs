//! Coordination des téléchargements
//!
//! Un seul transfert physique par identifiant : les appelants qui demandent un
//! identifiant déjà en cours de téléchargement se rattachent au transfert
//! existant et reçoivent le même résultat (chemin ou erreur).
//!
//! Chaque transfert tourne dans sa propre tâche tokio. Son état est publié
//! sur un canal `watch` que les appelants observent.

use crate::disk_guard::{DiskSpaceGuard, MB};
use crate::error::{CacheError, Result};
use crate::eviction::{delete_victims, take_victims, EvictionPolicy};
use crate::fetch::HttpFetcher;
use crate::index::{CacheEntry, SharedIndex};
use crate::naming::{cached_file_name, part_path, pick_extension, reserve_unique_path, validate_id};
use crate::retry::{retry_with, RetryPolicy};
use futures_util::StreamExt;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::sync::{watch, RwLock};
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Taille estimée d'un fichier dont la taille n'est pas encore connue
pub const DEFAULT_ESTIMATED_SIZE: u64 = 100 * MB;

/// Durée maximale d'un transfert
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(300);

/// État publié par un transfert
#[derive(Debug, Clone, Default)]
pub struct DownloadState {
    /// Octets reçus
    pub current_size: u64,
    /// Taille annoncée par `Content-Length`
    pub expected_size: Option<u64>,
    /// Résultat final, présent une fois le transfert terminé
    pub outcome: Option<Result<PathBuf>>,
}

impl DownloadState {
    pub fn finished(&self) -> bool {
        self.outcome.is_some()
    }
}

/// Progression d'un transfert en cours
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DownloadProgress {
    pub received: u64,
    pub expected: Option<u64>,
}

/// Transfert en cours pour un identifiant
#[derive(Debug)]
pub struct Download {
    id: String,
    url: String,
    state: watch::Sender<DownloadState>,
    /// Appelants rattachés qui n'ont pas annulé
    interested: AtomicUsize,
    cancel: CancellationToken,
}

impl Download {
    fn new(id: &str, url: &str) -> Arc<Self> {
        let (state, _) = watch::channel(DownloadState::default());
        Arc::new(Self {
            id: id.to_string(),
            url: url.to_string(),
            state,
            interested: AtomicUsize::new(1),
            cancel: CancellationToken::new(),
        })
    }

    pub fn progress(&self) -> DownloadProgress {
        let state = self.state.borrow();
        DownloadProgress {
            received: state.current_size,
            expected: state.expected_size,
        }
    }

    pub fn finished(&self) -> bool {
        self.state.borrow().finished()
    }

    /// Le transfert a été interrompu (annulation) et ne doit plus être rejoint
    pub fn is_aborted(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Interrompt le transfert pour tous les appelants
    pub fn abort(&self) {
        self.cancel.cancel();
    }

    /// Rattache un appelant, sauf si tous les appelants précédents ont annulé
    fn try_attach(&self) -> bool {
        self.interested
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n > 0).then_some(n + 1)
            })
            .is_ok()
    }

    fn detach(&self) {
        if self.interested.fetch_sub(1, Ordering::AcqRel) == 1 && !self.finished() {
            info!(id = %self.id, "Every caller cancelled, aborting download");
            self.cancel.cancel();
        }
    }

    fn set_expected(&self, expected: u64) {
        self.state.send_modify(|s| s.expected_size = Some(expected));
    }

    fn set_received(&self, received: u64) {
        self.state.send_modify(|s| s.current_size = received);
    }

    fn publish(&self, outcome: Result<PathBuf>) {
        self.state.send_modify(|s| s.outcome = Some(outcome));
    }

    /// Attend la fin du transfert
    ///
    /// Si `cancel` est déclenché avant, seul cet appelant est détaché et
    /// reçoit [`CacheError::Cancelled`] ; le transfert continue tant qu'un
    /// autre appelant l'attend.
    pub async fn wait(&self, cancel: Option<&CancellationToken>) -> Result<PathBuf> {
        let rx = self.state.subscribe();
        match cancel {
            None => wait_outcome(rx).await,
            Some(token) => {
                tokio::select! {
                    biased;
                    outcome = wait_outcome(rx) => outcome,
                    _ = token.cancelled() => {
                        debug!(id = %self.id, "Caller cancelled, detaching");
                        self.detach();
                        Err(CacheError::Cancelled)
                    }
                }
            }
        }
    }
}

async fn wait_outcome(mut rx: watch::Receiver<DownloadState>) -> Result<PathBuf> {
    let outcome = match rx.wait_for(|s| s.finished()).await {
        Ok(state) => state.outcome.clone(),
        Err(_) => None,
    };
    outcome.unwrap_or_else(|| {
        Err(CacheError::Internal(
            "download ended without publishing a result".to_string(),
        ))
    })
}

/// Nom réservé le temps d'un transfert, libéré à la destruction
struct Reservation {
    reserved: Arc<Mutex<HashSet<PathBuf>>>,
    path: PathBuf,
}

impl Reservation {
    async fn acquire(reserved: &Arc<Mutex<HashSet<PathBuf>>>, dir: &Path, file_name: &str) -> Self {
        let path = reserve_unique_path(dir, file_name, reserved).await;
        Self {
            reserved: Arc::clone(reserved),
            path,
        }
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        self.reserved
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.path);
    }
}

/// Paramètres d'un coordinateur
#[derive(Debug, Clone)]
pub struct CoordinatorOptions {
    pub dir: PathBuf,
    pub prefix: String,
    pub default_extension: String,
    pub estimated_size: u64,
    pub timeout: Duration,
    /// Reprise du renommage final si le fichier est verrouillé
    pub retry: RetryPolicy,
}

/// Coordinateur des téléchargements d'un espace de noms
#[derive(Debug, Clone)]
pub struct DownloadCoordinator {
    options: Arc<CoordinatorOptions>,
    index: SharedIndex,
    downloads: Arc<RwLock<HashMap<String, Arc<Download>>>>,
    reserved: Arc<Mutex<HashSet<PathBuf>>>,
    fetcher: HttpFetcher,
    guard: DiskSpaceGuard,
    policy: Arc<dyn EvictionPolicy>,
}

async fn remove_partial(part: &Path) {
    match tokio::fs::remove_file(part).await {
        Ok(()) => debug!(file = %part.display(), "Removed partial file"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(file = %part.display(), error = %e, "Unable to remove partial file"),
    }
}

async fn write_body(response: reqwest::Response, part: &Path, download: &Download) -> Result<u64> {
    let mut file = tokio::fs::File::create(part)
        .await
        .map_err(|e| CacheError::from_io(part, &e))?;
    let mut stream = response.bytes_stream();
    let mut written = 0u64;

    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| CacheError::Network(format!("failed to read body: {e}")))?;
        file.write_all(&chunk)
            .await
            .map_err(|e| CacheError::from_io(part, &e))?;
        written += chunk.len() as u64;
        download.set_received(written);
    }

    file.flush().await.map_err(|e| CacheError::from_io(part, &e))?;
    file.sync_all()
        .await
        .map_err(|e| CacheError::from_io(part, &e))?;
    Ok(written)
}

/// Renomme le fichier temporaire en fichier final
///
/// Un verrou transitoire (antivirus, indexeur) est réessayé ; en cas d'échec
/// définitif le fichier temporaire est supprimé.
async fn persist(part: &Path, destination: &Path, policy: RetryPolicy) -> Result<()> {
    let renamed = retry_with(destination, policy, || tokio::fs::rename(part, destination)).await;
    if renamed.is_err() {
        remove_partial(part).await;
    }
    renamed
}

impl DownloadCoordinator {
    pub fn new(
        options: CoordinatorOptions,
        index: SharedIndex,
        fetcher: HttpFetcher,
        guard: DiskSpaceGuard,
        policy: Arc<dyn EvictionPolicy>,
    ) -> Self {
        Self {
            options: Arc::new(options),
            index,
            downloads: Arc::new(RwLock::new(HashMap::new())),
            reserved: Arc::new(Mutex::new(HashSet::new())),
            fetcher,
            guard,
            policy,
        }
    }

    pub fn policy(&self) -> &dyn EvictionPolicy {
        self.policy.as_ref()
    }

    /// Télécharge `url` pour l'identifiant `id`, ou rejoint le transfert en cours
    ///
    /// Retourne immédiatement le chemin si l'identifiant est déjà indexé.
    pub async fn request(
        &self,
        id: &str,
        url: &str,
        file_name: &str,
        cancel: Option<&CancellationToken>,
    ) -> Result<PathBuf> {
        validate_id(id)?;
        if cancel.is_some_and(|t| t.is_cancelled()) {
            return Err(CacheError::Cancelled);
        }

        let download = {
            let mut downloads = self.downloads.write().await;
            match downloads.get(id) {
                Some(existing) if !existing.is_aborted() && existing.try_attach() => {
                    debug!(id, "Download already in progress, joining");
                    Arc::clone(existing)
                }
                _ => {
                    let hit = self.index.lock().touch(id);
                    if let Some(path) = hit {
                        debug!(id, "Already cached");
                        return Ok(path);
                    }

                    let download = Download::new(id, url);
                    downloads.insert(id.to_string(), Arc::clone(&download));
                    self.spawn_transfer(Arc::clone(&download), file_name.to_string());
                    download
                }
            }
        };

        download.wait(cancel).await
    }

    /// Interrompt le transfert en cours pour `id`, pour tous les appelants
    ///
    /// Retourne `false` si aucun transfert n'est en cours.
    pub async fn cancel(&self, id: &str) -> bool {
        match self.downloads.read().await.get(id) {
            Some(download) => {
                info!(id, "Cancelling download");
                download.abort();
                true
            }
            None => false,
        }
    }

    pub async fn progress(&self, id: &str) -> Option<DownloadProgress> {
        self.downloads.read().await.get(id).map(|d| d.progress())
    }

    /// Nombre de transferts en cours
    pub async fn in_flight(&self) -> usize {
        self.downloads.read().await.len()
    }

    fn spawn_transfer(&self, download: Arc<Download>, file_name: String) {
        let this = self.clone();
        tokio::spawn(async move {
            let task = {
                let this = this.clone();
                let download = Arc::clone(&download);
                tokio::spawn(async move { this.transfer(&download, &file_name).await })
            };

            let outcome = match task.await {
                Ok(outcome) => outcome,
                Err(e) => {
                    error!(id = %download.id, error = %e, "Download task died");
                    Err(CacheError::Internal(format!("download task failed: {e}")))
                }
            };

            this.finish(&download, outcome).await;
        });
    }

    async fn finish(&self, download: &Arc<Download>, outcome: Result<PathBuf>) {
        {
            let mut downloads = self.downloads.write().await;
            if downloads
                .get(&download.id)
                .is_some_and(|current| Arc::ptr_eq(current, download))
            {
                downloads.remove(&download.id);
            }
        }

        match &outcome {
            Ok(path) => debug!(id = %download.id, path = %path.display(), "Download finished"),
            Err(e) => warn!(id = %download.id, url = %download.url, error = %e, "Download failed"),
        }
        download.publish(outcome);
    }

    async fn ensure_space(&self, required: u64) -> Result<()> {
        let check = self.guard.check(required, &self.options.dir).await;
        if check.ok {
            Ok(())
        } else {
            warn!(dir = %self.options.dir.display(), "{}", check.message);
            Err(CacheError::DiskFull {
                available: check.available_bytes,
                required: check.required_bytes,
            })
        }
    }

    fn timeout_error(&self) -> CacheError {
        CacheError::Timeout {
            secs: self.options.timeout.as_secs(),
        }
    }

    async fn transfer(&self, download: &Download, file_name: &str) -> Result<PathBuf> {
        let options = &self.options;
        let deadline = Instant::now() + options.timeout;
        let token = download.cancel.clone();

        self.ensure_space(options.estimated_size).await?;

        info!(id = %download.id, url = %download.url, "Starting download");
        let response = tokio::select! {
            biased;
            _ = token.cancelled() => return Err(CacheError::Cancelled),
            _ = sleep_until(deadline) => return Err(self.timeout_error()),
            response = self.fetcher.get(&download.url) => response?,
        };

        if let Some(length) = response.content_length() {
            download.set_expected(length);
            if length > options.estimated_size {
                self.ensure_space(length).await?;
            }
        }

        let extension = pick_extension(file_name, &download.url, &options.default_extension);
        let target = cached_file_name(&options.prefix, &download.id, &extension);
        let reservation = Reservation::acquire(&self.reserved, &options.dir, &target).await;
        let destination = reservation.path.clone();
        let part = part_path(&destination);

        let written = tokio::select! {
            biased;
            _ = token.cancelled() => Err(CacheError::Cancelled),
            _ = sleep_until(deadline) => Err(self.timeout_error()),
            written = write_body(response, &part, download) => written,
        };
        let size = match written {
            Ok(size) => size,
            Err(e) => {
                remove_partial(&part).await;
                return Err(e);
            }
        };

        persist(&part, &destination, options.retry).await?;
        drop(reservation);

        let victims = {
            let mut index = self.index.lock();
            let stamp = index.stamp();
            index.register(CacheEntry::new(download.id.as_str(), &destination, size, stamp));
            take_victims(&mut index, self.policy.as_ref())
        };
        delete_victims(&victims).await;

        info!(
            id = %download.id,
            file = %destination.display(),
            bytes = size,
            "Download complete"
        );
        Ok(destination)
    }
}
