//! Vérification de l'espace disque avant écriture
//!
//! Le contrôle est indicatif : si l'espace libre ne peut pas être mesuré, on
//! laisse passer l'écriture avec un avertissement.

use serde::Serialize;
use std::io;
use std::path::Path;
use std::sync::Arc;
use sysinfo::Disks;
use tracing::warn;

pub const MB: u64 = 1024 * 1024;

/// Marge de sécurité par défaut au-delà de la taille demandée
pub const DEFAULT_SAFETY_BUFFER: u64 = 500 * MB;

/// Seuil d'avertissement « espace faible » par défaut
pub const DEFAULT_LOW_SPACE_THRESHOLD: u64 = 2048 * MB;

/// Espace disque d'un volume
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiskSpace {
    pub available: u64,
    pub total: u64,
}

/// Source de mesure de l'espace libre pour un répertoire
pub trait SpaceProbe: Send + Sync {
    fn query(&self, dir: &Path) -> io::Result<DiskSpace>;
}

/// Mesure via `sysinfo` : volume dont le point de montage est le plus long
/// préfixe du répertoire cible
#[derive(Debug, Default, Clone, Copy)]
pub struct SysinfoProbe;

impl SpaceProbe for SysinfoProbe {
    fn query(&self, dir: &Path) -> io::Result<DiskSpace> {
        let target = std::fs::canonicalize(dir)?;
        let disks = Disks::new_with_refreshed_list();
        disks
            .list()
            .iter()
            .filter(|disk| target.starts_with(disk.mount_point()))
            .max_by_key(|disk| disk.mount_point().as_os_str().len())
            .map(|disk| DiskSpace {
                available: disk.available_space(),
                total: disk.total_space(),
            })
            .ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::NotFound,
                    format!("no mounted volume contains {}", target.display()),
                )
            })
    }
}

/// Mesure fixe, utile pour les tests et les environnements sans volume détectable
///
/// `None` simule une mesure impossible.
#[derive(Debug, Clone, Copy)]
pub struct StaticSpaceProbe(pub Option<DiskSpace>);

impl StaticSpaceProbe {
    pub fn available(bytes: u64) -> Self {
        Self(Some(DiskSpace {
            available: bytes,
            total: bytes,
        }))
    }

    pub fn failing() -> Self {
        Self(None)
    }
}

impl SpaceProbe for StaticSpaceProbe {
    fn query(&self, _dir: &Path) -> io::Result<DiskSpace> {
        self.0
            .ok_or_else(|| io::Error::other("disk space query unavailable"))
    }
}

/// Résultat d'un contrôle d'espace
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SpaceCheck {
    pub ok: bool,
    pub available_bytes: u64,
    /// Taille demandée augmentée de la marge de sécurité
    pub required_bytes: u64,
    pub message: String,
}

/// Contrôle préalable de l'espace disque
#[derive(Clone)]
pub struct DiskSpaceGuard {
    probe: Arc<dyn SpaceProbe>,
    safety_buffer: u64,
    low_space_threshold: u64,
}

impl std::fmt::Debug for DiskSpaceGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiskSpaceGuard")
            .field("safety_buffer", &self.safety_buffer)
            .field("low_space_threshold", &self.low_space_threshold)
            .finish()
    }
}

fn format_mb(bytes: u64) -> String {
    format!("{:.1} MB", bytes as f64 / MB as f64)
}

impl DiskSpaceGuard {
    pub fn new(probe: Arc<dyn SpaceProbe>, safety_buffer: u64, low_space_threshold: u64) -> Self {
        Self {
            probe,
            safety_buffer,
            low_space_threshold,
        }
    }

    /// Vérifie que `required` octets peuvent être écrits dans `dir`
    ///
    /// La mesure est faite sur le pool bloquant de tokio.
    pub async fn check(&self, required: u64, dir: &Path) -> SpaceCheck {
        let probe = Arc::clone(&self.probe);
        let target = dir.to_path_buf();
        let measured = match tokio::task::spawn_blocking(move || probe.query(&target)).await {
            Ok(result) => result,
            Err(e) => Err(io::Error::other(e.to_string())),
        };
        self.evaluate(required, measured, dir)
    }

    /// Applique la politique à une mesure déjà effectuée
    pub fn evaluate(&self, required: u64, measured: io::Result<DiskSpace>, dir: &Path) -> SpaceCheck {
        let required_bytes = required.saturating_add(self.safety_buffer);

        let space = match measured {
            Ok(space) => space,
            Err(e) => {
                warn!(dir = %dir.display(), error = %e, "Disk space check failed, allowing write");
                return SpaceCheck {
                    ok: true,
                    available_bytes: 0,
                    required_bytes,
                    message: format!("Disk space could not be checked: {e}"),
                };
            }
        };

        if space.available <= required_bytes {
            return SpaceCheck {
                ok: false,
                available_bytes: space.available,
                required_bytes,
                message: format!(
                    "Insufficient disk space: {} available, {} required",
                    format_mb(space.available),
                    format_mb(required_bytes)
                ),
            };
        }

        let message = if space.available < self.low_space_threshold {
            warn!(
                dir = %dir.display(),
                available = space.available,
                threshold = self.low_space_threshold,
                "Low disk space"
            );
            format!("Low disk space: {} available", format_mb(space.available))
        } else {
            format!("{} available", format_mb(space.available))
        };

        SpaceCheck {
            ok: true,
            available_bytes: space.available,
            required_bytes,
            message,
        }
    }
}
