//! # mediacache - Cache disque générique de médias distants
//!
//! Cette crate fournit un cache de fichiers téléchargés en HTTP(S) et stockés
//! à plat dans un répertoire. Elle sert de base au cache des médias
//! principaux ([`AssetConfig`]) et au cache des vignettes (`mediathumbs`).
//!
//! ## Vue d'ensemble
//!
//! - un index en mémoire `id -> CacheEntry`, reconstruit au démarrage à partir
//!   des noms de fichiers (pas de base de données ni de manifeste)
//! - un seul transfert par identifiant, partagé par tous les appelants
//! - une éviction LRU après chaque insertion (par nombre ou par octets)
//! - une vérification de l'espace disque avant chaque écriture
//! - des tentatives répétées sur les fichiers verrouillés
//!
//! ## Architecture
//!
//! ```text
//! mediacache
//!     ├── index.rs       - Index en mémoire et réhydratation
//!     ├── naming.rs      - Convention {prefix}-{id}.{ext}
//!     ├── disk_guard.rs  - Contrôle de l'espace disque
//!     ├── retry.rs       - Tentatives avec backoff exponentiel
//!     ├── eviction.rs    - Politiques d'éviction
//!     ├── fetch.rs       - GET HTTP avec redirections bornées
//!     ├── download.rs    - Coordination des téléchargements
//!     └── cache.rs       - Cache générique Cache<C>
//! ```
//!
//! ## Utilisation
//!
//! ```rust,no_run
//! use mediacache::{AssetConfig, Cache, CacheSettings};
//!
//! #[tokio::main]
//! async fn main() -> mediacache::Result<()> {
//!     let settings = CacheSettings::for_config::<AssetConfig>("./cache_media");
//!     let cache = Cache::<AssetConfig>::open(settings).await?;
//!
//!     let path = cache
//!         .ensure_cached("42", "https://example.com/clip.mp4", "clip.mp4")
//!         .await?;
//!     println!("Fichier stocké à: {:?}", path);
//!
//!     assert_eq!(cache.get("42").await, Some(path));
//!     Ok(())
//! }
//! ```
//!
//! ## Structure des fichiers
//!
//! ```text
//! cache_media/
//! ├── media-42.mp4
//! ├── media-42 (1).mp4      # collision : même identifiant
//! └── media-7.png.part      # transfert en cours
//! ```

pub mod cache;
pub mod disk_guard;
pub mod download;
pub mod error;
pub mod eviction;
pub mod fetch;
pub mod index;
pub mod naming;
pub mod retry;

#[cfg(feature = "mediaconfig")]
pub mod config_ext;

pub use cache::{AssetConfig, Cache, CacheConfig, CacheSettings, CacheStats, ClearReport};
pub use disk_guard::{DiskSpace, DiskSpaceGuard, SpaceCheck, SpaceProbe, StaticSpaceProbe, SysinfoProbe};
pub use download::{Download, DownloadCoordinator, DownloadProgress};
pub use error::{CacheError, Result};
pub use eviction::{ByteQuotaPolicy, EvictionKind, EvictionPolicy, LruCountPolicy};
pub use fetch::HttpFetcher;
pub use index::{AssetIndex, AssetKind, CacheEntry};
pub use retry::{retry_access, RetryPolicy};
pub use tokio_util::sync::CancellationToken;

#[cfg(feature = "mediaconfig")]
pub use config_ext::CacheConfigExt;
