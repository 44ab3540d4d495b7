//! # mediathumbs - Cache de vignettes de prévisualisation
//!
//! Cette crate est une spécialisation minimale de `mediacache` pour les
//! vignettes : même index, même coordination des téléchargements, même
//! éviction, dans un espace de noms séparé (`thumb-{id}.{ext}`, 200 éléments
//! par défaut).
//!
//! Contrairement au cache principal, un échec n'est jamais une erreur : la
//! requête se résout en `None` et l'échec est journalisé.
//!
//! ## Utilisation
//!
//! ```rust,no_run
//! use mediacache::CacheSettings;
//! use mediathumbs::{ThumbnailCache, ThumbnailConfig};
//!
//! #[tokio::main]
//! async fn main() -> mediacache::Result<()> {
//!     let settings = CacheSettings::for_config::<ThumbnailConfig>("./cache_thumbnails");
//!     let thumbs = ThumbnailCache::open(settings).await?;
//!
//!     // Tâche de fond, le résultat peut être ignoré
//!     thumbs.preload_detached("42".into(), Some("https://example.com/42.jpg".into()));
//!
//!     if let Some(path) = thumbs.request("7", Some("https://example.com/7.png")).await {
//!         println!("Vignette: {path:?}");
//!     }
//!     Ok(())
//! }
//! ```

pub mod cache;

#[cfg(feature = "mediaconfig")]
pub mod config_ext;

pub use cache::{Cache, ThumbnailCache, ThumbnailConfig};

#[cfg(feature = "mediaconfig")]
pub use config_ext::ThumbnailCacheConfigExt;
