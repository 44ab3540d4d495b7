//! Initialisation du système de logs
//!
//! Le niveau minimum vient de `host.logger.min_level`, sauf si `RUST_LOG`
//! est défini. La sortie console est activée par `host.logger.enable_console`.

use mediaconfig::Config;
use tracing::Level;
use tracing_subscriber::{
    filter::LevelFilter, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Registry,
};

fn string_to_level(s: &str) -> Option<Level> {
    match s.trim().to_uppercase().as_str() {
        "ERROR" => Some(Level::ERROR),
        "WARN" => Some(Level::WARN),
        "INFO" => Some(Level::INFO),
        "DEBUG" => Some(Level::DEBUG),
        "TRACE" => Some(Level::TRACE),
        _ => None,
    }
}

/// Niveau configuré, `INFO` si la valeur est absente ou invalide
pub fn configured_level(config: &Config) -> LevelFilter {
    match config.get_log_min_level() {
        Ok(l) => match string_to_level(&l) {
            Some(level) => LevelFilter::from_level(level),
            None => {
                eprintln!("Unknown log level '{}', using INFO", l);
                LevelFilter::INFO
            }
        },
        Err(_) => LevelFilter::INFO,
    }
}

/// Installe le subscriber global
///
/// Retourne `false` si un subscriber était déjà installé (appel répété,
/// tests) ; ce n'est pas une erreur.
pub fn init_logging(config: &Config) -> bool {
    let filter = EnvFilter::builder()
        .with_default_directive(configured_level(config).into())
        .from_env_lossy();

    let enable_console = config.get_log_enable_console().unwrap_or(true);

    let console = enable_console.then(|| {
        tracing_subscriber::fmt::layer()
            .with_target(true)
            .with_level(true)
            .with_ansi(true)
    });

    Registry::default()
        .with(filter)
        .with(console)
        .try_init()
        .is_ok()
}
