use anyhow::{bail, Context};
use mediaconfig::Config;
use mediastore::{init_logging, MediaStore, PreloadItem};
use tracing::info;

const USAGE: &str = "usage: MediaStudio [stats | get <id> | fetch <id> <url> [file_name] | preload <manifest.json> | clear]";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ========== Configuration ==========
    let config = Config::load_config("")?;
    init_logging(&config);
    info!("📁 Configuration loaded from {}", config.get_config_dir());

    let store = MediaStore::from_config(&config).await?;

    // ========== Commande ==========
    let args: Vec<String> = std::env::args().skip(1).collect();
    let args: Vec<&str> = args.iter().map(String::as_str).collect();

    match args.as_slice() {
        [] | ["stats"] => {
            let stats = store.stats().await;
            println!("{}", serde_json::to_string_pretty(&stats)?);
        }
        ["get", id] => match store.get_cached_path(id).await {
            Some(path) => println!("{}", path.display()),
            None => bail!("{id} is not cached"),
        },
        ["fetch", id, url] => fetch(&store, id, url, "").await?,
        ["fetch", id, url, file_name] => fetch(&store, id, url, file_name).await?,
        ["preload", manifest] => {
            let json = tokio::fs::read_to_string(manifest)
                .await
                .with_context(|| format!("Cannot read manifest {manifest}"))?;
            let items = PreloadItem::parse_manifest(&json)
                .with_context(|| format!("Invalid manifest {manifest}"))?;

            let report = store.preload(&items).await;
            // Le runtime s'arrête à la sortie de main : les vignettes doivent être terminées
            let thumbnails = store.wait_thumbnails().await;
            info!("🖼️ {} thumbnail(s) cached", thumbnails);
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        ["clear"] => {
            let report = store.clear().await;
            info!("🧹 Cache cleared");
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        _ => bail!(USAGE),
    }

    Ok(())
}

async fn fetch(store: &MediaStore, id: &str, url: &str, file_name: &str) -> anyhow::Result<()> {
    let cancel = mediacache::CancellationToken::new();

    // Ctrl-C abandonne le téléchargement s'il est le seul demandeur
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            on_signal.cancel();
        }
    });

    let path = store
        .ensure_cached_with_cancel(id, url, file_name, &cancel)
        .await
        .with_context(|| format!("Cannot cache {id}"))?;
    info!("✅ {} cached", id);
    println!("{}", path.display());
    Ok(())
}
