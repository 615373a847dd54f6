mod cli;

use std::path::Path;

use anyhow::{Context, Result};
use clap::Parser;
use cli::{Cli, Commands};
use rh_core::config::Config;
use rh_core::EntryState;
use rh_db::{Store, StoreOptions};
use rh_probe::{CompositeExtractor, ExtractionOutcome, Extractor};
use tokio_util::sync::CancellationToken;

fn main() -> Result<()> {
    let cli = Cli::parse();

    // RUST_LOG wins; otherwise -v/-vv raise the default level.
    let env_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| {
        match cli.verbose {
            0 => "reelhouse=info,rh_server=info,rh_db=info,rh_probe=info",
            1 => "reelhouse=debug,rh_server=debug,rh_db=debug,rh_probe=debug,tower_http=debug",
            _ => "reelhouse=trace,rh_server=trace,rh_db=trace,rh_probe=trace,tower_http=trace",
        }
        .to_string()
    });
    tracing_subscriber::fmt()
        .with_env_filter(&env_filter)
        .init();

    let config_path = cli.config.as_deref();
    match cli.command {
        Commands::Start { host, port } => {
            let mut config = Config::load_or_default(config_path);
            if let Some(host) = host {
                config.server.host = host;
            }
            if let Some(port) = port {
                config.server.port = port;
            }
            let rt = tokio::runtime::Runtime::new()?;
            rt.block_on(start_server(config))
        }
        Commands::Scan => {
            let rt = tokio::runtime::Runtime::new()?;
            rt.block_on(scan(Config::load_or_default(config_path)))
        }
        Commands::Probe { file, json } => {
            let rt = tokio::runtime::Runtime::new()?;
            rt.block_on(probe_file(&file, json, &Config::load_or_default(config_path)))
        }
        Commands::List { state } => list_entries(&Config::load_or_default(config_path), &state),
        Commands::Validate => validate_config(config_path),
        Commands::Version => {
            println!("reelhouse {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}

async fn start_server(config: Config) -> Result<()> {
    tracing::info!(
        "Starting reelhouse on {}:{} ({} library roots)",
        config.server.host,
        config.server.port,
        config.library.roots.len()
    );
    rh_server::run(config, CancellationToken::new()).await?;
    Ok(())
}

async fn scan(config: Config) -> Result<()> {
    let counts = rh_server::scan(config).await?;
    println!("Indexed: {}", counts.indexed);
    println!("Pending: {}", counts.pending);
    println!("Stale:   {}", counts.stale);
    println!("Removed: {}", counts.removed);
    Ok(())
}

async fn probe_file(file: &Path, json: bool, config: &Config) -> Result<()> {
    if !file.exists() {
        anyhow::bail!("File does not exist: {}", file.display());
    }

    let extractor = CompositeExtractor::from_config(&config.tools);
    match extractor.extract(file).await {
        ExtractionOutcome::Extracted(meta) => {
            if json {
                println!("{}", serde_json::to_string_pretty(&meta)?);
                return Ok(());
            }
            println!("File: {}", file.display());
            println!("Container: {}", meta.container);
            println!("MIME type: {}", meta.mime_type);
            if let Some(secs) = meta.duration_secs {
                let secs = secs as u64;
                println!("Duration: {:02}:{:02}:{:02}", secs / 3600, (secs / 60) % 60, secs % 60);
            }
            if let Some(codec) = &meta.video_codec {
                match (meta.width, meta.height) {
                    (Some(w), Some(h)) => println!("Video: {codec} {w}x{h}"),
                    _ => println!("Video: {codec}"),
                }
            }
            if let Some(codec) = &meta.audio_codec {
                println!("Audio: {codec}");
            }
            for (key, value) in &meta.tags {
                println!("  {key}: {value}");
            }
            println!("Extractor: {}", meta.extractor);
            Ok(())
        }
        other => anyhow::bail!(
            "Could not extract metadata ({}): {}",
            other.kind(),
            other.reason().unwrap_or_default()
        ),
    }
}

fn list_entries(config: &Config, state: &str) -> Result<()> {
    let filter = if state.eq_ignore_ascii_case("all") {
        None
    } else {
        Some(state.parse::<EntryState>()?)
    };

    let store = Store::open_read_only(&config.server.db_path, StoreOptions::from(&config.store))
        .with_context(|| format!("opening store at {}", config.server.db_path.display()))?;
    let listing = store.list_by_state(filter)?;
    for entry in &listing {
        let detail = entry
            .error
            .as_deref()
            .or_else(|| entry.metadata.as_ref().map(|m| m.container.as_str()))
            .unwrap_or("-");
        println!(
            "{}  {:<8} {:>12}  {}  ({})",
            entry.id,
            entry.state,
            entry.size,
            entry.path.display(),
            detail
        );
    }
    println!("{} entries", listing.len());
    Ok(())
}

fn validate_config(path: Option<&Path>) -> Result<()> {
    let config = match path {
        Some(p) => {
            println!("Validating config: {}", p.display());
            let contents = std::fs::read_to_string(p)
                .with_context(|| format!("reading {}", p.display()))?;
            Config::from_json(&contents)?
        }
        None => {
            println!("No config file specified, using defaults");
            Config::default()
        }
    };

    println!("  Server: {}:{}", config.server.host, config.server.port);
    println!("  Store: {}", config.server.db_path.display());
    println!("  Library roots: {}", config.library.roots.len());
    println!("  Watch enabled: {}", config.watch.enabled);
    println!("  Indexer workers: {}", config.indexer.workers);

    let warnings = config.validate();
    if warnings.is_empty() {
        println!("✓ Configuration is valid");
    } else {
        for w in &warnings {
            println!("⚠ {w}");
        }
    }
    Ok(())
}
