//! trailmap - keep a web map usable offline.
//!
//! Thin command-line host around `trailmap-core`: pre-caches the
//! application, routes single requests through the offline router, saves map
//! regions as tiles and syncs route files against the server manifest.

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use dialoguer::{theme::ColorfulTheme, Confirm};
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use trailmap_core::tiles::coverage_geojson;
use trailmap_core::utils::{format_bytes, truncate_string};
use trailmap_core::{
    BatchOutcome, BulkDownloadCoordinator, Config, DownloadOptions, DownloadProgress, HttpClient,
    LatLngBounds, LifecycleMessage, LookupOptions, Notification, Notifier, OfflineHost, Request,
    ResponseSource, TileStore, ZoomSelection,
};

// ============================================================================
// Constants
// ============================================================================

/// Directory for a daily rolling log file, in addition to stderr.
const LOG_DIR_ENV: &str = "TRAILMAP_LOG_DIR";

const LOG_FILE_PREFIX: &str = "trailmap.log";

/// Longest body preview printed by `fetch`.
const BODY_PREVIEW_CHARS: usize = 200;

#[derive(Parser, Debug)]
#[command(name = "trailmap", version, about = "Keep a web map usable offline")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Pre-cache the application and priority routes, then activate
    Install,
    /// Delete superseded cache generations
    Activate,
    /// Sync cached route files with the manifest
    Sync {
        /// Manifest categories (default: the priority categories)
        types: Vec<String>,
    },
    /// Show what a sync would change
    Status {
        /// Manifest categories (default: the priority categories)
        types: Vec<String>,
    },
    /// Route one GET request through the offline cache
    Fetch {
        /// Absolute URL or path relative to the origin
        url: String,
        /// Send `Accept: text/html`, like a page navigation
        #[arg(long)]
        html: bool,
    },
    /// Save a map region as tiles
    SaveTiles {
        /// Region as south,west,north,east in decimal degrees
        #[arg(value_parser = parse_bounds, allow_hyphen_values = true)]
        bounds: LatLngBounds,
        /// Zoom levels: 13 | 12,14 | 12-15 | see:13 (current zoom up to max_zoom)
        #[arg(value_parser = parse_zooms)]
        zooms: ZoomSelection,
        /// Tile URL template (default: tile_template from the config)
        #[arg(long)]
        template: Option<String>,
        /// Don't ask for confirmation
        #[arg(short, long)]
        yes: bool,
    },
    /// Count stored tiles
    Tiles {
        /// Print the stored tiles of the template as GeoJSON instead
        #[arg(long)]
        coverage: bool,
        /// Tile URL template (default: tile_template from the config)
        #[arg(long)]
        template: Option<String>,
    },
    /// Remove every stored tile
    ClearTiles {
        /// Don't ask for confirmation
        #[arg(short, long)]
        yes: bool,
    },
    /// Post a lifecycle message, e.g. '{"type":"SYNC_GPX"}'
    Message { json: String },
}

/// Initialize the tracing subscriber for logging
fn init_tracing() -> Option<WorkerGuard> {
    // Use RUST_LOG env var to control log level (e.g., RUST_LOG=debug)
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    let (file_layer, guard) = match std::env::var(LOG_DIR_ENV) {
        Ok(dir) if !dir.is_empty() => {
            let appender = tracing_appender::rolling::daily(PathBuf::from(dir), LOG_FILE_PREFIX);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (Some(fmt::layer().with_ansi(false).with_writer(writer)), Some(guard))
        }
        _ => (None, None),
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(io::stderr))
        .with(file_layer)
        .with(filter)
        .init();
    guard
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (silently ignore if not found)
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();
    let _guard = init_tracing();

    let config = Config::load().context("Failed to load config")?;
    info!(command = ?cli.command, origin = %config.origin, "trailmap starting");

    match cli.command {
        Command::Install => install(config).await,
        Command::Activate => activate(config).await,
        Command::Sync { types } => message(config, LifecycleMessage::SyncGpx { types: types_filter(types) }).await,
        Command::Status { types } => {
            message(config, LifecycleMessage::GetSyncStatus { types: types_filter(types) }).await
        }
        Command::Fetch { url, html } => fetch(config, &url, html).await,
        Command::SaveTiles {
            bounds,
            zooms,
            template,
            yes,
        } => save_tiles(config, bounds, zooms, template.as_deref(), yes).await,
        Command::Tiles { coverage, template } => tiles(config, coverage, template.as_deref()).await,
        Command::ClearTiles { yes } => clear_tiles(config, yes).await,
        Command::Message { json } => {
            let host = OfflineHost::open(config).await?;
            print_json(&host.handle_json(&json).await)
        }
    }
}

/// No categories on the command line means the priority categories.
fn types_filter(types: Vec<String>) -> Option<Vec<String>> {
    (!types.is_empty()).then_some(types)
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Ask a yes/no question; anything but an explicit yes is a no.
fn confirm(prompt: &str) -> bool {
    Confirm::with_theme(&ColorfulTheme::default())
        .with_prompt(prompt)
        .default(false)
        .interact()
        .unwrap_or(false)
}

fn parse_bounds(arg: &str) -> std::result::Result<LatLngBounds, String> {
    LatLngBounds::parse(arg).ok_or_else(|| "expected south,west,north,east".to_string())
}

fn parse_zooms(arg: &str) -> std::result::Result<ZoomSelection, String> {
    let zoom = |z: &str| z.trim().parse::<u32>().map_err(|e| format!("invalid zoom {:?}: {}", z, e));

    if let Some(current) = arg.strip_prefix("see:") {
        return Ok(ZoomSelection::SaveWhatYouSee {
            current_zoom: zoom(current)?,
        });
    }
    if let Some((from, to)) = arg.split_once('-') {
        let (from, to) = (zoom(from)?, zoom(to)?);
        if from > to {
            return Err(format!("invalid zoom range {:?}", arg));
        }
        return Ok(ZoomSelection::Levels((from..=to).collect()));
    }
    let levels = arg.split(',').map(zoom).collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(ZoomSelection::Levels(levels))
}

async fn install(config: Config) -> Result<()> {
    let host = OfflineHost::open(config).await?;
    let report = host.install().await.context("Installation failed")?;
    let deleted = host.activate().await.context("Activation failed")?;
    eprintln!(
        "Cached {} files ({} failed), {} routes ({} failed); removed {} old generations",
        report.precached,
        report.precache_failed,
        report.routes_cached,
        report.routes_failed,
        deleted.len()
    );
    print_json(&report)
}

async fn activate(config: Config) -> Result<()> {
    let host = OfflineHost::open(config).await?;
    let deleted = host.activate().await?;
    for generation in &deleted {
        eprintln!("Deleted old cache: {}", generation);
    }
    Ok(())
}

async fn message(config: Config, message: LifecycleMessage) -> Result<()> {
    let host = OfflineHost::open(config).await?;
    let reply = host.handle_message(message).await;
    print_json(&reply)?;
    if !reply.success {
        bail!(reply.error.unwrap_or_else(|| "request failed".to_string()));
    }
    Ok(())
}

async fn fetch(config: Config, target: &str, html: bool) -> Result<()> {
    let url = config
        .url_for(target)
        .with_context(|| format!("Invalid URL: {}", target))?;

    let mut request = Request::get(url);
    if html {
        request = request.with_header("accept", "text/html");
    }

    let host = OfflineHost::open(config).await?;
    let class = host.router().classify(&request);
    let Some(routed) = host.router().handle(&request).await else {
        bail!("Request is not intercepted");
    };
    eprintln!(
        "{:?} via {:?}: {} ({})",
        class,
        routed.source,
        routed.response.status(),
        format_bytes(routed.response.body.len() as u64)
    );
    if routed.source == ResponseSource::Cache {
        let options = LookupOptions::default().ignoring_query();
        if let Some(entry) = host.cache().lookup_entry(&request.url, options).await {
            eprintln!("Cached {} ({})", entry.age_display(), entry.cached_at.to_rfc3339());
        }
    }
    println!("{}", truncate_string(&routed.response.text(), BODY_PREVIEW_CHARS));
    Ok(())
}

async fn open_coordinator(config: &Config, options: DownloadOptions) -> Result<BulkDownloadCoordinator> {
    let store = Arc::new(
        TileStore::open(config.tiles_dir()?)
            .await
            .context("Failed to open tile store")?,
    );
    let fetcher = Arc::new(HttpClient::new(config.request_timeout())?);
    Ok(BulkDownloadCoordinator::new(fetcher, store, Notifier::new(), options))
}

/// Report saved tiles until the batch ends. Returns the final counters, or
/// `None` when the channel closed first. Lagging behind only skips updates.
async fn follow_progress(
    mut rx: broadcast::Receiver<Notification>,
    mut on_saved: impl FnMut(&DownloadProgress),
) -> Option<DownloadProgress> {
    loop {
        match rx.recv().await {
            Ok(Notification::TileSaved(progress)) => on_saved(&progress),
            Ok(Notification::SaveEnd(progress)) => return Some(progress),
            Ok(_) | Err(RecvError::Lagged(_)) => continue,
            Err(RecvError::Closed) => return None,
        }
    }
}

async fn save_tiles(
    config: Config,
    bounds: LatLngBounds,
    selection: ZoomSelection,
    template: Option<&str>,
    yes: bool,
) -> Result<()> {
    let mut options = DownloadOptions::from_config(&config);
    if !yes {
        options.confirm = Some(Arc::new(|progress: &DownloadProgress| {
            confirm(&format!("Save {} tiles?", progress.length_to_be_saved))
        }));
    }
    let parallel = options.parallel;
    let coordinator = open_coordinator(&config, options).await?;

    let layer = config.tile_layer(template);
    let tiles = coordinator.plan_region(&layer, &bounds, &selection)?;

    let rx = coordinator.notifier().subscribe();
    let progress = tokio::spawn(follow_progress(rx, |p| {
        eprint!("\rSaved {}/{}", p.length_saved, p.length_to_be_saved);
    }));

    match coordinator.start_batch(tiles, parallel).await {
        BatchOutcome::Declined => {
            progress.abort();
            eprintln!("Cancelled");
        }
        BatchOutcome::Completed(status) => {
            let _ = progress.await;
            eprintln!();
            eprintln!(
                "Saved {} of {} tiles ({} failed), {} stored",
                status.length_saved, status.length_to_be_saved, status.length_failed, status.storage_size
            );
        }
    }
    Ok(())
}

async fn tiles(config: Config, coverage: bool, template: Option<&str>) -> Result<()> {
    let store = TileStore::open(config.tiles_dir()?)
        .await
        .context("Failed to open tile store")?;
    if !coverage {
        println!("{}", store.count().await);
        return Ok(());
    }
    let layer = config.tile_layer(template);
    let stored = store.find_info_by_template(&layer.url_template).await;
    print_json(&coverage_geojson(&stored, layer.tile_size))
}

async fn clear_tiles(config: Config, yes: bool) -> Result<()> {
    let mut options = DownloadOptions::from_config(&config);
    if !yes {
        options.confirm_removal = Some(Arc::new(|_: &DownloadProgress| confirm("Remove all the tiles?")));
    }
    let coordinator = open_coordinator(&config, options).await?;
    if coordinator.clear_all().await? {
        eprintln!("All tiles removed");
    } else {
        eprintln!("Cancelled");
    }
    Ok(())
}
