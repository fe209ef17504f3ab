//! wifiloc - estimate a position from visible WiFi access points.
//!
//! Reads a scan file, answers from the local AP location cache and, when a
//! resolver is configured, fills cache gaps in the background.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use wifiloc_core::cache::JsonFileBackend;
use wifiloc_core::{
    ApId, Config, Fix, HttpResolver, LocationCache, Locator, LocatorEvent, Observation,
    PositionEstimator, RefreshEvent, ScanSource,
};

// ============================================================================
// Constants
// ============================================================================

/// Directory for the daily rolling log file; unset means stderr only
const ENV_LOG_DIR: &str = "WIFILOC_LOG_DIR";

const LOG_FILE_PREFIX: &str = "wifiloc.log";

const USAGE: &str = "\
Usage:
  wifiloc locate <scan.json> [--wait] [--json]
  wifiloc show <ap>
  wifiloc stats [--json]";

/// Initialize the tracing subscriber for logging
fn init_tracing() {
    // Use RUST_LOG env var to control log level (e.g., RUST_LOG=debug)
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("warn"));

    let file_layer = std::env::var(ENV_LOG_DIR).ok().filter(|dir| !dir.is_empty()).map(|dir| {
        fmt::layer()
            .with_ansi(false)
            .with_writer(tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX))
    });

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(io::stderr))
        .with(file_layer)
        .with(filter)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (silently ignore if not found)
    let _ = dotenvy::dotenv();

    init_tracing();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let Some(command) = args.first() else {
        eprintln!("{}", USAGE);
        bail!("missing command");
    };
    let rest = &args[1..];

    let config = Config::load()?;

    match command.as_str() {
        "locate" => {
            let Some(scan_path) = rest.iter().find(|a| !a.starts_with("--")) else {
                eprintln!("{}", USAGE);
                bail!("locate needs a scan file");
            };
            let wait = has_flag(rest, "--wait");
            let json = has_flag(rest, "--json");
            locate(&config, Path::new(scan_path), wait, json).await
        }
        "show" => {
            let Some(raw) = rest.first() else {
                eprintln!("{}", USAGE);
                bail!("show needs an access point identifier");
            };
            show(&config, raw)
        }
        "stats" => stats(&config, has_flag(rest, "--json")),
        "-h" | "--help" | "help" => {
            println!("{}", USAGE);
            Ok(())
        }
        other => {
            eprintln!("{}", USAGE);
            bail!("unknown command: {}", other)
        }
    }
}

fn has_flag(args: &[String], flag: &str) -> bool {
    args.iter().any(|a| a == flag)
}

fn open_cache(config: &Config) -> Result<Arc<LocationCache>> {
    let cache_dir = config.cache_dir()?;
    let backend = JsonFileBackend::new(&cache_dir)
        .with_context(|| format!("Failed to open cache directory: {}", cache_dir.display()))?;
    let cache = LocationCache::open(backend).context("Failed to load location cache")?;
    Ok(Arc::new(cache))
}

fn print_fix(fix: &Fix, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string(fix)?);
    } else {
        println!("{}", fix);
    }
    Ok(())
}

// ============================================================================
// Scan files
// ============================================================================

/// Scan source backed by a JSON file of `{"bssid", "rssi"}` entries.
/// Re-read on every scan so an external scanner can keep it current.
struct FileScanSource {
    path: PathBuf,
}

impl FileScanSource {
    fn read(&self) -> Result<Vec<Observation>> {
        let contents = std::fs::read_to_string(&self.path)
            .with_context(|| format!("Failed to read scan file: {}", self.path.display()))?;
        serde_json::from_str(&contents)
            .with_context(|| format!("Failed to parse scan file: {}", self.path.display()))
    }
}

impl ScanSource for FileScanSource {
    fn scan(&self) -> Vec<Observation> {
        match self.read() {
            Ok(observations) => observations,
            Err(e) => {
                warn!(error = %e, "Rescan failed");
                Vec::new()
            }
        }
    }
}

// ============================================================================
// Commands
// ============================================================================

async fn locate(config: &Config, scan_path: &Path, wait: bool, json: bool) -> Result<()> {
    let source = FileScanSource {
        path: scan_path.to_path_buf(),
    };
    let observations = source.read()?;
    let cache = open_cache(config)?;

    let resolver_url = config.resolver_url.as_deref();
    let Some(url) = resolver_url.filter(|_| wait) else {
        // Answer from the cache alone; lookups need a resolver and --wait
        let estimate = PositionEstimator::new(config.stale_window()).calculate(
            &observations,
            &cache.snapshot()?,
            Utc::now(),
        );
        print_fix(&estimate.fix, json)?;
        if !estimate.need_refresh.is_empty() {
            if resolver_url.is_some() {
                warn!(
                    count = estimate.need_refresh.len(),
                    "Access points need a lookup, run with --wait to resolve them"
                );
            } else {
                warn!(
                    count = estimate.need_refresh.len(),
                    "Access points need a lookup but no resolver is configured"
                );
            }
        }
        cache.close();
        return Ok(());
    };

    let resolver = HttpResolver::new(url).context("Failed to build resolver client")?;
    let (locator, mut events) = Locator::new(
        Arc::clone(&cache),
        Arc::new(resolver),
        config,
        Some(Arc::new(source)),
    );
    info!(aps = observations.len(), "Locating from scan file");

    // Scans the file again, reports the fix and starts lookups
    locator.request_immediate_refresh().await?;
    let refreshing = locator.coordinator().stats().cycles_started > 0;

    while let Some(event) = events.recv().await {
        match event {
            LocatorEvent::Fix(fix) => {
                print_fix(&fix, json)?;
                if !refreshing {
                    break;
                }
            }
            LocatorEvent::Refresh(RefreshEvent::BatchFailed { aps, error }) => {
                eprintln!("lookup of {} access points failed: {}", aps.len(), error);
            }
            LocatorEvent::Refresh(RefreshEvent::Idle) => break,
            LocatorEvent::Refresh(RefreshEvent::BatchCommitted { .. }) => {}
        }
    }

    locator.shutdown().await;
    Ok(())
}

fn show(config: &Config, raw: &str) -> Result<()> {
    let ap = ApId::parse(raw)?;
    let cache = open_cache(config)?;
    let now = Utc::now();

    match cache.get(&ap)? {
        Some(record) => {
            let age = record.age_display(now);
            let stale = if record.is_stale(now, config.stale_window()) {
                ", stale"
            } else {
                ""
            };
            match record.location() {
                Some(loc) if !loc.has_accuracy() => println!(
                    "{}: {:.6}, {:.6} accuracy unknown (checked {}{})",
                    ap, loc.latitude, loc.longitude, age, stale
                ),
                Some(loc) => println!(
                    "{}: {:.6}, {:.6} ±{:.0}m (checked {}{})",
                    ap, loc.latitude, loc.longitude, loc.accuracy, age, stale
                ),
                None => println!("{}: unknown to resolver (checked {}{})", ap, age, stale),
            }
        }
        None => println!("{}: not cached", ap),
    }
    Ok(())
}

#[derive(Serialize)]
struct StatsReport {
    total: usize,
    resolved: usize,
    unknown: usize,
    stale: usize,
    newest: Option<DateTime<Utc>>,
    cache_dir: PathBuf,
}

fn stats(config: &Config, json: bool) -> Result<()> {
    let cache = open_cache(config)?;
    let summary = cache.summary(Utc::now(), config.stale_window())?;
    let report = StatsReport {
        total: summary.total(),
        resolved: summary.resolved,
        unknown: summary.unknown,
        stale: summary.stale,
        newest: summary.newest,
        cache_dir: config.cache_dir()?,
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    println!("Cache:    {}", report.cache_dir.display());
    println!("Records:  {}", report.total);
    println!("Resolved: {}", report.resolved);
    println!("Unknown:  {}", report.unknown);
    println!("Stale:    {}", report.stale);
    if let Some(newest) = report.newest {
        println!("Newest:   {}", newest.format("%Y-%m-%d %H:%M UTC"));
    }
    Ok(())
}
