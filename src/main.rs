// src/main.rs

use anyhow::{bail, Context, Result};
use capture_ledger::config::{default_config_dir, LedgerConfig};
use capture_ledger::*;
use std::env;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

const USAGE: &str = "[--config PATH] <migrate | info | record <artifact_path> [camera_index] | list <year> <month>>";

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let mut args: Vec<String> = env::args().collect();
    let program = args.remove(0);

    // ========== CONFIG ==========
    let config = if args.first().map(String::as_str) == Some("--config") {
        if args.len() < 2 {
            eprintln!("Usage: {} {}", program, USAGE);
            return Ok(());
        }
        let path = PathBuf::from(args.remove(1));
        args.remove(0);
        LedgerConfig::load(&path).with_context(|| format!("loading {}", path.display()))?
    } else {
        LedgerConfig::ensure(&default_config_dir())?
    };

    let Some(command) = args.first().cloned() else {
        eprintln!("Usage: {} {}", program, USAGE);
        return Ok(());
    };

    // ========== LEDGER ==========
    let ledger = Arc::new(Ledger::open(&config)?);
    let ctx = SessionContext::new(CaptureId::generate().to_string());
    tracing::info!("Data directory: {}", config.data_dir.display());

    match command.as_str() {
        "migrate" => {
            let report = blocking(&ledger, move |l| l.startup(&ctx)).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        "info" => {
            let (count, pending, checkpoint) = blocking(&ledger, |l| {
                let count = l.index().count()?;
                let pending = l.fallback_log().len()?;
                let checkpoint = l.migrator().load_checkpoint();
                Ok((count, pending, checkpoint))
            })
            .await?;
            println!("index:       {} ({} captures)", config.index_path().display(), count);
            println!("fallback:    {} ({} bytes)", config.fallback_path().display(), pending);
            match checkpoint {
                Some(cp) => println!("checkpoint:  offset {} ({} migrated, {})", cp.offset, cp.migrated_total, cp.completed_at),
                None => println!("checkpoint:  none"),
            }
        }
        "record" => {
            let artifact = args.get(1).map(PathBuf::from).context("record needs <artifact_path>")?;
            let camera_index: u32 = match args.get(2) {
                Some(raw) => raw.parse().with_context(|| format!("bad camera index '{}'", raw))?,
                None => 0,
            };
            let format = artifact
                .extension()
                .and_then(|e| e.to_str())
                .map(MediaFormat::from_extension);
            let mut record = CaptureRecord::new(&ctx.session_id, artifact, camera_index);
            record.metadata.format = format;

            let outcome = blocking(&ledger, move |l| l.record(&ctx, &record).map(|o| (o, record.id))).await?;
            println!("{} {:?}", outcome.1, outcome.0);
        }
        "list" => {
            let (year, month) = match (args.get(1), args.get(2)) {
                (Some(y), Some(m)) => (y.parse::<i32>()?, m.parse::<u32>()?),
                _ => bail!("list needs <year> <month>"),
            };
            let records = blocking(&ledger, move |l| l.index().list_month(year, month)).await?;
            for r in records {
                println!("{}", serde_json::to_string(&r)?);
            }
        }
        other => {
            eprintln!("Unknown command '{}'", other);
            eprintln!("Usage: {} {}", program, USAGE);
        }
    }

    Ok(())
}

/// Ledger calls block on SQLite and fsync; keep them off the async workers.
async fn blocking<T, F>(ledger: &Arc<Ledger>, f: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce(&Ledger) -> capture_ledger::Result<T> + Send + 'static,
{
    let ledger = Arc::clone(ledger);
    let out = tokio::task::spawn_blocking(move || f(&ledger)).await??;
    Ok(out)
}
