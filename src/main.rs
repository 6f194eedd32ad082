use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use geo_store::{GeoConfig, GeoError, GeoStore, IndicatifProgress};
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(
    name = "geo-rag-backend",
    about = "Ingest geotagged texts into Qdrant and search them by place and meaning"
)]
struct Cli {
    /// Target collection (overrides GEO_COLLECTION)
    #[arg(long, global = true)]
    collection: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Upload the NDJSON source in checkpointed chunks
    Ingest {
        /// NDJSON source (overrides GEO_SOURCE_PATH)
        #[arg(long)]
        source: Option<PathBuf>,

        /// Records per chunk (overrides GEO_CHUNK_SIZE)
        #[arg(long)]
        chunk_size: Option<usize>,

        /// Start from the first line instead of the stored checkpoint
        #[arg(long)]
        no_resume: bool,

        /// Render a spinner on the terminal
        #[arg(long)]
        progress: bool,
    },
    /// Search around a point; prints JSON
    Search {
        #[arg(long, allow_hyphen_values = true)]
        lat: f64,

        #[arg(long, allow_hyphen_values = true)]
        lon: f64,

        /// Optional query text; omit for the location/centroid mode
        #[arg(long)]
        text: Option<String>,

        #[arg(long)]
        radius_km: Option<f64>,

        #[arg(long)]
        top_k: Option<usize>,

        #[arg(long)]
        candidates: Option<usize>,

        /// Print only the assembled context text
        #[arg(long)]
        context: bool,
    },
    /// Print collection metrics as JSON
    Stats,
}

#[tokio::main]
async fn main() -> Result<()> {
    // A missing .env is fine; variables may come from the environment.
    let _ = dotenvy::dotenv();

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info,geo_store=info"))
        .context("building log filter")?;
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false).compact())
        .init();

    let cli = Cli::parse();
    let mut cfg = GeoConfig::from_env().context("loading configuration")?;
    if let Some(c) = cli.collection {
        cfg.collection = c;
    }

    match cli.command {
        Command::Ingest {
            source,
            chunk_size,
            no_resume,
            progress,
        } => {
            if let Some(s) = source {
                cfg.source_path = s;
            }
            if let Some(n) = chunk_size {
                cfg.chunk_size = n;
            }
            if no_resume {
                cfg.resume = false;
            }
            ingest(cfg, progress).await
        }
        Command::Search {
            lat,
            lon,
            text,
            radius_km,
            top_k,
            candidates,
            context,
        } => {
            let store = GeoStore::new(cfg)?;
            let mut query = store.query_around(lat, lon);
            if let Some(t) = text {
                query = query.with_text(t);
            }
            if let Some(r) = radius_km {
                query.radius_km = r;
            }
            if let Some(k) = top_k {
                query.top_k = k;
            }
            if let Some(c) = candidates {
                query.candidates = c;
            }

            let result = store.search(&query).await?;
            if context {
                println!("{}", result.context_text());
            } else {
                println!("{}", serde_json::to_string_pretty(&result)?);
            }
            Ok(())
        }
        Command::Stats => {
            let store = GeoStore::new(cfg)?;
            let stats = serde_json::json!({
                "collection": store.config().collection,
                "total_points": store.total_points().await?,
                "unique_locations": store.unique_locations().await?,
                "checkpoint": store.checkpoint()?,
            });
            println!("{}", serde_json::to_string_pretty(&stats)?);
            Ok(())
        }
    }
}

async fn ingest(cfg: GeoConfig, progress: bool) -> Result<()> {
    let source = cfg.source_path.clone();
    let store = GeoStore::new(cfg)?;

    // Ctrl-C stops the run after the chunk in flight.
    let (cancel_tx, cancel_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, stopping after the current chunk");
            let _ = cancel_tx.send(true);
        }
    });

    let spinner = progress.then(IndicatifProgress::spinner);
    let mut ingestor = store.ingestor().with_cancel(cancel_rx);
    if let Some(p) = &spinner {
        ingestor = ingestor.with_progress(p);
    }

    match ingestor.run_file(&source).await {
        Ok(report) => {
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
        Err(GeoError::Cancelled { last_committed }) => {
            info!("stopped; resume will continue after position {last_committed}");
            Ok(())
        }
        Err(e) => Err(e).with_context(|| format!("ingesting {}", source.display())),
    }
}
