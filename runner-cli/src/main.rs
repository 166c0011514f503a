use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result, bail};
use clap::Parser;
use ingest_core::config::{IngestConfig, load_config};
use ingest_core::ingestor::{Engine, Ingest, Sinkhole};
use ingest_core::pipe::Pipe;
use ingest_core::rate::RateReporter;
use ingest_core::sink::{MemorySink, PgSink, SqliteSink};
use ingest_core::source::CsvSource;
use ingest_core::telemetry::init_tracing;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "bulk-ingest", about = "Load a delimited file into a relational table")]
struct Args {
    /// YAML config file. Read from INGEST_CONFIG when omitted.
    #[arg(short, long)]
    config: Option<String>,

    /// Count chunks without writing them to the database.
    #[arg(long)]
    sinkhole: bool,
}

/// Runs one load: CSV source -> pipe -> engine, with a rate reporter on
/// stdout, until the file is exhausted or Ctrl-C is pressed.
#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let args = Args::parse();

    let config = load_config(args.config.as_deref())
        .await
        .context("failed to load config")?;
    config.validate().context("invalid config")?;

    let columns = config.engine.columns;
    let source = CsvSource::from_config(&config.source, columns)?;

    if args.sinkhole {
        return run(Arc::new(Sinkhole::new(columns)), source, &config).await;
    }

    let url = config.database.url.as_str();
    let workers = config.engine.worker_count();
    let max_connections = config
        .database
        .max_connections
        .unwrap_or(workers as u32 + 1);

    if url.starts_with("postgres://") || url.starts_with("postgresql://") {
        let sink = PgSink::connect(url, max_connections)
            .await
            .context("failed to connect to PostgreSQL")?;
        run(Arc::new(Engine::new(sink, config.engine.clone())), source, &config).await
    } else if url.starts_with("sqlite:") {
        if workers > 1 {
            warn!(workers, "SQLite serializes writers; one worker is usually faster");
        }
        let sink = SqliteSink::connect(url, max_connections)
            .await
            .context("failed to open SQLite database")?;
        run(Arc::new(Engine::new(sink, config.engine.clone())), source, &config).await
    } else if url.starts_with("memory:") {
        let sink = MemorySink::new(columns);
        run(Arc::new(Engine::new(sink, config.engine.clone())), source, &config).await
    } else {
        bail!("unsupported database url: {}", url)
    }
}

async fn run<I: Ingest>(ingest: Arc<I>, source: CsvSource, config: &IngestConfig) -> Result<()> {
    let started = Instant::now();
    ingest.start()?;

    let reporter = RateReporter::new(Arc::clone(&ingest)).with_interval(config.reporter.interval());
    if config.reporter.enabled {
        reporter.start()?;
    }

    let pipe = Pipe::new(source, Arc::clone(&ingest));
    pipe.start()?;

    let wait = pipe.wait();
    tokio::pin!(wait);
    let forwarded = tokio::select! {
        result = &mut wait => result,
        _ = tokio::signal::ctrl_c() => {
            warn!("interrupt received, finishing queued chunks");
            pipe.stop();
            wait.await
        }
    };

    ingest.stop()?;
    let finished = ingest.wait().await;
    if config.reporter.enabled {
        reporter.stop().await?;
    }

    let summary = serde_json::json!({
        "chunks_forwarded": forwarded.as_ref().ok(),
        "total_rows": ingest.total_rows(),
        "total_chunks": ingest.total_chunks(),
        "elapsed_seconds": started.elapsed().as_secs_f64(),
    });
    info!("ingest summary: {}", summary);

    if let Err(err) = &forwarded {
        error!("source stopped early: {}", err);
    }
    finished.context("ingest failed")?;
    forwarded.context("pipe failed")?;
    Ok(())
}
