use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

pub fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "ingest_core=info,runner_cli=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

#[derive(Debug, Clone, Serialize)]
pub struct IngestMetrics {
    pub total_rows: u64,
    pub total_chunks: u64,
    pub retried_chunks: u64,
    pub rejected_chunks: u64,
    pub commits: u64,
    pub taken_at: DateTime<Utc>,
}

/// Process-wide counters shared by every writer.
#[derive(Debug, Default)]
pub struct Counters {
    rows: AtomicU64,
    chunks: AtomicU64,
    retried: AtomicU64,
    rejected: AtomicU64,
    commits: AtomicU64,
}

impl Counters {
    pub fn record_written(&self, rows: usize) {
        self.rows.fetch_add(rows as u64, Ordering::Relaxed);
        self.chunks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_retry(&self) {
        self.retried.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rejected(&self) {
        self.rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_commit(&self) {
        self.commits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn total_rows(&self) -> u64 {
        self.rows.load(Ordering::Relaxed)
    }

    pub fn total_chunks(&self) -> u64 {
        self.chunks.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> IngestMetrics {
        IngestMetrics {
            total_rows: self.total_rows(),
            total_chunks: self.total_chunks(),
            retried_chunks: self.retried.load(Ordering::Relaxed),
            rejected_chunks: self.rejected.load(Ordering::Relaxed),
            commits: self.commits.load(Ordering::Relaxed),
            taken_at: Utc::now(),
        }
    }
}
