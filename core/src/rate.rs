use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::errors::{IngestionError, LifecycleError, Result};
use crate::ingestor::Ingest;

type Output = Box<dyn Write + Send>;

const UNITS: [&str; 5] = ["", "Thousand", "Million", "Billion", "Trillion"];

/// Human-readable quantity: `2_150_000.0` becomes `"2.15 Million"`.
pub fn format_quantity(quantity: f64) -> String {
    let mut value = quantity;
    let mut unit = 0;
    while value > 1000.0 && unit < UNITS.len() - 1 {
        value /= 1000.0;
        unit += 1;
    }

    let mut text = format!("{:.5}", value);
    if text.contains('.') {
        let trimmed = text.trim_end_matches('0').trim_end_matches('.').len();
        text.truncate(trimmed);
    }
    if unit == 0 {
        text
    } else {
        format!("{} {}", text, UNITS[unit])
    }
}

struct Running {
    cancel: CancellationToken,
    task: JoinHandle<Output>,
}

/// Periodically prints how fast an ingest is writing.
pub struct RateReporter<I: Ingest> {
    ingest: Arc<I>,
    interval: Duration,
    out: Mutex<Option<Output>>,
    running: Mutex<Option<Running>>,
}

impl<I: Ingest> RateReporter<I> {
    pub fn new(ingest: Arc<I>) -> Self {
        Self {
            ingest,
            interval: Duration::from_secs(1),
            out: Mutex::new(Some(Box::new(std::io::stdout()))),
            running: Mutex::new(None),
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_writer<W: Write + Send + 'static>(self, writer: W) -> Self {
        *self.out.lock() = Some(Box::new(writer));
        self
    }

    pub fn start(&self) -> Result<()> {
        let runtime = Handle::try_current().map_err(|_| LifecycleError::NoRuntime)?;
        let mut running = self.running.lock();
        if running.is_some() {
            return Err(LifecycleError::AlreadyStarted.into());
        }
        let out = self
            .out
            .lock()
            .take()
            .ok_or(LifecycleError::AlreadyStarted)?;

        let cancel = CancellationToken::new();
        let task = runtime.spawn(report(
            Arc::clone(&self.ingest),
            self.interval,
            out,
            cancel.clone(),
        ));
        *running = Some(Running { cancel, task });
        Ok(())
    }

    /// Stops reporting. The reporter can be started again afterwards.
    pub async fn stop(&self) -> Result<()> {
        let Running { cancel, task } = self
            .running
            .lock()
            .take()
            .ok_or(LifecycleError::NotStarted)?;
        cancel.cancel();
        let out = task.await.map_err(|err| {
            IngestionError::Generic(anyhow::anyhow!("rate reporter failed: {}", err))
        })?;
        *self.out.lock() = Some(out);
        Ok(())
    }
}

async fn report<I: Ingest>(
    ingest: Arc<I>,
    period: Duration,
    mut out: Output,
    cancel: CancellationToken,
) -> Output {
    let started = Instant::now();
    let mut last_time = started;
    let mut last_rows = 0;
    let mut last_chunks = 0;

    let mut ticker = tokio::time::interval_at(started + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let rows = ingest.total_rows();
        let chunks = ingest.total_chunks();
        let now = Instant::now();
        let seconds = now.duration_since(last_time).as_secs_f64();
        let per_second = |delta: u64| {
            if seconds > 0.0 {
                delta as f64 / seconds
            } else {
                0.0
            }
        };

        let line = writeln!(
            out,
            "Total Row : {} \t Row/s : {}\t Chunk/s {} \tTime Elapsed : {:?}",
            rows,
            format_quantity(per_second(rows.saturating_sub(last_rows))),
            format_quantity(per_second(chunks.saturating_sub(last_chunks))),
            now.duration_since(started)
        );
        if let Err(err) = line.and_then(|_| out.flush()) {
            warn!("failed to write rate report: {}", err);
        }

        last_rows = rows;
        last_chunks = chunks;
        last_time = now;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::{Chunk, Value};
    use crate::ingestor::Sinkhole;

    #[derive(Clone, Default)]
    struct Captured(Arc<Mutex<Vec<u8>>>);

    impl Write for Captured {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn quantities_use_named_units() {
        let cases = [
            (1.0, "1"),
            (2000.0, "2 Thousand"),
            (2_000_000.0, "2 Million"),
            (2_100_000.0, "2.1 Million"),
            (2_150_000.0, "2.15 Million"),
            (2_155_000.0, "2.155 Million"),
            (2_155_600.0, "2.1556 Million"),
            (21_556_000.0, "21.556 Million"),
            (215_566_000.0, "215.566 Million"),
        ];
        for (quantity, expected) in cases {
            assert_eq!(format_quantity(quantity), expected, "{}", quantity);
        }
    }

    #[test]
    fn quantities_stop_at_the_largest_unit() {
        assert_eq!(format_quantity(0.0), "0");
        assert_eq!(format_quantity(1000.0), "1000");
        assert_eq!(format_quantity(5e15), "5000 Trillion");
    }

    #[tokio::test(start_paused = true)]
    async fn prints_one_line_per_tick() {
        let sinkhole = Arc::new(Sinkhole::new(2));
        let captured = Captured::default();
        let reporter = RateReporter::new(Arc::clone(&sinkhole))
            .with_interval(Duration::from_secs(1))
            .with_writer(captured.clone());

        sinkhole.start().unwrap();
        reporter.start().unwrap();
        sinkhole
            .add_chunk(Chunk::new(0, 0, (0..4).map(Value::from).collect()))
            .await
            .unwrap();
        sinkhole.stop().unwrap();
        sinkhole.wait().await.unwrap();

        tokio::time::sleep(Duration::from_millis(1500)).await;
        reporter.stop().await.unwrap();

        let text = String::from_utf8(captured.0.lock().clone()).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 1);
        assert!(lines[0].starts_with("Total Row : 2 \t Row/s : 2\t Chunk/s 1 \tTime Elapsed : "));
    }

    #[tokio::test]
    async fn lifecycle_is_checked() {
        let reporter = RateReporter::new(Arc::new(Sinkhole::new(1))).with_writer(Captured::default());
        assert!(reporter.stop().await.is_err());
        reporter.start().unwrap();
        assert!(reporter.start().is_err());
        reporter.stop().await.unwrap();
        reporter.start().unwrap();
        reporter.stop().await.unwrap();
    }
}
