use std::sync::Arc;
use std::time::Duration;

use ingest_core::chunk::{Chunk, Completion, Value};
use ingest_core::config::EngineConfig;
use ingest_core::errors::{ChunkError, IngestionError, LifecycleError, Stage};
use ingest_core::ingestor::{Engine, Ingest};
use ingest_core::sink::MemorySink;
use tokio::sync::oneshot;

fn values(count: usize) -> Vec<Value> {
    (0..count as i64).map(Value::from).collect()
}

fn engine(columns: usize, config: EngineConfig) -> (Engine<MemorySink>, MemorySink) {
    let sink = MemorySink::new(columns);
    (Engine::new(sink.clone(), config), sink)
}

async fn submit(
    engine: &Engine<MemorySink>,
    index: u64,
    values: Vec<Value>,
) -> oneshot::Receiver<Completion> {
    let (chunk, ack) = Chunk::new(1, index, values).with_ack();
    engine.add_chunk(chunk).await.unwrap();
    ack
}

#[tokio::test]
async fn writes_one_chunk_in_one_commit() {
    let (engine, sink) = engine(3, EngineConfig::new("events", 3).with_commit_size(5));
    engine.start().unwrap();

    let ack = submit(&engine, 0, values(9)).await;
    engine.stop().unwrap();
    engine.wait().await.unwrap();

    let completion = ack.await.unwrap();
    assert_eq!(completion.result, Ok(()));
    assert_eq!(completion.retry, 0);
    assert_eq!(sink.commits(), vec![3]);
    assert_eq!(sink.row_count(), 3);
    assert_eq!(engine.total_rows(), 3);
    assert_eq!(engine.total_chunks(), 1);
    assert_eq!(
        sink.prepared(),
        vec!["INSERT INTO events VALUES (?,?,?),(?,?,?),(?,?,?)".to_string()]
    );
}

#[tokio::test]
async fn partial_rows_are_rejected_without_retry() {
    let (engine, sink) = engine(2, EngineConfig::new("events", 2));
    engine.start().unwrap();

    let ack = submit(&engine, 0, values(5)).await;
    engine.stop().unwrap();
    engine.wait().await.unwrap();

    let completion = ack.await.unwrap();
    assert_eq!(
        completion.result,
        Err(ChunkError::ColumnMismatch {
            values: 5,
            columns: 2
        })
    );
    assert_eq!(sink.row_count(), 0);
    assert_eq!(engine.total_rows(), 0);

    let metrics = engine.metrics();
    assert_eq!(metrics.rejected_chunks, 1);
    assert_eq!(metrics.retried_chunks, 0);
}

#[tokio::test]
async fn failed_execution_is_retried() {
    let (engine, sink) = engine(1, EngineConfig::new("events", 1));
    sink.fail_next_executions(1);
    engine.start().unwrap();

    let ack = submit(&engine, 0, values(4)).await;
    engine.stop().unwrap();
    engine.wait().await.unwrap();

    let completion = ack.await.unwrap();
    assert!(completion.is_ok());
    assert_eq!(completion.retry, 1);
    assert_eq!(sink.row_count(), 4);
    assert_eq!(engine.metrics().retried_chunks, 1);
    assert_eq!(engine.total_chunks(), 1);
}

#[tokio::test]
async fn failed_prepare_is_retried_after_backoff() {
    let config = EngineConfig::new("events", 2).with_retry_backoff(Duration::from_millis(10));
    let (engine, sink) = engine(2, config);
    sink.fail_next_prepares(1);
    engine.start().unwrap();

    let ack = submit(&engine, 0, values(6)).await;
    engine.stop().unwrap();
    engine.wait().await.unwrap();

    let completion = ack.await.unwrap();
    assert!(completion.is_ok());
    assert_eq!(completion.retry, 1);
    assert_eq!(sink.row_count(), 3);
}

#[tokio::test]
async fn commits_once_window_is_exceeded() {
    let (engine, sink) = engine(1, EngineConfig::new("events", 1).with_commit_size(2));
    engine.start().unwrap();

    let mut acks = Vec::new();
    for index in 0..5 {
        acks.push(submit(&engine, index, values(1)).await);
    }
    engine.stop().unwrap();
    engine.wait().await.unwrap();

    for ack in acks {
        assert!(ack.await.unwrap().is_ok());
    }
    assert_eq!(sink.commits(), vec![3, 2]);
    assert_eq!(engine.metrics().commits, 2);
    assert_eq!(engine.cached_statements(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn many_workers_complete_every_chunk_once() {
    let config = EngineConfig::new("events", 2)
        .with_workers(4)
        .with_commit_size(50);
    let (engine, sink) = engine(2, config);
    sink.fail_next_executions(3);
    let engine = Arc::new(engine);
    engine.start().unwrap();

    let mut acks = Vec::new();
    let mut expected_rows = 0;
    for index in 0..200u64 {
        let rows = (index % 5 + 1) as usize;
        expected_rows += rows as u64;
        acks.push(submit(&engine, index, values(rows * 2)).await);
    }
    engine.stop().unwrap();
    engine.wait().await.unwrap();

    let mut seen = Vec::new();
    for ack in acks {
        let completion = ack.await.unwrap();
        assert!(completion.is_ok(), "{:?}", completion);
        seen.push(completion.index);
    }
    seen.sort_unstable();
    assert_eq!(seen, (0..200).collect::<Vec<_>>());

    assert_eq!(engine.total_rows(), expected_rows);
    assert_eq!(engine.total_chunks(), 200);
    assert_eq!(sink.row_count() as u64, expected_rows);
    assert_eq!(engine.metrics().retried_chunks, 3);
    assert!(engine.cached_statements() <= 5);
    assert!(sink.commits().iter().all(|&rows| rows <= 50 + 5));
}

#[tokio::test]
async fn stream_handle_feeds_the_engine() {
    let (engine, sink) = engine(1, EngineConfig::new("events", 1).with_workers(2));
    engine.start().unwrap();

    let stream = engine.stream().unwrap();
    let producers: Vec<_> = (0..4u64)
        .map(|producer| {
            let stream = stream.clone();
            tokio::spawn(async move {
                for index in 0..25 {
                    let chunk = Chunk::new(producer, index, values(2));
                    stream.send(chunk).await.unwrap();
                }
            })
        })
        .collect();
    for producer in producers {
        producer.await.unwrap();
    }
    engine.stop().unwrap();
    engine.wait().await.unwrap();

    assert!(stream.is_closed());
    assert_eq!(sink.row_count(), 200);
    assert_eq!(engine.total_chunks(), 100);
}

#[tokio::test]
async fn lifecycle_misuse_is_reported() {
    let (engine, _sink) = engine(1, EngineConfig::new("events", 1));
    assert!(matches!(
        engine.stop(),
        Err(IngestionError::Lifecycle(LifecycleError::NotStarted))
    ));
    assert!(matches!(
        engine.stream(),
        Err(IngestionError::Lifecycle(LifecycleError::NotStarted))
    ));
    assert!(engine.wait().await.is_err());

    engine.start().unwrap();
    assert!(matches!(
        engine.start(),
        Err(IngestionError::Lifecycle(LifecycleError::AlreadyStarted))
    ));
    engine.stop().unwrap();
    engine.stop().unwrap();

    let (chunk, ack) = Chunk::new(1, 0, values(1)).with_ack();
    assert!(matches!(
        engine.add_chunk(chunk).await,
        Err(IngestionError::Lifecycle(LifecycleError::Stopped))
    ));
    assert!(matches!(
        ack.await.unwrap().result,
        Err(ChunkError::Aborted { .. })
    ));
    engine.wait().await.unwrap();
}

#[test]
fn start_needs_a_runtime() {
    let (engine, _sink) = engine(1, EngineConfig::new("events", 1));
    assert!(matches!(
        engine.start(),
        Err(IngestionError::Lifecycle(LifecycleError::NoRuntime))
    ));
}

#[tokio::test]
async fn non_positive_worker_count_runs_one_writer() {
    let (engine, sink) = engine(1, EngineConfig::new("events", 1).with_workers(-3));
    assert_eq!(engine.workers(), 1);
    engine.start().unwrap();
    let ack = submit(&engine, 0, values(1)).await;
    engine.stop().unwrap();
    engine.wait().await.unwrap();

    assert!(ack.await.unwrap().is_ok());
    assert_eq!(sink.transactions_begun(), 1);
}

#[tokio::test]
async fn failed_commit_stops_the_engine() {
    let (engine, sink) = engine(1, EngineConfig::new("events", 1).with_commit_size(0));
    sink.fail_next_commits(1);
    engine.start().unwrap();

    let mut acks = Vec::new();
    for index in 0..10 {
        let (chunk, ack) = Chunk::new(1, index, values(1)).with_ack();
        // Later chunks may be refused once the writer has failed.
        let _ = engine.add_chunk(chunk).await;
        acks.push(ack);
    }
    engine.stop().unwrap();

    let err = engine.wait().await.unwrap_err();
    assert!(err.is_fatal());
    assert!(matches!(
        err,
        IngestionError::Fatal {
            stage: Stage::Commit,
            ..
        }
    ));

    for ack in acks {
        let completion = ack.await.unwrap();
        assert!(matches!(completion.result, Err(ChunkError::Aborted { .. })));
    }
    assert_eq!(sink.row_count(), 0);
}

#[tokio::test]
async fn failed_begin_stops_the_engine() {
    let (engine, sink) = engine(1, EngineConfig::new("events", 1));
    sink.fail_next_begins(1);
    engine.start().unwrap();

    let (chunk, ack) = Chunk::new(1, 0, values(1)).with_ack();
    let _ = engine.add_chunk(chunk).await;
    engine.stop().unwrap();

    assert!(matches!(
        engine.wait().await,
        Err(IngestionError::Fatal {
            stage: Stage::Begin,
            ..
        })
    ));
    assert!(!ack.await.unwrap().is_ok());
}

#[tokio::test]
async fn finished_transaction_on_commit_is_tolerated() {
    let (engine, sink) = engine(1, EngineConfig::new("events", 1).with_commit_size(1));
    sink.finish_next_commits(1);
    engine.start().unwrap();

    let mut acks = Vec::new();
    for index in 0..4 {
        acks.push(submit(&engine, index, values(1)).await);
    }
    engine.stop().unwrap();
    engine.wait().await.unwrap();

    for ack in acks {
        assert!(ack.await.unwrap().is_ok());
    }
    assert_eq!(sink.row_count(), 4);
}

#[tokio::test]
async fn retried_chunk_is_written_before_newer_input() {
    let (engine, sink) = engine(1, EngineConfig::new("events", 1));
    sink.fail_next_executions(1);
    engine.start().unwrap();

    let mut acks = Vec::new();
    for index in 0..4 {
        acks.push(submit(&engine, index, vec![Value::Int(index as i64)]).await);
    }
    engine.stop().unwrap();
    engine.wait().await.unwrap();

    for ack in acks {
        assert!(ack.await.unwrap().is_ok());
    }
    assert_eq!(
        sink.rows(),
        (0..4).map(|id| vec![Value::Int(id)]).collect::<Vec<_>>()
    );
}

#[tokio::test]
async fn failed_statement_close_on_commit_stops_the_engine() {
    let (engine, sink) = engine(1, EngineConfig::new("events", 1).with_commit_size(0));
    sink.fail_next_closes(1);
    engine.start().unwrap();

    let mut acks = Vec::new();
    for index in 0..6 {
        let (chunk, ack) = Chunk::new(1, index, values(1)).with_ack();
        let _ = engine.add_chunk(chunk).await;
        acks.push(ack);
    }
    engine.stop().unwrap();

    assert!(matches!(
        engine.wait().await,
        Err(IngestionError::Fatal {
            stage: Stage::CloseStatement,
            ..
        })
    ));
    for ack in acks {
        let completion = ack.await.unwrap();
        assert!(matches!(completion.result, Err(ChunkError::Aborted { .. })));
    }
    assert_eq!(sink.row_count(), 0);
}

#[tokio::test]
async fn failed_statement_close_on_new_row_count_completes_every_chunk() {
    let (engine, sink) = engine(1, EngineConfig::new("events", 1).with_commit_size(1000));
    sink.fail_next_closes(1);
    engine.start().unwrap();

    let mut acks = Vec::new();
    for (index, rows) in [1usize, 2, 2, 3].into_iter().enumerate() {
        let (chunk, ack) = Chunk::new(1, index as u64, values(rows)).with_ack();
        let _ = engine.add_chunk(chunk).await;
        acks.push(ack);
    }
    engine.stop().unwrap();

    assert!(matches!(
        engine.wait().await,
        Err(IngestionError::Fatal {
            stage: Stage::CloseStatement,
            ..
        })
    ));
    for ack in acks {
        let completion = ack.await.unwrap();
        assert!(matches!(completion.result, Err(ChunkError::Aborted { .. })));
    }
    assert_eq!(sink.row_count(), 0);
}

#[tokio::test]
async fn unsafe_table_name_is_refused_at_start() {
    let (engine, sink) = engine(1, EngineConfig::new("events; DROP TABLE users", 1));
    assert!(matches!(engine.start(), Err(IngestionError::Config(_))));
    assert!(sink.prepared().is_empty());
    assert!(matches!(
        engine.stream(),
        Err(IngestionError::Lifecycle(LifecycleError::NotStarted))
    ));
}
