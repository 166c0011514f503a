use std::sync::Arc;

use parking_lot::Mutex;

use crate::chunk::Value;
use crate::errors::SinkError;
use crate::sink::{Placeholder, Sink, Transaction};

/// Keeps committed rows in memory.
///
/// Used for dry runs and tests; failures can be scheduled for the next
/// begin, prepare, execute, close or commit calls.
#[derive(Clone)]
pub struct MemorySink {
    columns: usize,
    state: Arc<Mutex<MemoryState>>,
}

#[derive(Default)]
struct MemoryState {
    rows: Vec<Vec<Value>>,
    commits: Vec<usize>,
    prepared: Vec<String>,
    begun: usize,
    fail_begins: usize,
    fail_prepares: usize,
    fail_executions: usize,
    fail_commits: usize,
    fail_closes: usize,
    finished_commits: usize,
}

fn take_one(counter: &mut usize) -> bool {
    if *counter > 0 {
        *counter -= 1;
        true
    } else {
        false
    }
}

impl MemorySink {
    pub fn new(columns: usize) -> Self {
        Self {
            columns: columns.max(1),
            state: Arc::new(Mutex::new(MemoryState::default())),
        }
    }

    /// Committed rows in commit order.
    pub fn rows(&self) -> Vec<Vec<Value>> {
        self.state.lock().rows.clone()
    }

    pub fn row_count(&self) -> usize {
        self.state.lock().rows.len()
    }

    /// Rows carried by each successful commit.
    pub fn commits(&self) -> Vec<usize> {
        self.state.lock().commits.clone()
    }

    /// Every statement text that was prepared.
    pub fn prepared(&self) -> Vec<String> {
        self.state.lock().prepared.clone()
    }

    pub fn transactions_begun(&self) -> usize {
        self.state.lock().begun
    }

    pub fn fail_next_begins(&self, count: usize) {
        self.state.lock().fail_begins += count;
    }

    pub fn fail_next_prepares(&self, count: usize) {
        self.state.lock().fail_prepares += count;
    }

    pub fn fail_next_executions(&self, count: usize) {
        self.state.lock().fail_executions += count;
    }

    pub fn fail_next_commits(&self, count: usize) {
        self.state.lock().fail_commits += count;
    }

    pub fn fail_next_closes(&self, count: usize) {
        self.state.lock().fail_closes += count;
    }

    /// The next commits apply their rows but report the transaction as finished.
    pub fn finish_next_commits(&self, count: usize) {
        self.state.lock().finished_commits += count;
    }
}

impl Sink for MemorySink {
    type Transaction = MemoryTransaction;

    fn placeholder(&self) -> Placeholder {
        Placeholder::Question
    }

    async fn begin(&self) -> Result<MemoryTransaction, SinkError> {
        let mut state = self.state.lock();
        if take_one(&mut state.fail_begins) {
            return Err(SinkError::Rejected {
                reason: "memory sink refused to begin".to_string(),
            });
        }
        state.begun += 1;
        Ok(MemoryTransaction {
            columns: self.columns,
            state: Arc::clone(&self.state),
            pending: Vec::new(),
        })
    }
}

pub struct MemoryTransaction {
    columns: usize,
    state: Arc<Mutex<MemoryState>>,
    pending: Vec<Vec<Value>>,
}

pub struct MemoryStatement {
    parameters: usize,
}

impl Transaction for MemoryTransaction {
    type Statement = MemoryStatement;

    async fn prepare(&mut self, sql: &str) -> Result<MemoryStatement, SinkError> {
        let mut state = self.state.lock();
        if take_one(&mut state.fail_prepares) {
            return Err(SinkError::Rejected {
                reason: "memory sink refused to prepare".to_string(),
            });
        }
        state.prepared.push(sql.to_string());
        Ok(MemoryStatement {
            parameters: sql.matches('?').count(),
        })
    }

    async fn execute(
        &mut self,
        statement: &MemoryStatement,
        values: &[Value],
    ) -> Result<u64, SinkError> {
        if take_one(&mut self.state.lock().fail_executions) {
            return Err(SinkError::Rejected {
                reason: "memory sink refused to execute".to_string(),
            });
        }
        if values.len() != statement.parameters {
            return Err(SinkError::Rejected {
                reason: format!(
                    "statement takes {} parameters, got {}",
                    statement.parameters,
                    values.len()
                ),
            });
        }
        let before = self.pending.len();
        self.pending
            .extend(values.chunks(self.columns).map(|row| row.to_vec()));
        Ok((self.pending.len() - before) as u64)
    }

    async fn close(&mut self, _statement: MemoryStatement) -> Result<(), SinkError> {
        if take_one(&mut self.state.lock().fail_closes) {
            return Err(SinkError::Rejected {
                reason: "memory sink refused to close".to_string(),
            });
        }
        Ok(())
    }

    async fn commit(self) -> Result<(), SinkError> {
        let mut state = self.state.lock();
        if take_one(&mut state.fail_commits) {
            return Err(SinkError::Rejected {
                reason: "memory sink refused to commit".to_string(),
            });
        }
        state.commits.push(self.pending.len());
        state.rows.extend(self.pending);
        if take_one(&mut state.finished_commits) {
            return Err(SinkError::TransactionFinished);
        }
        Ok(())
    }
}
