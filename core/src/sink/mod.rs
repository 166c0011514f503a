pub mod memory;
pub mod postgres;
pub mod sqlite;

use std::future::Future;

use crate::chunk::Value;
use crate::errors::SinkError;

pub use memory::MemorySink;
pub use postgres::PgSink;
pub use sqlite::SqliteSink;

/// Parameter marker syntax of the destination database.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placeholder {
    /// `?` for every parameter.
    Question,
    /// `$1`, `$2`, … numbered across the whole statement.
    Numbered,
}

/// The `Sink` trait defines the contract for any destination system.
///
/// A sink is shared by every writer and must allow several transactions to
/// be open at once; each writer begins and owns its own.
pub trait Sink: Send + Sync + 'static {
    type Transaction: Transaction;

    fn placeholder(&self) -> Placeholder;

    fn begin(&self) -> impl Future<Output = Result<Self::Transaction, SinkError>> + Send;
}

/// One open transaction. Dropping it without `commit` rolls it back.
pub trait Transaction: Send + 'static {
    type Statement: Send + Sync + 'static;

    fn prepare(
        &mut self,
        sql: &str,
    ) -> impl Future<Output = Result<Self::Statement, SinkError>> + Send;

    /// Executes a prepared statement with `values` as positional parameters.
    fn execute(
        &mut self,
        statement: &Self::Statement,
        values: &[Value],
    ) -> impl Future<Output = Result<u64, SinkError>> + Send;

    fn close(
        &mut self,
        statement: Self::Statement,
    ) -> impl Future<Output = Result<(), SinkError>> + Send;

    fn commit(self) -> impl Future<Output = Result<(), SinkError>> + Send;
}
