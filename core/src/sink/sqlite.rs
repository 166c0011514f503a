use sqlx::query::Query;
use sqlx::sqlite::{SqliteArguments, SqlitePool, SqlitePoolOptions, SqliteStatement};
use sqlx::{Executor, Sqlite, Statement as _};
use tracing::info;

use crate::chunk::Value;
use crate::errors::SinkError;
use crate::sink::{Placeholder, Sink, Transaction};

/// SQLite sink backed by a connection pool.
///
/// SQLite allows a single writer; configure one worker per database file.
#[derive(Clone)]
pub struct SqliteSink {
    pool: SqlitePool,
}

impl SqliteSink {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn connect(url: &str, max_connections: u32) -> Result<Self, SinkError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await?;
        info!("Opened SQLite database {}", url);
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

impl Sink for SqliteSink {
    type Transaction = SqliteTransaction;

    fn placeholder(&self) -> Placeholder {
        Placeholder::Question
    }

    async fn begin(&self) -> Result<SqliteTransaction, SinkError> {
        let tx = self.pool.begin().await?;
        Ok(SqliteTransaction { tx })
    }
}

pub struct SqliteTransaction {
    tx: sqlx::Transaction<'static, Sqlite>,
}

impl Transaction for SqliteTransaction {
    type Statement = SqliteStatement<'static>;

    async fn prepare(&mut self, sql: &str) -> Result<SqliteStatement<'static>, SinkError> {
        let statement = (&mut *self.tx).prepare(sql).await?;
        Ok(sqlx::Statement::to_owned(&statement))
    }

    async fn execute(
        &mut self,
        statement: &SqliteStatement<'static>,
        values: &[Value],
    ) -> Result<u64, SinkError> {
        let mut query = statement.query();
        for value in values {
            query = bind_value(query, value);
        }
        let done = query.execute(&mut *self.tx).await?;
        Ok(done.rows_affected())
    }

    async fn close(&mut self, _statement: SqliteStatement<'static>) -> Result<(), SinkError> {
        Ok(())
    }

    async fn commit(self) -> Result<(), SinkError> {
        self.tx.commit().await?;
        Ok(())
    }
}

fn bind_value<'q>(
    query: Query<'q, Sqlite, SqliteArguments<'q>>,
    value: &'q Value,
) -> Query<'q, Sqlite, SqliteArguments<'q>> {
    match value {
        Value::Null => query.bind(None::<String>),
        Value::Bool(v) => query.bind(*v),
        Value::Int(v) => query.bind(*v),
        Value::Float(v) => query.bind(*v),
        Value::Text(v) => query.bind(v.as_str()),
        Value::Bytes(v) => query.bind(v.as_slice()),
    }
}
