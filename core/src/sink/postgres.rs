use std::borrow::Cow;
use std::time::Duration;

use sqlx::postgres::{PgArguments, PgPool, PgPoolOptions, PgStatement};
use sqlx::query::Query;
use sqlx::{Either, Executor, Postgres, Statement as _, TypeInfo};
use tracing::info;

use crate::chunk::Value;
use crate::errors::SinkError;
use crate::sink::{Placeholder, Sink, Transaction};

const SAVEPOINT: &str = "SAVEPOINT ingest_chunk";
const RELEASE: &str = "RELEASE SAVEPOINT ingest_chunk";
const ROLLBACK_TO: &str = "ROLLBACK TO SAVEPOINT ingest_chunk";

/// PostgreSQL sink backed by a connection pool.
///
/// Every value is sent as text and cast by the server to the type of the
/// column it lands in, so a CSV field `"42"` loads into an `integer` column.
#[derive(Clone)]
pub struct PgSink {
    pool: PgPool,
}

impl PgSink {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(url: &str, max_connections: u32) -> Result<Self, SinkError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(30))
            .connect(url)
            .await?;
        info!("Connected to PostgreSQL with up to {} connections", max_connections);
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

impl Sink for PgSink {
    type Transaction = PgTransaction;

    fn placeholder(&self) -> Placeholder {
        Placeholder::Numbered
    }

    async fn begin(&self) -> Result<PgTransaction, SinkError> {
        let tx = self.pool.begin().await?;
        Ok(PgTransaction { tx })
    }
}

pub struct PgTransaction {
    tx: sqlx::Transaction<'static, Postgres>,
}

impl Transaction for PgTransaction {
    type Statement = PgStatement<'static>;

    async fn prepare(&mut self, sql: &str) -> Result<PgStatement<'static>, SinkError> {
        // The server infers each parameter's type from its target column.
        let described = (&mut *self.tx).prepare(sql).await?;
        let types: Vec<String> = match described.parameters() {
            Some(Either::Left(types)) => types.iter().map(|ty| ty.name().to_string()).collect(),
            _ => Vec::new(),
        };

        let coerced = cast_parameters(sql, &types);
        let statement = (&mut *self.tx).prepare(&coerced).await?;
        Ok(sqlx::Statement::to_owned(&statement))
    }

    // A failed statement aborts the whole transaction in PostgreSQL; the
    // savepoint keeps rows executed earlier in it committable.
    async fn execute(
        &mut self,
        statement: &PgStatement<'static>,
        values: &[Value],
    ) -> Result<u64, SinkError> {
        (&mut *self.tx).execute(SAVEPOINT).await?;

        let mut query = statement.query();
        for value in values {
            query = bind_value(query, value);
        }

        match query.execute(&mut *self.tx).await {
            Ok(done) => {
                (&mut *self.tx).execute(RELEASE).await?;
                Ok(done.rows_affected())
            }
            Err(err) => {
                (&mut *self.tx).execute(ROLLBACK_TO).await?;
                Err(err.into())
            }
        }
    }

    // Prepared statements live in the connection's statement cache.
    async fn close(&mut self, _statement: PgStatement<'static>) -> Result<(), SinkError> {
        Ok(())
    }

    async fn commit(self) -> Result<(), SinkError> {
        self.tx.commit().await?;
        Ok(())
    }
}

/// Rewrites every `$n` as `$n::text::<type>` so the parameter is declared
/// text and converted to the column type on the server.
fn cast_parameters(sql: &str, types: &[String]) -> String {
    let mut out = String::with_capacity(sql.len() + types.len() * 16);
    let mut chars = sql.chars().peekable();
    while let Some(c) = chars.next() {
        out.push(c);
        if c != '$' {
            continue;
        }
        let mut number = 0usize;
        let mut digits = 0;
        while let Some(digit) = chars.next_if(char::is_ascii_digit) {
            out.push(digit);
            number = number * 10 + (digit as usize - '0' as usize);
            digits += 1;
        }
        if digits == 0 {
            continue;
        }
        if let Some(ty) = number.checked_sub(1).and_then(|i| types.get(i)) {
            out.push_str("::text::");
            out.push_str(ty);
        }
    }
    out
}

fn bind_value<'q>(
    query: Query<'q, Postgres, PgArguments>,
    value: &'q Value,
) -> Query<'q, Postgres, PgArguments> {
    match value.to_text() {
        None => query.bind(None::<&str>),
        Some(Cow::Borrowed(text)) => query.bind(text),
        Some(Cow::Owned(text)) => query.bind(text),
    }
}
