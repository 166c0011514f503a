use std::sync::{Arc, OnceLock};

use dashmap::DashMap;

use crate::sink::Placeholder;

/// Multi-row insert texts keyed by row count.
///
/// Writers populate the map without coordinating. Two writers meeting an
/// unseen row count may both build and store its text; the texts are equal.
pub struct StatementCache {
    table: String,
    columns: usize,
    placeholder: Placeholder,
    row_group: OnceLock<String>,
    batches: DashMap<usize, Arc<str>>,
}

impl StatementCache {
    pub fn new(table: impl Into<String>, columns: usize, placeholder: Placeholder) -> Self {
        Self {
            table: table.into(),
            columns,
            placeholder,
            row_group: OnceLock::new(),
            batches: DashMap::new(),
        }
    }

    /// Insert text for exactly `rows` rows, built on first use.
    pub fn get(&self, rows: usize) -> Arc<str> {
        if let Some(sql) = self.batches.get(&rows).map(|entry| Arc::clone(entry.value())) {
            return sql;
        }
        let sql: Arc<str> = self.build(rows).into();
        self.batches.insert(rows, Arc::clone(&sql));
        sql
    }

    /// Number of distinct shapes cached so far.
    pub fn len(&self) -> usize {
        self.batches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.batches.is_empty()
    }

    /// `(?,?,?)` for one row.
    fn row_group(&self) -> &str {
        self.row_group.get_or_init(|| {
            let mut group = String::with_capacity(self.columns * 2 + 1);
            group.push('(');
            for column in 0..self.columns {
                if column > 0 {
                    group.push(',');
                }
                group.push('?');
            }
            group.push(')');
            group
        })
    }

    fn build(&self, rows: usize) -> String {
        let prefix = format!("INSERT INTO {} VALUES ", self.table);
        match self.placeholder {
            Placeholder::Question => {
                let group = self.row_group();
                let mut sql = String::with_capacity(prefix.len() + rows * (group.len() + 1));
                sql.push_str(&prefix);
                for row in 0..rows {
                    if row > 0 {
                        sql.push(',');
                    }
                    sql.push_str(group);
                }
                sql
            }
            Placeholder::Numbered => {
                let mut sql = prefix;
                let mut parameter = 1;
                for row in 0..rows {
                    if row > 0 {
                        sql.push(',');
                    }
                    sql.push('(');
                    for column in 0..self.columns {
                        if column > 0 {
                            sql.push(',');
                        }
                        sql.push('$');
                        sql.push_str(&parameter.to_string());
                        parameter += 1;
                    }
                    sql.push(')');
                }
                sql
            }
        }
    }
}
