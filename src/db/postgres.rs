use std::time::Duration;

use async_trait::async_trait;
use log::debug;
use sqlx::pool::PoolConnection;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{Postgres, QueryBuilder};

use crate::config::PgConfig;
use crate::dataset::{Column, ColumnType, Dataset, Value};
use crate::error::IngestError;

use super::sql;
use super::store::{Connector, Store};
use super::table::{PartitionRange, TableDescriptor};

/// PostgreSQL caps the number of bind parameters of one statement.
const MAX_BIND_PARAMS: usize = 65_535;

/// Turn a sqlx error into the pipeline's error taxonomy, using the SQLSTATE
/// code for errors reported by the server.
pub fn classify(e: sqlx::Error, table: &str) -> IngestError {
    match e {
        sqlx::Error::Database(db) => {
            let message = db.message().to_string();
            match db.code().as_deref() {
                Some("42P07") => IngestError::DuplicateTable(table.to_string()),
                Some("42P01") => IngestError::MissingTable(table.to_string()),
                Some("42601") | Some("42703") | Some("42804") | Some("22P02") => {
                    IngestError::schema_mismatch(table, message)
                }
                Some(code) if code.starts_with("428") => IngestError::schema_mismatch(table, message),
                Some("23514") => IngestError::NoPartitionForRow {
                    table: table.to_string(),
                    key: "partition key".to_string(),
                    value: message,
                },
                // connection exception, admin shutdown, crash shutdown
                Some(code) if code.starts_with("08") || code == "57P01" || code == "57P02" => {
                    IngestError::TransientConnection(message)
                }
                _ => IngestError::Database(message),
            }
        }
        sqlx::Error::Io(e) => IngestError::TransientConnection(e.to_string()),
        e @ (sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed
        | sqlx::Error::Tls(_)
        | sqlx::Error::Protocol(_)) => IngestError::TransientConnection(e.to_string()),
        sqlx::Error::Configuration(e) => IngestError::Config(e.to_string()),
        e => IngestError::Database(e.to_string()),
    }
}

#[derive(Debug, Clone)]
pub struct PgConnector {
    pool: PgPool,
}

impl PgConnector {
    /// Nothing is opened until the first `connect`.
    pub fn new(config: &PgConfig) -> PgConnector {
        let pool = PgPoolOptions::new()
            .max_connections(1)
            .acquire_timeout(Duration::from_secs(30))
            .connect_lazy_with(config.connect_options());
        PgConnector { pool }
    }
}

#[async_trait]
impl Connector for PgConnector {
    type Conn = PgStore;

    async fn connect(&self) -> Result<PgStore, IngestError> {
        let conn = self
            .pool
            .acquire()
            .await
            .map_err(|e| classify(e, "<connection>"))?;
        Ok(PgStore {
            conn,
            in_transaction: false,
        })
    }
}

pub struct PgStore {
    conn: PoolConnection<Postgres>,
    in_transaction: bool,
}

impl Drop for PgStore {
    fn drop(&mut self) {
        // don't hand a connection stuck in a transaction back to the pool,
        // closing it makes the server roll back
        if self.in_transaction {
            self.conn.close_on_drop();
        }
    }
}

impl PgStore {
    async fn execute(&mut self, statement: &str, table: &str) -> Result<u64, IngestError> {
        debug!("{}", statement);
        let res = sqlx::query(statement)
            .execute(&mut *self.conn)
            .await
            .map_err(|e| classify(e, table))?;
        Ok(res.rows_affected())
    }
}

#[async_trait]
impl Store for PgStore {
    async fn replace_table(&mut self, table: &TableDescriptor) -> Result<(), IngestError> {
        self.execute(&sql::drop_table_if_exists(&table.name), &table.name).await?;
        self.execute(&sql::create_table(table), &table.name).await?;
        Ok(())
    }

    async fn append_rows(&mut self, table: &str, ds: &Dataset) -> Result<u64, IngestError> {
        let columns = ds.columns();
        if columns.is_empty() || ds.is_empty() {
            return Ok(0);
        }
        let batch = (MAX_BIND_PARAMS / columns.len()).max(1);
        let mut count = 0;
        for rows in ds.rows().chunks(batch) {
            let mut qb: QueryBuilder<Postgres> = QueryBuilder::new(sql::insert_into(table, columns));
            qb.push_values(rows, |mut b, row| {
                for (value, column) in row.iter().zip(columns) {
                    match (value, column.ty) {
                        (Value::Null, ColumnType::BigInt) => b.push_bind(None::<i64>),
                        (Value::Null, ColumnType::Double) => b.push_bind(None::<f64>),
                        (Value::Null, ColumnType::Text) => b.push_bind(None::<String>),
                        (Value::Null, ColumnType::Timestamp) => {
                            b.push_bind(None::<chrono::NaiveDateTime>)
                        }
                        (Value::BigInt(v), _) => b.push_bind(*v),
                        (Value::Double(v), _) => b.push_bind(*v),
                        (Value::Text(v), _) => b.push_bind(v.clone()),
                        (Value::Timestamp(v), _) => b.push_bind(*v),
                    };
                }
            });
            let res = qb
                .build()
                .execute(&mut *self.conn)
                .await
                .map_err(|e| classify(e, table))?;
            count += res.rows_affected();
        }
        Ok(count)
    }

    async fn create_partitioned_table(
        &mut self,
        table: &TableDescriptor,
        key: &str,
    ) -> Result<(), IngestError> {
        self.execute(&sql::create_partitioned_table(table, key), &table.name).await?;
        Ok(())
    }

    async fn create_range_partition(
        &mut self,
        child: &str,
        parent: &str,
        range: &PartitionRange,
    ) -> Result<(), IngestError> {
        let statement = sql::create_range_partition(child, parent, range);
        match self.execute(&statement, child).await {
            // the child can't be missing, only the parent
            Err(IngestError::MissingTable(_)) => Err(IngestError::MissingTable(parent.to_string())),
            res => res.map(|_| ()),
        }
    }

    async fn insert_select_all(&mut self, target: &str, source: &str) -> Result<u64, IngestError> {
        let statement = sql::insert_select_all(target, source);
        match self.execute(&statement, target).await {
            // the target was declared just before, a missing relation is the source
            Err(IngestError::MissingTable(_)) => Err(IngestError::MissingTable(source.to_string())),
            res => res,
        }
    }

    async fn table_exists(&mut self, name: &str) -> Result<bool, IngestError> {
        sqlx::query_scalar::<_, bool>(sql::TABLE_EXISTS)
            .bind(name)
            .fetch_one(&mut *self.conn)
            .await
            .map_err(|e| classify(e, name))
    }

    async fn table_columns(&mut self, name: &str) -> Result<Vec<Column>, IngestError> {
        let rows = sqlx::query_as::<_, (String, String)>(sql::TABLE_COLUMNS)
            .bind(name)
            .fetch_all(&mut *self.conn)
            .await
            .map_err(|e| classify(e, name))?;
        if rows.is_empty() {
            return Err(IngestError::MissingTable(name.to_string()));
        }
        rows.into_iter()
            .map(|(column, data_type)| match ColumnType::from_information_schema(&data_type) {
                Some(ty) => Ok(Column { name: column, ty }),
                None => Err(IngestError::schema_mismatch(
                    name,
                    format!("column {} has unsupported type {}", column, data_type),
                )),
            })
            .collect()
    }

    async fn row_count(&mut self, name: &str) -> Result<u64, IngestError> {
        let n = sqlx::query_scalar::<_, i64>(&sql::count_rows(name))
            .fetch_one(&mut *self.conn)
            .await
            .map_err(|e| classify(e, name))?;
        Ok(n as u64)
    }

    async fn begin(&mut self) -> Result<(), IngestError> {
        self.execute("BEGIN", "<transaction>").await?;
        self.in_transaction = true;
        Ok(())
    }

    async fn commit(&mut self) -> Result<(), IngestError> {
        self.execute("COMMIT", "<transaction>").await?;
        self.in_transaction = false;
        Ok(())
    }

    async fn rollback(&mut self) -> Result<(), IngestError> {
        self.execute("ROLLBACK", "<transaction>").await?;
        self.in_transaction = false;
        Ok(())
    }
}
