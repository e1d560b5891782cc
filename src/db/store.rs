use async_trait::async_trait;

use crate::dataset::{Column, Dataset};
use crate::error::IngestError;

use super::table::{PartitionRange, TableDescriptor};

/// The operations the pipeline needs from a relational store.  One value of
/// this trait is one open connection, released when dropped.
#[async_trait]
pub trait Store: Send {
    /// Drop the table if it exists and create it empty with the given columns.
    async fn replace_table(&mut self, table: &TableDescriptor) -> Result<(), IngestError>;

    /// Append all the rows of the dataset, return the number of rows written.
    async fn append_rows(&mut self, table: &str, ds: &Dataset) -> Result<u64, IngestError>;

    async fn create_partitioned_table(
        &mut self,
        table: &TableDescriptor,
        key: &str,
    ) -> Result<(), IngestError>;

    async fn create_range_partition(
        &mut self,
        child: &str,
        parent: &str,
        range: &PartitionRange,
    ) -> Result<(), IngestError>;

    /// `INSERT INTO target SELECT * FROM source`, return the number of rows
    /// inserted.
    async fn insert_select_all(&mut self, target: &str, source: &str) -> Result<u64, IngestError>;

    async fn table_exists(&mut self, name: &str) -> Result<bool, IngestError>;

    /// Columns of an existing table, in declaration order.
    async fn table_columns(&mut self, name: &str) -> Result<Vec<Column>, IngestError>;

    async fn row_count(&mut self, name: &str) -> Result<u64, IngestError>;

    async fn begin(&mut self) -> Result<(), IngestError>;

    async fn commit(&mut self) -> Result<(), IngestError>;

    async fn rollback(&mut self) -> Result<(), IngestError>;
}

/// Hands out connections.  Each database operation of the pipeline acquires
/// its own connection and lets it go when done.
#[async_trait]
pub trait Connector: Send + Sync {
    type Conn: Store;

    async fn connect(&self) -> Result<Self::Conn, IngestError>;
}
