use log::info;
use serde::Serialize;

use crate::dataset::Dataset;
use crate::error::IngestError;
use crate::utils::retry::RetryPolicy;

use super::store::{Connector, Store};
use super::table::TableDescriptor;

#[derive(Debug, Serialize, PartialEq, Eq, Clone)]
pub struct LoadReport {
    pub table: String,
    pub rows: u64,
}

#[derive(Debug, Clone)]
pub struct Loader {
    pub retry: RetryPolicy,
    /// Name of the row number column, `None` to write the dataset as is
    pub index_label: Option<String>,
}

impl Loader {
    pub fn new(retry: RetryPolicy, index_label: Option<String>) -> Loader {
        Loader { retry, index_label }
    }

    /// Replace the table with an empty one shaped like the dataset, then
    /// append all the rows.  Any data already in the table is lost.
    ///
    /// Both steps are retried together, which is safe because the first one
    /// always starts over.
    pub async fn load<C: Connector>(
        &self,
        connector: &C,
        table: &str,
        ds: &Dataset,
    ) -> Result<LoadReport, IngestError> {
        let frame = match &self.index_label {
            Some(label) => ds.with_index(label)?,
            None => ds.clone(),
        };
        let descriptor = TableDescriptor::for_dataset(table, &frame);
        let frame = &frame;
        let descriptor = &descriptor;

        let rows = self
            .retry
            .run(&format!("load into {}", table), move || async move {
                let mut conn = connector.connect().await?;
                info!("replacing table {} ...", table);
                conn.replace_table(descriptor).await?;
                let n = conn.append_rows(table, frame).await?;
                info!("  inserted {} rows in table {}", n, table);
                Ok::<_, IngestError>(n)
            })
            .await?;

        Ok(LoadReport {
            table: table.to_string(),
            rows,
        })
    }
}
