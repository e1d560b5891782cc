use log::info;
use serde::Serialize;

use crate::config::PipelineConfig;
use crate::db::loader::{LoadReport, Loader};
use crate::db::partition::{PartitionLayout, PartitionProvisioner, ProvisionReport};
use crate::db::store::Connector;
use crate::error::IngestError;
use crate::extract::Extractor;
use crate::utils::download::ensure_file;

#[derive(Debug, Serialize, PartialEq, Eq, Clone)]
pub struct PipelineReport {
    pub rows_extracted: u64,
    pub load: LoadReport,
    pub partitions: ProvisionReport,
}

pub struct Pipeline {
    pub config: PipelineConfig,
}

impl Pipeline {
    pub fn new(config: PipelineConfig) -> Pipeline {
        Pipeline { config }
    }

    pub fn extractor(&self) -> Extractor {
        Extractor::new(
            &self.config.csv_path,
            self.config.chunk_size,
            self.config.chunk_policy,
        )
    }

    pub fn loader(&self) -> Loader {
        Loader::new(self.config.retry, self.config.index_label.clone())
    }

    pub fn provisioner(&self) -> PartitionProvisioner {
        let layout = match self.config.index_label {
            Some(_) => PartitionLayout::jena_climate(),
            None => PartitionLayout::jena_climate().without_index(),
        };
        PartitionProvisioner::new(layout, self.config.provision_mode, self.config.retry)
    }

    /// Extract, load, partition.  The first error stops the run, whatever
    /// was done before it stays done.
    pub async fn run<C: Connector>(&self, connector: &C) -> Result<PipelineReport, IngestError> {
        let table = self.config.table_name.as_str();
        info!("Ingesting {} into {}", self.config.csv_path.display(), table);

        if let Some(url) = &self.config.url {
            let (url, path) = (url.clone(), self.config.csv_path.clone());
            tokio::task::spawn_blocking(move || ensure_file(Some(url.as_str()), &path))
                .await
                .map_err(|e| IngestError::Download(e.to_string()))??;
        }

        let ds = self.extractor().extract()?;
        let rows_extracted = ds.len() as u64;
        let load = self.loader().load(connector, table, &ds).await?;
        drop(ds);
        let partitions = self.provisioner().provision(connector, table).await?;

        info!("Ingestion of {} done", table);
        Ok(PipelineReport {
            rows_extracted,
            load,
            partitions,
        })
    }
}
