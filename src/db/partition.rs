use chrono::NaiveDate;
use log::{info, warn};
use serde::Serialize;

use crate::dataset::{Column, ColumnType};
use crate::error::IngestError;
use crate::utils::retry::RetryPolicy;

use super::store::{Connector, Store};
use super::table::{PartitionRange, TableDescriptor};

#[derive(Debug, Serialize, PartialEq, Eq, Clone, Copy)]
pub enum ProvisionMode {
    /// Declare, carve and backfill in one transaction.  A failure leaves
    /// nothing behind, so a retry starts from scratch.
    Atomic,
    /// One statement at a time, no rollback.  If the backfill fails the
    /// parent and its partition stay, empty, and a retry fails with
    /// `DuplicateTable`.
    Sequential,
}

/// Columns, partition key and date range of the partitioned copy.
#[derive(Debug, Clone)]
pub struct PartitionLayout {
    pub columns: Vec<Column>,
    pub key: String,
    pub range: PartitionRange,
}

impl PartitionLayout {
    /// Same positional layout as the table the loader writes for the Jena
    /// climate file: the row index, the timestamp, then the 14 measurements.
    pub fn jena_climate() -> PartitionLayout {
        let mut columns = vec![
            Column::new("index", ColumnType::BigInt),
            Column::new("date_time", ColumnType::Timestamp),
        ];
        for name in [
            "p_mbar",
            "t_degc",
            "tpot_k",
            "tdew_degc",
            "rh_percent",
            "vpmax_mbar",
            "vpact_mbar",
            "vpdef_mbar",
            "sh_g_kg",
            "h2oc_mmol_mol",
            "rho_g_m3",
            "wv_m_s",
            "max_wv_m_s",
            "wd_deg",
        ] {
            columns.push(Column::new(name, ColumnType::Double));
        }
        PartitionLayout {
            columns,
            key: "date_time".to_string(),
            range: jena_climate_range(),
        }
    }

    /// The layout for a table loaded without the row index column.
    pub fn without_index(mut self) -> PartitionLayout {
        self.columns.retain(|c| c.name != "index");
        self
    }
}

/// 2009-01-01 (inclusive) to 2016-12-31 (exclusive).
pub fn jena_climate_range() -> PartitionRange {
    PartitionRange::new(
        NaiveDate::from_ymd_opt(2009, 1, 1).unwrap_or(NaiveDate::MIN),
        NaiveDate::from_ymd_opt(2016, 12, 31).unwrap_or(NaiveDate::MAX),
    )
}

#[derive(Debug, Serialize, PartialEq, Eq, Clone)]
pub struct ProvisionReport {
    pub source: String,
    pub parent: String,
    pub partitions: Vec<String>,
    pub rows: u64,
}

#[derive(Debug, Clone)]
pub struct PartitionProvisioner {
    pub layout: PartitionLayout,
    pub mode: ProvisionMode,
    pub retry: RetryPolicy,
}

pub fn parent_name(base: &str) -> String {
    format!("{}_partitioned", base)
}

pub fn child_name(base: &str, range: &PartitionRange) -> String {
    format!("{}_{}", parent_name(base), range.suffix())
}

impl PartitionProvisioner {
    pub fn new(layout: PartitionLayout, mode: ProvisionMode, retry: RetryPolicy) -> Self {
        PartitionProvisioner {
            layout,
            mode,
            retry,
        }
    }

    /// Copy the flat table `base` into a new table `<base>_partitioned`,
    /// range partitioned by date with a single partition.
    pub async fn provision<C: Connector>(
        &self,
        connector: &C,
        base: &str,
    ) -> Result<ProvisionReport, IngestError> {
        let parent = parent_name(base);
        let child = child_name(base, &self.layout.range);
        let (parent, child) = (parent.as_str(), child.as_str());

        let rows = self
            .retry
            .run(&format!("partitioning of {}", base), move || async move {
                let res = self.provision_once(connector, base, parent, child).await;
                if let Err(e) = &res {
                    if e.is_transient() && self.mode == ProvisionMode::Sequential {
                        warn!(
                            "{} may be left half built, a retry will fail if it exists",
                            parent
                        );
                    }
                }
                res
            })
            .await?;

        Ok(ProvisionReport {
            source: base.to_string(),
            parent: parent.to_string(),
            partitions: vec![child.to_string()],
            rows,
        })
    }

    async fn provision_once<C: Connector>(
        &self,
        connector: &C,
        base: &str,
        parent: &str,
        child: &str,
    ) -> Result<u64, IngestError> {
        let mut conn = connector.connect().await?;
        self.preflight(&mut conn, base, parent).await?;
        match self.mode {
            ProvisionMode::Sequential => self.run_steps(&mut conn, base, parent, child).await,
            ProvisionMode::Atomic => {
                conn.begin().await?;
                match self.run_steps(&mut conn, base, parent, child).await {
                    Ok(n) => {
                        conn.commit().await?;
                        Ok(n)
                    }
                    Err(e) => {
                        // if this fails too the connection is dropped, which
                        // rolls back as well
                        if let Err(rb) = conn.rollback().await {
                            warn!("rollback of {} failed: {}", parent, rb);
                        }
                        Err(e)
                    }
                }
            }
        }
    }

    /// Fail before any DDL if the source is missing, the target already
    /// exists, or the source columns don't line up with the layout.  The
    /// backfill is a positional `SELECT *`, so only order and types matter.
    async fn preflight<S: Store>(
        &self,
        conn: &mut S,
        base: &str,
        parent: &str,
    ) -> Result<(), IngestError> {
        if !conn.table_exists(base).await? {
            return Err(IngestError::MissingTable(base.to_string()));
        }
        if conn.table_exists(parent).await? {
            return Err(IngestError::DuplicateTable(parent.to_string()));
        }
        let source = conn.table_columns(base).await?;
        let expected = &self.layout.columns;
        if source.len() != expected.len() {
            return Err(IngestError::schema_mismatch(
                base,
                format!(
                    "{} has {} columns, {} expects {}",
                    base,
                    source.len(),
                    parent,
                    expected.len()
                ),
            ));
        }
        for (i, (s, e)) in source.iter().zip(expected).enumerate() {
            if s.ty != e.ty {
                return Err(IngestError::schema_mismatch(
                    base,
                    format!(
                        "column {} ({}) is {} but {}.{} is {}",
                        i + 1,
                        s.name,
                        s.ty,
                        parent,
                        e.name,
                        e.ty
                    ),
                ));
            }
        }
        Ok(())
    }

    /// Declare, carve, backfill.  Each step only runs if the previous one
    /// succeeded.
    async fn run_steps<S: Store>(
        &self,
        conn: &mut S,
        base: &str,
        parent: &str,
        child: &str,
    ) -> Result<u64, IngestError> {
        info!("creating partitioned table {} ...", parent);
        let descriptor = TableDescriptor::new(parent, self.layout.columns.clone());
        conn.create_partitioned_table(&descriptor, &self.layout.key).await?;

        info!("creating partition {} for {} ...", child, self.layout.range);
        conn.create_range_partition(child, parent, &self.layout.range).await?;

        info!("copying {} into {} ...", base, parent);
        let n = conn.insert_select_all(parent, base).await?;
        info!("  inserted {} rows in {}", n, parent);
        let stored = conn.row_count(child).await?;
        if stored != n {
            warn!("{} holds {} rows, {} were inserted in {}", child, stored, n, parent);
        }
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use std::{error::Error, path::Path, time::Duration};

    use chrono::NaiveDate;

    use crate::dataset::{Dataset, Value};
    use crate::db::loader::Loader;
    use crate::db::memory::{Fault, MemoryDatabase, Step};
    use crate::extract::{tests::sample_csv, ChunkPolicy, Extractor};

    use super::*;

    fn retry() -> RetryPolicy {
        RetryPolicy::new(3, Duration::ZERO)
    }

    fn provisioner(mode: ProvisionMode) -> PartitionProvisioner {
        PartitionProvisioner::new(PartitionLayout::jena_climate(), mode, retry())
    }

    fn dataset() -> Dataset {
        Extractor::new(Path::new("unused.csv"), 100, ChunkPolicy::FirstChunk)
            .extract_from_reader(sample_csv().as_bytes())
            .unwrap()
    }

    async fn loaded(ds: &Dataset) -> Result<MemoryDatabase, IngestError> {
        let db = MemoryDatabase::new();
        Loader::new(retry(), Some("index".to_string()))
            .load(&db, "jena_climate", ds)
            .await?;
        Ok(db)
    }

    #[test]
    fn names() {
        let range = jena_climate_range();
        assert_eq!(parent_name("jena_climate"), "jena_climate_partitioned");
        assert_eq!(
            child_name("jena_climate", &range),
            "jena_climate_partitioned_2009_2016"
        );
        assert_eq!(PartitionLayout::jena_climate().columns.len(), 16);
        assert_eq!(PartitionLayout::jena_climate().without_index().columns.len(), 15);
    }

    #[tokio::test]
    async fn provision_sample() -> Result<(), Box<dyn Error>> {
        let db = loaded(&dataset()).await?;
        let report = provisioner(ProvisionMode::Atomic)
            .provision(&db, "jena_climate")
            .await?;
        assert_eq!(report.rows, 10);
        assert_eq!(report.parent, "jena_climate_partitioned");
        assert_eq!(db.count("jena_climate_partitioned"), Some(10));
        assert_eq!(
            db.partitions_of("jena_climate_partitioned"),
            vec!["jena_climate_partitioned_2009_2016".to_string()]
        );
        assert_eq!(db.count("jena_climate_partitioned_2009_2016"), Some(10));
        assert_eq!(db.open_connections(), 0);
        Ok(())
    }

    #[tokio::test]
    async fn rerun_is_a_duplicate_and_changes_nothing() -> Result<(), Box<dyn Error>> {
        let db = loaded(&dataset()).await?;
        let p = provisioner(ProvisionMode::Sequential);
        p.provision(&db, "jena_climate").await?;
        let steps = db.executed_steps().len();

        let res = p.provision(&db, "jena_climate").await;
        assert!(
            matches!(res, Err(IngestError::DuplicateTable(t)) if t == "jena_climate_partitioned")
        );
        assert_eq!(db.count("jena_climate_partitioned"), Some(10));
        assert_eq!(db.executed_steps().len(), steps);
        Ok(())
    }

    #[tokio::test]
    async fn missing_source_table() {
        let db = MemoryDatabase::new();
        let res = provisioner(ProvisionMode::Atomic)
            .provision(&db, "jena_climate")
            .await;
        assert!(matches!(res, Err(IngestError::MissingTable(t)) if t == "jena_climate"));
        assert!(db.executed_steps().is_empty());
    }

    #[tokio::test]
    async fn source_without_index_is_a_schema_mismatch() -> Result<(), Box<dyn Error>> {
        let db = MemoryDatabase::new();
        Loader::new(retry(), None)
            .load(&db, "jena_climate", &dataset())
            .await?;
        let res = provisioner(ProvisionMode::Atomic)
            .provision(&db, "jena_climate")
            .await;
        assert!(matches!(res, Err(IngestError::SchemaMismatch { .. })));
        assert!(!db.has_table("jena_climate_partitioned"));

        let p = PartitionProvisioner::new(
            PartitionLayout::jena_climate().without_index(),
            ProvisionMode::Atomic,
            retry(),
        );
        assert_eq!(p.provision(&db, "jena_climate").await?.rows, 10);
        Ok(())
    }

    #[tokio::test]
    async fn failed_declare_stops_everything() -> Result<(), Box<dyn Error>> {
        let db = loaded(&dataset()).await?;
        db.fail_at(Step::CreatePartitionedTable, Fault::Fatal, 1);
        let res = provisioner(ProvisionMode::Sequential)
            .provision(&db, "jena_climate")
            .await;
        assert!(matches!(res, Err(IngestError::Database(_))));
        assert!(!db.has_table("jena_climate_partitioned"));
        assert!(!db.has_table("jena_climate_partitioned_2009_2016"));
        assert!(!db.executed_steps().contains(&Step::CreateRangePartition));
        Ok(())
    }

    #[tokio::test]
    async fn failed_carve_skips_backfill() -> Result<(), Box<dyn Error>> {
        let db = loaded(&dataset()).await?;
        db.fail_at(Step::CreateRangePartition, Fault::Fatal, 1);
        let res = provisioner(ProvisionMode::Sequential)
            .provision(&db, "jena_climate")
            .await;
        assert!(matches!(res, Err(IngestError::Database(_))));
        assert!(db.has_table("jena_climate_partitioned"));
        assert!(db.partitions_of("jena_climate_partitioned").is_empty());
        assert!(!db.executed_steps().contains(&Step::InsertSelect));
        Ok(())
    }

    #[tokio::test]
    async fn sequential_leaves_empty_tables_behind() -> Result<(), Box<dyn Error>> {
        let db = loaded(&dataset()).await?;
        db.fail_at(Step::InsertSelect, Fault::Transient, 1);
        let res = provisioner(ProvisionMode::Sequential)
            .provision(&db, "jena_climate")
            .await;
        // the retry trips over the tables left by the first attempt
        assert!(matches!(res, Err(IngestError::DuplicateTable(_))));
        assert_eq!(db.count("jena_climate_partitioned"), Some(0));
        assert_eq!(db.count("jena_climate_partitioned_2009_2016"), Some(0));
        Ok(())
    }

    #[tokio::test]
    async fn atomic_rolls_back_and_retries() -> Result<(), Box<dyn Error>> {
        let db = loaded(&dataset()).await?;
        db.fail_at(Step::InsertSelect, Fault::Transient, 1);
        let report = provisioner(ProvisionMode::Atomic)
            .provision(&db, "jena_climate")
            .await?;
        assert_eq!(report.rows, 10);
        assert_eq!(db.count("jena_climate_partitioned_2009_2016"), Some(10));
        assert_eq!(db.open_connections(), 0);
        Ok(())
    }

    #[tokio::test]
    async fn atomic_failure_leaves_nothing() -> Result<(), Box<dyn Error>> {
        let db = loaded(&dataset()).await?;
        db.fail_at(Step::InsertSelect, Fault::Fatal, 1);
        let res = provisioner(ProvisionMode::Atomic)
            .provision(&db, "jena_climate")
            .await;
        assert!(matches!(res, Err(IngestError::Database(_))));
        assert!(!db.has_table("jena_climate_partitioned"));
        assert!(!db.has_table("jena_climate_partitioned_2009_2016"));
        Ok(())
    }

    #[tokio::test]
    async fn range_bounds_on_backfill() -> Result<(), Box<dyn Error>> {
        let first = NaiveDate::from_ymd_opt(2009, 1, 1)
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap();
        let last = NaiveDate::from_ymd_opt(2016, 12, 31)
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap();

        let mut ds = Dataset::new(dataset().columns().to_vec());
        let row = dataset().rows()[0].clone();
        let mut at_first = row.clone();
        at_first[0] = Value::Timestamp(first);
        ds.push_row(at_first)?;
        let db = loaded(&ds).await?;
        provisioner(ProvisionMode::Atomic)
            .provision(&db, "jena_climate")
            .await?;
        let stored = db
            .stored_rows("jena_climate_partitioned_2009_2016")
            .unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0][1], Value::Timestamp(first));

        let mut ds = Dataset::new(dataset().columns().to_vec());
        let mut at_last = row;
        at_last[0] = Value::Timestamp(last);
        ds.push_row(at_last)?;
        let db = loaded(&ds).await?;
        let res = provisioner(ProvisionMode::Atomic)
            .provision(&db, "jena_climate")
            .await;
        assert!(matches!(res, Err(IngestError::NoPartitionForRow { .. })));
        assert!(!db.has_table("jena_climate_partitioned_2009_2016"));
        Ok(())
    }
}
