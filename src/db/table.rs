use std::fmt;

use chrono::{NaiveDate, NaiveDateTime};
use serde::Serialize;

use crate::dataset::{Column, Dataset};

#[derive(Debug, Serialize, PartialEq, Clone)]
pub struct TableDescriptor {
    pub name: String,
    pub columns: Vec<Column>,
}

impl TableDescriptor {
    pub fn new(name: &str, columns: Vec<Column>) -> TableDescriptor {
        TableDescriptor {
            name: name.to_string(),
            columns,
        }
    }

    /// Describe the table a dataset gets written to.
    pub fn for_dataset(name: &str, ds: &Dataset) -> TableDescriptor {
        TableDescriptor::new(name, ds.columns().to_vec())
    }
}

/// A `[from, to)` date range.
#[derive(Debug, Serialize, PartialEq, Eq, Clone, Copy)]
pub struct PartitionRange {
    pub from: NaiveDate,
    pub to: NaiveDate,
}

impl PartitionRange {
    pub fn new(from: NaiveDate, to: NaiveDate) -> PartitionRange {
        PartitionRange { from, to }
    }

    /// Lower bound inclusive, upper bound exclusive, same as a PostgreSQL
    /// `FOR VALUES FROM (..) TO (..)` clause.
    pub fn contains(&self, dt: &NaiveDateTime) -> bool {
        let from = self.from.and_time(chrono::NaiveTime::MIN);
        let to = self.to.and_time(chrono::NaiveTime::MIN);
        *dt >= from && *dt < to
    }

    pub fn overlaps(&self, other: &PartitionRange) -> bool {
        self.from < other.to && other.from < self.to
    }

    /// Suffix of the child partition name, e.g. `2009_2016`.
    pub fn suffix(&self) -> String {
        self.from.format("%Y").to_string() + "_" + &self.to.format("%Y").to_string()
    }
}

impl fmt::Display for PartitionRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.from, self.to)
    }
}

#[cfg(test)]
mod tests {
    use chrono::NaiveDate;

    use super::PartitionRange;

    fn range() -> PartitionRange {
        PartitionRange::new(
            NaiveDate::from_ymd_opt(2009, 1, 1).unwrap(),
            NaiveDate::from_ymd_opt(2016, 12, 31).unwrap(),
        )
    }

    #[test]
    fn bounds() {
        let r = range();
        let lower = NaiveDate::from_ymd_opt(2009, 1, 1)
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap();
        let upper = NaiveDate::from_ymd_opt(2016, 12, 31)
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap();
        assert!(r.contains(&lower));
        assert!(!r.contains(&upper));
        assert!(r.contains(&(upper - chrono::Duration::seconds(1))));
        assert_eq!(r.suffix(), "2009_2016");
        assert_eq!(r.to_string(), "[2009-01-01, 2016-12-31)");
    }

    #[test]
    fn overlapping_ranges() {
        let r = range();
        let next = PartitionRange::new(
            NaiveDate::from_ymd_opt(2016, 12, 31).unwrap(),
            NaiveDate::from_ymd_opt(2018, 1, 1).unwrap(),
        );
        assert!(!r.overlaps(&next));
        assert!(r.overlaps(&r));
    }
}
