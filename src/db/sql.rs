use crate::dataset::Column;

use super::table::{PartitionRange, TableDescriptor};

/// Quote an identifier, e.g. `p (mbar)` -> `"p (mbar)"`.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn column_list(columns: &[Column]) -> String {
    columns
        .iter()
        .map(|c| format!("{} {}", quote_ident(&c.name), c.ty.sql_type()))
        .collect::<Vec<_>>()
        .join(", ")
}

pub fn drop_table_if_exists(name: &str) -> String {
    format!("DROP TABLE IF EXISTS {}", quote_ident(name))
}

pub fn create_table(table: &TableDescriptor) -> String {
    format!(
        "CREATE TABLE {} ({})",
        quote_ident(&table.name),
        column_list(&table.columns)
    )
}

pub fn create_partitioned_table(table: &TableDescriptor, key: &str) -> String {
    format!(
        "CREATE TABLE {} ({}) PARTITION BY RANGE ({})",
        quote_ident(&table.name),
        column_list(&table.columns),
        quote_ident(key)
    )
}

pub fn create_range_partition(child: &str, parent: &str, range: &PartitionRange) -> String {
    format!(
        "CREATE TABLE {} PARTITION OF {} FOR VALUES FROM ('{}') TO ('{}')",
        quote_ident(child),
        quote_ident(parent),
        range.from.format("%Y-%m-%d"),
        range.to.format("%Y-%m-%d")
    )
}

/// Positional copy, the column order of `source` must match `target`.
pub fn insert_select_all(target: &str, source: &str) -> String {
    format!(
        "INSERT INTO {} SELECT * FROM {}",
        quote_ident(target),
        quote_ident(source)
    )
}

/// Prefix of a multi-row insert, the VALUES part is added by the caller.
pub fn insert_into(table: &str, columns: &[Column]) -> String {
    let names = columns
        .iter()
        .map(|c| quote_ident(&c.name))
        .collect::<Vec<_>>()
        .join(", ");
    format!("INSERT INTO {} ({}) ", quote_ident(table), names)
}

pub fn count_rows(name: &str) -> String {
    format!("SELECT count(*) FROM {}", quote_ident(name))
}

pub const TABLE_EXISTS: &str = r#"
SELECT EXISTS (
    SELECT 1 FROM information_schema.tables
    WHERE table_schema = current_schema()
    AND table_name = $1
)"#;

pub const TABLE_COLUMNS: &str = r#"
SELECT column_name::TEXT, data_type::TEXT
FROM information_schema.columns
WHERE table_schema = current_schema()
AND table_name = $1
ORDER BY ordinal_position"#;
