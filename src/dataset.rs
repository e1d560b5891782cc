use std::fmt;

use chrono::NaiveDateTime;
use serde::Serialize;

use crate::error::IngestError;

#[derive(Debug, Serialize, PartialEq, Eq, Clone, Copy)]
pub enum ColumnType {
    BigInt,
    Double,
    Text,
    Timestamp,
}

impl ColumnType {
    /// The PostgreSQL type used in DDL statements.
    pub fn sql_type(&self) -> &'static str {
        match self {
            ColumnType::BigInt => "BIGINT",
            ColumnType::Double => "DOUBLE PRECISION",
            ColumnType::Text => "TEXT",
            ColumnType::Timestamp => "TIMESTAMP",
        }
    }

    /// Map a type name as reported by `information_schema.columns.data_type`.
    pub fn from_information_schema(s: &str) -> Option<ColumnType> {
        match s {
            "bigint" => Some(ColumnType::BigInt),
            "double precision" => Some(ColumnType::Double),
            "text" => Some(ColumnType::Text),
            "timestamp without time zone" => Some(ColumnType::Timestamp),
            _ => None,
        }
    }
}

impl fmt::Display for ColumnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.sql_type())
    }
}

#[derive(Debug, Serialize, PartialEq, Clone)]
pub struct Column {
    pub name: String,
    pub ty: ColumnType,
}

impl Column {
    pub fn new(name: &str, ty: ColumnType) -> Column {
        Column {
            name: name.to_string(),
            ty,
        }
    }
}

#[derive(Debug, PartialEq, Clone)]
pub enum Value {
    Null,
    BigInt(i64),
    Double(f64),
    Text(String),
    Timestamp(NaiveDateTime),
}

impl Value {
    /// Null fits every column.
    pub fn fits(&self, ty: ColumnType) -> bool {
        matches!(
            (self, ty),
            (Value::Null, _)
                | (Value::BigInt(_), ColumnType::BigInt)
                | (Value::Double(_), ColumnType::Double)
                | (Value::Text(_), ColumnType::Text)
                | (Value::Timestamp(_), ColumnType::Timestamp)
        )
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "NULL"),
            Value::BigInt(v) => write!(f, "{}", v),
            Value::Double(v) => write!(f, "{}", v),
            Value::Text(v) => write!(f, "{}", v),
            Value::Timestamp(v) => write!(f, "{}", v.format("%Y-%m-%d %H:%M:%S")),
        }
    }
}

/// An in-memory table.  Every row has one value per column and each value
/// fits its column's type.
#[derive(Debug, PartialEq, Clone)]
pub struct Dataset {
    columns: Vec<Column>,
    rows: Vec<Vec<Value>>,
}

impl Dataset {
    pub fn new(columns: Vec<Column>) -> Dataset {
        Dataset {
            columns,
            rows: Vec::new(),
        }
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    pub fn rows(&self) -> &[Vec<Value>] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }

    /// All the values of one column, in row order.
    pub fn column_values(&self, name: &str) -> Option<Vec<&Value>> {
        let idx = self.column_index(name)?;
        Some(self.rows.iter().map(|row| &row[idx]).collect())
    }

    pub fn push_row(&mut self, row: Vec<Value>) -> Result<(), String> {
        if row.len() != self.columns.len() {
            return Err(format!(
                "expected {} values, got {}",
                self.columns.len(),
                row.len()
            ));
        }
        for (value, column) in row.iter().zip(&self.columns) {
            if !value.fits(column.ty) {
                return Err(format!(
                    "value {} doesn't fit column {} of type {}",
                    value, column.name, column.ty
                ));
            }
        }
        self.rows.push(row);
        Ok(())
    }

    /// Append the rows of another dataset with the same columns.
    pub fn extend(&mut self, other: Dataset) -> Result<(), String> {
        if other.columns != self.columns {
            return Err("datasets have different columns".to_string());
        }
        self.rows.extend(other.rows);
        Ok(())
    }

    /// A copy with a leading BIGINT column holding the 0-based row number.
    pub fn with_index(&self, label: &str) -> Result<Dataset, IngestError> {
        if self.column_index(label).is_some() {
            return Err(IngestError::Config(format!(
                "index label {} collides with an existing column",
                label
            )));
        }
        let mut columns = Vec::with_capacity(self.columns.len() + 1);
        columns.push(Column::new(label, ColumnType::BigInt));
        columns.extend(self.columns.iter().cloned());
        let rows = self
            .rows
            .iter()
            .enumerate()
            .map(|(i, row)| {
                let mut out = Vec::with_capacity(row.len() + 1);
                out.push(Value::BigInt(i as i64));
                out.extend(row.iter().cloned());
                out
            })
            .collect();
        Ok(Dataset { columns, rows })
    }
}
