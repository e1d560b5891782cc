use thiserror::Error;

#[derive(Error, Debug)]
pub enum IngestError {
    /// A timestamp or a row doesn't have the expected shape.
    #[error("format error at line {line}: {message}")]
    Format { line: u64, message: String },

    #[error("transient connection error: {0}")]
    TransientConnection(String),

    #[error("table {0} already exists")]
    DuplicateTable(String),

    #[error("table {0} does not exist")]
    MissingTable(String),

    #[error("schema mismatch for table {table}: {message}")]
    SchemaMismatch { table: String, message: String },

    #[error("no partition of {table} accepts {key} = {value}")]
    NoPartitionForRow {
        table: String,
        key: String,
        value: String,
    },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("download failed: {0}")]
    Download(String),

    #[error("database error: {0}")]
    Database(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl IngestError {
    pub fn format(line: u64, message: impl Into<String>) -> Self {
        IngestError::Format {
            line,
            message: message.into(),
        }
    }

    pub fn schema_mismatch(table: &str, message: impl Into<String>) -> Self {
        IngestError::SchemaMismatch {
            table: table.to_string(),
            message: message.into(),
        }
    }

    /// Only connection drops are worth another attempt.  Everything else
    /// (bad input, violated DDL preconditions, schema drift) fails the same
    /// way the next time around.
    pub fn is_transient(&self) -> bool {
        matches!(self, IngestError::TransientConnection(_))
    }
}

impl From<csv::Error> for IngestError {
    fn from(e: csv::Error) -> Self {
        let line = e.position().map(|p| p.line()).unwrap_or(0);
        match e.into_kind() {
            csv::ErrorKind::Io(e) => IngestError::Io(e),
            kind => IngestError::format(line, format!("{:?}", kind)),
        }
    }
}
