use std::env;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use sqlx::postgres::PgConnectOptions;

use crate::db::partition::ProvisionMode;
use crate::error::IngestError;
use crate::extract::ChunkPolicy;
use crate::utils::retry::RetryPolicy;

#[derive(Clone, PartialEq, Eq)]
pub struct PgConfig {
    pub user: String,
    pub password: String,
    pub host: String,
    pub port: u16,
    pub db: String,
}

impl fmt::Debug for PgConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PgConfig")
            .field("user", &self.user)
            .field("password", &"***")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("db", &self.db)
            .finish()
    }
}

fn required(name: &str, value: Option<String>) -> Result<String, IngestError> {
    value.ok_or_else(|| {
        IngestError::Config(format!(
            "{} is not set on the command line nor in the environment",
            name
        ))
    })
}

impl PgConfig {
    /// Read `PG_USER`, `PG_PASSWORD`, `PG_HOST`, `PG_PORT` and `PG_DB`.
    pub fn from_env() -> Result<PgConfig, IngestError> {
        PgConfig::resolve(None, None, None, None, None)
    }

    /// Values given explicitly win, the environment only fills the gaps.
    pub fn resolve(
        user: Option<String>,
        password: Option<String>,
        host: Option<String>,
        port: Option<String>,
        db: Option<String>,
    ) -> Result<PgConfig, IngestError> {
        let user = required("user", user.or_else(|| env::var("PG_USER").ok()))?;
        let password = required("password", password.or_else(|| env::var("PG_PASSWORD").ok()))?;
        let host = required("host", host.or_else(|| env::var("PG_HOST").ok()))?;
        let port = required("port", port.or_else(|| env::var("PG_PORT").ok()))?;
        let db = required("db", db.or_else(|| env::var("PG_DB").ok()))?;
        let port = port
            .parse::<u16>()
            .map_err(|_| IngestError::Config(format!("invalid port {:?}", port)))?;
        Ok(PgConfig {
            user,
            password,
            host,
            port,
            db,
        })
    }

    /// Built field by field, the password needs no url escaping.
    pub fn connect_options(&self) -> PgConnectOptions {
        PgConnectOptions::new()
            .host(&self.host)
            .port(self.port)
            .username(&self.user)
            .password(&self.password)
            .database(&self.db)
    }
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub table_name: String,
    pub csv_path: PathBuf,
    /// Download the csv from here if `csv_path` doesn't exist
    pub url: Option<String>,
    pub chunk_size: usize,
    pub chunk_policy: ChunkPolicy,
    /// Name of the row number column written by the loader, `None` to skip it
    pub index_label: Option<String>,
    pub retry: RetryPolicy,
    pub provision_mode: ProvisionMode,
}

impl PipelineConfig {
    pub fn jena_climate(csv_path: &Path) -> PipelineConfig {
        PipelineConfig {
            table_name: "jena_climate".to_string(),
            csv_path: csv_path.to_path_buf(),
            url: None,
            chunk_size: 10_000,
            chunk_policy: ChunkPolicy::FirstChunk,
            index_label: Some("index".to_string()),
            retry: RetryPolicy::new(3, Duration::from_secs(1)),
            provision_mode: ProvisionMode::Atomic,
        }
    }
}
