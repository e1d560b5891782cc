use std::{error::Error, path::PathBuf, time::Duration};

use clap::Parser;
use climate_ingest::{
    config::{PgConfig, PipelineConfig},
    db::{memory::MemoryDatabase, partition::ProvisionMode, postgres::PgConnector},
    extract::ChunkPolicy,
    pipeline::Pipeline,
    utils::retry::RetryPolicy,
};
use log::{error, info, warn};

#[derive(Parser, Debug)]
#[command(
    version,
    about,
    long_about = "Ingest the Jena climate csv file into Postgres and create a copy of the table partitioned by date."
)]
struct Args {
    /// Environment name, e.g., test, prod.  Reads .env/{env}.env for the
    /// connection settings not given on the command line.
    #[arg(short, long, default_value = "prod")]
    env: String,

    /// User name for postgres
    #[arg(long)]
    user: Option<String>,

    /// Password for postgres
    #[arg(long)]
    password: Option<String>,

    /// Host name for postgres
    #[arg(long)]
    host: Option<String>,

    /// Port for postgres
    #[arg(long)]
    port: Option<String>,

    /// Database name for postgres
    #[arg(long)]
    db: Option<String>,

    /// Table name for postgres
    #[arg(long = "table_name", default_value = "jena_climate")]
    table_name: String,

    /// Url of the csv, only used if the csv file doesn't exist yet
    #[arg(long)]
    url: Option<String>,

    /// Path of the csv file, a .gz extension is decompressed on the fly
    #[arg(long, default_value = "./jena_climate_2009_2016.csv")]
    csv: PathBuf,

    #[arg(long, default_value_t = 10_000)]
    chunk_size: usize,

    /// Read the whole file instead of the first chunk only
    #[arg(long)]
    all_chunks: bool,

    /// With --all-chunks, stop after this many chunks
    #[arg(long)]
    max_chunks: Option<usize>,

    /// Create the partitioned table one statement at a time, without a
    /// transaction
    #[arg(long)]
    sequential: bool,

    #[arg(long, default_value_t = 3)]
    retries: u32,

    /// Seconds to wait before a retry
    #[arg(long, default_value_t = 1)]
    retry_delay: u64,

    /// Run against an in-memory database, nothing is written to postgres
    #[arg(long)]
    dry_run: bool,
}

impl Args {
    fn pipeline_config(&self) -> PipelineConfig {
        let mut config = PipelineConfig::jena_climate(&self.csv);
        config.table_name = self.table_name.clone();
        config.url = self.url.clone();
        config.chunk_size = self.chunk_size;
        config.chunk_policy = if self.all_chunks {
            ChunkPolicy::AllChunks {
                max_chunks: self.max_chunks,
            }
        } else {
            ChunkPolicy::FirstChunk
        };
        config.retry = RetryPolicy::new(self.retries, Duration::from_secs(self.retry_delay));
        if self.sequential {
            config.provision_mode = ProvisionMode::Sequential;
        }
        config
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let args = Args::parse();

    env_logger::builder()
        .filter_level(log::LevelFilter::Info)
        .init();
    if let Err(e) = dotenvy::from_path(format!(".env/{}.env", args.env)) {
        warn!("no .env/{}.env file loaded: {}", args.env, e);
    }
    if args.max_chunks.is_some() && !args.all_chunks {
        warn!("--max-chunks is ignored without --all-chunks");
    }

    let pipeline = Pipeline::new(args.pipeline_config());
    let report = if args.dry_run {
        info!("Dry run, using an in-memory database");
        pipeline.run(&MemoryDatabase::new()).await
    } else {
        let pg = PgConfig::resolve(
            args.user.clone(),
            args.password.clone(),
            args.host.clone(),
            args.port.clone(),
            args.db.clone(),
        )?;
        pipeline.run(&PgConnector::new(&pg)).await
    };

    match report {
        Ok(report) => {
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
        Err(e) => {
            error!("{}", e);
            Err(e.into())
        }
    }
}
