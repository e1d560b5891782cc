use std::{error::Error, path::PathBuf};

use clap::Parser;
use climate_ingest::{
    config::{PgConfig, PipelineConfig},
    db::postgres::PgConnector,
    extract::ChunkPolicy,
    pipeline::Pipeline,
    utils::download::ensure_file,
};
use log::{info, warn};

#[derive(Parser, Debug)]
#[command(
    version,
    about,
    long_about = "Upload the whole Jena climate csv file to a Postgres table, replacing it."
)]
struct Args {
    /// Environment name, e.g., test, prod
    #[arg(short, long, default_value = "prod")]
    env: String,

    #[arg(long)]
    user: Option<String>,

    #[arg(long)]
    password: Option<String>,

    #[arg(long)]
    host: Option<String>,

    #[arg(long)]
    port: Option<String>,

    #[arg(long)]
    db: Option<String>,

    #[arg(long = "table_name", default_value = "jena_climate")]
    table_name: String,

    /// Url of the csv, only used if the csv file doesn't exist yet
    #[arg(long)]
    url: Option<String>,

    #[arg(long, default_value = "./jena_climate_2009_2016.csv")]
    csv: PathBuf,
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
    let pg = PgConfig::resolve(args.user, args.password, args.host, args.port, args.db)?;

    let (url, csv) = (args.url.clone(), args.csv.clone());
    tokio::task::spawn_blocking(move || ensure_file(url.as_deref(), &csv)).await??;

    let mut config = PipelineConfig::jena_climate(&args.csv);
    config.table_name = args.table_name;
    config.chunk_policy = ChunkPolicy::AllChunks { max_chunks: None };
    let pipeline = Pipeline::new(config);

    let ds = pipeline.extractor().extract()?;
    let report = pipeline
        .loader()
        .load(&PgConnector::new(&pg), &pipeline.config.table_name, &ds)
        .await?;
    info!("Uploaded {} rows to {}", report.rows, report.table);

    Ok(())
}
