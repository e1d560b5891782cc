use std::fs::{self, File};
use std::io;
use std::path::Path;

use log::info;
use reqwest::{blocking::Client, StatusCode};

use crate::error::IngestError;

/// Download `url` into `file_path`, creating the parent directory if needed.
/// Blocking, call it from `spawn_blocking` inside a runtime.
pub fn download_file(url: &str, file_path: &Path) -> Result<(), IngestError> {
    info!("downloading {} to {} ...", url, file_path.display());
    let client = Client::new();
    let mut response = client
        .get(url)
        .send()
        .map_err(|e| IngestError::Download(e.to_string()))?;
    if response.status() != StatusCode::OK {
        return Err(IngestError::Download(format!(
            "{} returned {}",
            url,
            response.status()
        )));
    }

    if let Some(dir) = file_path.parent() {
        fs::create_dir_all(dir)?;
    }
    // write to a temporary name so a failed download doesn't look like data
    let tmp = file_path.with_extension("part");
    let mut out = File::create(&tmp)?;
    response
        .copy_to(&mut out)
        .map_err(|e| IngestError::Download(e.to_string()))?;
    fs::rename(&tmp, file_path)?;
    info!("done");
    Ok(())
}

/// Only download when the file isn't there yet.
pub fn ensure_file(url: Option<&str>, file_path: &Path) -> Result<(), IngestError> {
    match url {
        Some(url) if !file_path.exists() => download_file(url, file_path),
        Some(_) => {
            info!("{} exists, not downloading it again", file_path.display());
            Ok(())
        }
        None if file_path.exists() => Ok(()),
        None => Err(IngestError::Io(io::Error::new(
            io::ErrorKind::NotFound,
            format!("{} not found and no url to download it from", file_path.display()),
        ))),
    }
}
