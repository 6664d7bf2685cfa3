use std::{path::Path, time::Duration};

use anyhow::{Context, Result, ensure};
use reqwest::StatusCode;
use tracing::{info, instrument};

pub const DEFAULT_CHANNELS_URL: &str = "https://josh9456-myproxy.hf.space/playlist/channels";

const FETCH_TIMEOUT: Duration = Duration::from_secs(10);

/// Downloads the proxy's channel directory and overwrites `dest` with it
///
/// # Errors
/// Errors on network error, a non-200 response or when `dest` cannot be written
#[instrument(skip(client))]
pub async fn fetch_channels(client: &reqwest::Client, url: &str, dest: &Path) -> Result<()> {
    info!("Fetching channels from {url}");
    let res = client
        .get(url)
        .timeout(FETCH_TIMEOUT)
        .send()
        .await
        .context("Fetching channel directory")?;

    ensure!(
        res.status() == StatusCode::OK,
        "Failed to fetch channel directory (HTTP {})",
        res.status()
    );

    let body = res.bytes().await.context("Reading channel directory")?;
    tokio::fs::write(dest, &body)
        .await
        .with_context(|| format!("Writing channel directory to {}", dest.display()))?;

    info!("{} updated", dest.display());
    Ok(())
}
