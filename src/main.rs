#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![warn(clippy::cargo)]
#![warn(clippy::perf)]
#![warn(clippy::complexity)]
#![warn(clippy::style)]
#![allow(clippy::multiple_crate_versions)]

use std::{
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use anyhow::{Context, Result, ensure};
use clap::{Args as ClapArgs, Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::{
    candidates::{UrlTemplate, generate_candidates},
    directory::{DEFAULT_CHANNELS_URL, fetch_channels},
    extract::{PREMIUM_REGEX, extract_channel_ids},
    probe::{
        DEFAULT_BACKOFF, DEFAULT_MAX_ATTEMPTS, DEFAULT_REQUEST_TIMEOUT, DEFAULT_WORKERS,
        ProbeConfig, probe_all,
    },
    proxy::{DEFAULT_PROXY_PREFIX, build_proxy_map, encode_proxy_url},
    util::{DEFAULT_USER_AGENT, init_http_client, spawn_ct_watcher},
};

pub mod aggregate;
pub mod assemble;
pub mod candidates;
pub mod directory;
pub mod extract;
pub mod probe;
pub mod proxy;
pub mod util;

/// Validates premium IPTV mirror links and rewrites a playlist to use their proxy entries
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,

    #[command(flatten)]
    files: Files,

    #[command(flatten)]
    probing: Probing,
}

#[derive(Subcommand, Debug, Clone)]
enum Command {
    /// Fetch the channel directory, validate links, then rewrite the playlist [default]
    Run,
    /// Only download the proxy's channel directory
    Fetch,
    /// Only probe the playlist's premium channels and write the validated links file
    Validate,
    /// Only rewrite the playlist from existing validated links and channel directory files
    Assemble,
    /// Print the proxy URL wrapping an upstream stream URL
    Wrap {
        /// Upstream stream URL
        url: String,
    },
}

#[derive(ClapArgs, Debug)]
struct Files {
    /// Playlist to validate and rewrite in place
    #[arg(
        long,
        env = "RELINK_PLAYLIST",
        global = true,
        default_value = "tivimate_playlist.m3u8"
    )]
    playlist: PathBuf,

    /// Where validated links are written
    #[arg(long, env = "RELINK_LINKS", global = true, default_value = "links.m3u8")]
    links: PathBuf,

    /// Where the proxy's channel directory is stored
    #[arg(long, env = "RELINK_CHANNELS", global = true, default_value = "channels.m3u8")]
    channels: PathBuf,

    /// Channel directory download URL
    #[arg(long, env = "RELINK_CHANNELS_URL", global = true, default_value = DEFAULT_CHANNELS_URL)]
    channels_url: String,

    /// Prefix of proxy-wrapped stream URLs
    #[arg(long, env = "RELINK_PROXY_PREFIX", global = true, default_value = DEFAULT_PROXY_PREFIX)]
    proxy_prefix: String,
}

#[derive(ClapArgs, Debug)]
struct Probing {
    /// Attempts per candidate URL
    #[arg(long, env = "RELINK_PROBE_ATTEMPTS", global = true, default_value_t = DEFAULT_MAX_ATTEMPTS,
        value_parser = clap::value_parser!(u32).range(1..))]
    attempts: u32,

    /// Seconds to back off after a rate-limited response
    #[arg(long, env = "RELINK_PROBE_BACKOFF_SECS", global = true,
        default_value_t = DEFAULT_BACKOFF.as_secs())]
    backoff_secs: u64,

    /// Per-request timeout in seconds
    #[arg(long, env = "RELINK_PROBE_TIMEOUT_SECS", global = true,
        default_value_t = DEFAULT_REQUEST_TIMEOUT.as_secs(),
        value_parser = clap::value_parser!(u64).range(1..))]
    timeout_secs: u64,

    /// The amount of parallel probes
    #[arg(short, long, env = "RELINK_PROBE_WORKERS", global = true, default_value_t = DEFAULT_WORKERS,
        value_parser = parse_workers)]
    workers: usize,

    /// User-Agent sent with every request
    #[arg(long, env = "RELINK_USER_AGENT", global = true, default_value = DEFAULT_USER_AGENT)]
    user_agent: String,

    /// Mirror URL template with one `{}` placeholder for the channel ID, repeatable
    /// (defaults to the built-in mirror list)
    #[arg(long = "template", global = true)]
    templates: Vec<UrlTemplate>,
}

fn parse_workers(s: &str) -> Result<usize, String> {
    match s.parse::<usize>() {
        Ok(0) => Err("must be at least 1".to_string()),
        Ok(n) => Ok(n),
        Err(e) => Err(e.to_string()),
    }
}

impl Probing {
    const fn config(&self) -> ProbeConfig {
        ProbeConfig {
            max_attempts: self.attempts,
            backoff: Duration::from_secs(self.backoff_secs),
            request_timeout: Duration::from_secs(self.timeout_secs),
            workers: self.workers,
        }
    }

    fn http_client(&self) -> Result<reqwest::Client> {
        init_http_client(&self.user_agent, Duration::from_secs(self.timeout_secs))
    }

    fn templates(&self) -> Vec<UrlTemplate> {
        if self.templates.is_empty() {
            UrlTemplate::defaults()
        } else {
            self.templates.clone()
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let ct = CancellationToken::new();
    spawn_ct_watcher(ct.clone());

    match args.command.clone().unwrap_or(Command::Run) {
        Command::Run => {
            let client = args.probing.http_client()?;
            info!("=== Fetch Channels ===");
            fetch_channels(&client, &args.files.channels_url, &args.files.channels).await?;
            info!("=== Validate Links ===");
            validate(&args, client, &ct).await?;
            info!("=== Assemble Playlist ===");
            assemble(&args.files).await?;
            info!("=== All Done ===");
        }
        Command::Fetch => {
            let client = args.probing.http_client()?;
            fetch_channels(&client, &args.files.channels_url, &args.files.channels).await?;
        }
        Command::Validate => {
            validate(&args, args.probing.http_client()?, &ct).await?;
        }
        Command::Assemble => assemble(&args.files).await?,
        Command::Wrap { url } => {
            println!("{}", encode_proxy_url(&args.files.proxy_prefix, &url));
        }
    }

    Ok(())
}

async fn read_required(path: &Path) -> Result<String> {
    ensure!(
        tokio::fs::try_exists(path).await.unwrap_or(false),
        "{} missing",
        path.display()
    );
    tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Reading {}", path.display()))
}

/// Extracts channel IDs from the playlist, probes every mirror for them and writes the live ones
async fn validate(args: &Args, client: reqwest::Client, ct: &CancellationToken) -> Result<usize> {
    let playlist = read_required(&args.files.playlist).await?;
    let ids = extract_channel_ids(&playlist, &args.files.proxy_prefix, &PREMIUM_REGEX)?;
    let candidates = generate_candidates(&ids, &args.probing.templates());

    let pb = ProgressBar::new(u64::try_from(candidates.len()).unwrap_or(u64::MAX));
    pb.set_style(
        ProgressStyle::with_template(
            "[{elapsed_precise}] [{wide_bar:.cyan/blue}] {pos}/{len} URLs ({eta})",
        )
        .context("Progress bar template")?,
    );

    let outcomes = probe_all(Arc::new(client), candidates, args.probing.config(), &pb, ct).await;
    pb.finish_and_clear();

    aggregate::write_links(&args.files.links, &outcomes?).await
}

/// Rewrites the playlist in place, swapping validated channels for their proxy entries
async fn assemble(files: &Files) -> Result<()> {
    let valid = aggregate::read_links(&files.links).await?;
    let channels = read_required(&files.channels).await?;
    let proxy_map = build_proxy_map(&channels);
    let playlist = read_required(&files.playlist).await?;

    let rewritten =
        assemble::rewrite_playlist(&playlist, &valid, &proxy_map, &files.proxy_prefix);
    tokio::fs::write(&files.playlist, rewritten)
        .await
        .with_context(|| format!("Writing {}", files.playlist.display()))?;

    info!("Overwrote {} with full proxy entries", files.playlist.display());
    Ok(())
}
