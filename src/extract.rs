use std::{collections::BTreeSet, sync::LazyLock};

use anyhow::{Result, ensure};
use regex::Regex;
use tracing::{info, warn};

use crate::proxy::decode_prefixed;

/// Matches a premium channel stream and captures its numeric channel ID
pub static PREMIUM_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"premium(\d+)/mono\.m3u8").expect("premium regex is valid"));

/// Collects every stream URL in the playlist that may carry a channel ID.
///
/// Proxy-wrapped lines are decoded back to their upstream URL; lines that fail to
/// decode are logged and skipped.
#[must_use]
pub fn collect_stream_urls(
    playlist: &str,
    proxy_prefix: &str,
    pattern: &Regex,
) -> BTreeSet<String> {
    let mut urls = BTreeSet::new();

    for line in playlist.lines().map(str::trim) {
        match decode_prefixed(line, proxy_prefix) {
            Some(Ok(upstream)) => {
                urls.insert(upstream);
            }
            Some(Err(e)) => warn!("Could not decode proxy line {line}: {e}"),
            None if pattern.is_match(line) => {
                urls.insert(line.to_string());
            }
            None => {}
        }
    }

    urls
}

/// Extracts the set of channel IDs referenced by a playlist
///
/// # Errors
/// Errors when no channel ID can be found; there is nothing to validate
pub fn extract_channel_ids(
    playlist: &str,
    proxy_prefix: &str,
    pattern: &Regex,
) -> Result<BTreeSet<String>> {
    let ids = collect_stream_urls(playlist, proxy_prefix, pattern)
        .iter()
        .filter_map(|url| pattern.captures(url))
        .filter_map(|c| c.get(1))
        .map(|m| m.as_str().to_string())
        .filter(|id| !id.is_empty())
        .collect::<BTreeSet<_>>();

    ensure!(!ids.is_empty(), "No premium channel IDs found after decoding");

    info!(
        "Extracted premium IDs: {}",
        ids.iter().cloned().collect::<Vec<_>>().join(", ")
    );
    Ok(ids)
}
