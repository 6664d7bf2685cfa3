use std::collections::HashMap;

use base64::{
    Engine as _,
    alphabet,
    engine::{DecodePaddingMode, GeneralPurpose, GeneralPurposeConfig},
};
use thiserror::Error;
use tracing::{debug, info};

pub const DEFAULT_PROXY_PREFIX: &str = "https://josh9456-myproxy.hf.space/watch/";

/// Path segment marking a proxy-wrapped URL inside the channel directory
pub const WATCH_SEGMENT: &str = "/watch/";

pub const EXTINF_MARKER: &str = "#EXTINF";

const TOKEN_TERMINATOR: &str = ".m3u8";

/// Standard alphabet, padding accepted but not required
const TOKEN_ENGINE: GeneralPurpose = GeneralPurpose::new(
    &alphabet::STANDARD,
    GeneralPurposeConfig::new().with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

#[derive(Debug, Error)]
pub enum ProxyTokenError {
    #[error("URL has no proxy token")]
    MissingToken,
    #[error("proxy token is not valid base64: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("proxy token does not decode to UTF-8: {0}")]
    Utf8(#[from] std::string::FromUtf8Error),
}

/// Decodes a proxy token (the text following the proxy prefix) back to the upstream URL.
///
/// Everything from the first `.m3u8` onward is discarded before decoding.
///
/// # Errors
/// Errors when the token is empty, not base64 or not UTF-8
pub fn decode_token(raw: &str) -> Result<String, ProxyTokenError> {
    let token = raw.split(TOKEN_TERMINATOR).next().unwrap_or_default();
    if token.is_empty() {
        return Err(ProxyTokenError::MissingToken);
    }

    let bytes = TOKEN_ENGINE.decode(token)?;
    Ok(String::from_utf8(bytes)?.trim().to_string())
}

/// Decodes a playlist line that starts with `prefix`.
///
/// Returns `None` when the line is not proxy-wrapped at all.
pub fn decode_prefixed(line: &str, prefix: &str) -> Option<Result<String, ProxyTokenError>> {
    line.strip_prefix(prefix).map(decode_token)
}

#[must_use]
pub fn encode_token(upstream: &str) -> String {
    TOKEN_ENGINE.encode(upstream)
}

/// Wraps an upstream URL the way the proxy does: `<prefix><token>.m3u8`
#[must_use]
pub fn encode_proxy_url(prefix: &str, upstream: &str) -> String {
    format!("{prefix}{}{TOKEN_TERMINATOR}", encode_token(upstream))
}

/// A channel directory entry: its `#EXTINF` metadata line and proxied URL line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyEntry {
    pub metadata: String,
    pub proxy_url: String,
}

/// Lookup from upstream URL to the proxy entry that serves it
pub type ProxyMap = HashMap<String, ProxyEntry>;

/// Builds the upstream URL → proxy entry lookup from channel directory text.
///
/// Entries whose token cannot be decoded are skipped.
#[must_use]
pub fn build_proxy_map(channels: &str) -> ProxyMap {
    let lines = channels.lines().collect::<Vec<_>>();
    let mut map = ProxyMap::new();

    for pair in lines.windows(2) {
        let [metadata, url] = pair else { continue };
        if !metadata.starts_with(EXTINF_MARKER) {
            continue;
        }
        let Some((_, token)) = url.split_once(WATCH_SEGMENT) else {
            continue;
        };

        match decode_token(token) {
            Ok(upstream) => {
                map.insert(
                    upstream,
                    ProxyEntry {
                        metadata: (*metadata).to_string(),
                        proxy_url: (*url).to_string(),
                    },
                );
            }
            Err(e) => debug!("Skipping undecodable directory entry {url}: {e}"),
        }
    }

    info!("Proxy map entries: {}", map.len());
    map
}
