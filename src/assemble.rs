use std::collections::HashSet;

use tracing::debug;

use crate::proxy::{EXTINF_MARKER, ProxyMap, decode_prefixed};

/// Replaces every `#EXTINF` + URL pair whose upstream URL is both validated and
/// served by the proxy with the proxy's own pair. Everything else passes through.
///
/// The result is newline-joined with a trailing newline.
#[must_use]
pub fn rewrite_playlist(
    playlist: &str,
    valid: &HashSet<String>,
    proxy_map: &ProxyMap,
    proxy_prefix: &str,
) -> String {
    let lines = playlist.lines().collect::<Vec<_>>();
    let mut out = Vec::with_capacity(lines.len());
    let mut replaced = 0;
    let mut i = 0;

    while i < lines.len() {
        let line = lines[i];
        let url_line = lines.get(i + 1).filter(|_| line.starts_with(EXTINF_MARKER));

        if let Some(url_line) = url_line {
            let upstream = match decode_prefixed(url_line, proxy_prefix) {
                Some(Ok(upstream)) => upstream,
                _ => (*url_line).to_string(),
            };

            if let Some(entry) = proxy_map.get(&upstream).filter(|_| valid.contains(&upstream)) {
                out.push(entry.metadata.as_str());
                out.push(entry.proxy_url.as_str());
                replaced += 1;
                i += 2;
                continue;
            }
        }

        out.push(line);
        i += 1;
    }

    debug!("Replaced {replaced} playlist entries with proxy entries");
    let mut rewritten = out.join("\n");
    rewritten.push('\n');
    rewritten
}
