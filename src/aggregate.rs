use std::{collections::HashSet, path::Path};

use anyhow::{Context, Result, ensure};
use tracing::info;

use crate::probe::{ProbeOutcome, Verdict};

/// Tally of probe verdicts for the run summary
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Summary {
    pub live: usize,
    pub dead: usize,
    pub indeterminate: usize,
    /// Attempts spent across every candidate
    pub attempts: u32,
    /// Rate-limit sleeps taken across every candidate
    pub backoffs: u32,
}

impl Summary {
    #[must_use]
    pub fn of(outcomes: &[ProbeOutcome]) -> Self {
        outcomes.iter().fold(Self::default(), |mut s, o| {
            match o.report.verdict {
                Verdict::Live => s.live += 1,
                Verdict::Dead => s.dead += 1,
                Verdict::Indeterminate => s.indeterminate += 1,
            }
            s.attempts += o.report.attempts;
            s.backoffs += o.report.backoffs;
            s
        })
    }
}

/// Live URLs in candidate order
#[must_use]
pub fn live_urls(outcomes: &[ProbeOutcome]) -> Vec<&str> {
    outcomes
        .iter()
        .filter(|o| o.report.verdict.is_live())
        .map(|o| o.url.as_str())
        .collect()
}

/// Overwrites `path` with the live URLs, one per line. Returns how many were written.
///
/// # Errors
/// Errors when the file cannot be written
pub async fn write_links(path: &Path, outcomes: &[ProbeOutcome]) -> Result<usize> {
    let summary = Summary::of(outcomes);
    let live = live_urls(outcomes);

    tokio::fs::write(path, live.join("\n"))
        .await
        .with_context(|| format!("Writing validated links to {}", path.display()))?;

    info!(
        "{} valid written to {} ({} dead, {} indeterminate, {} attempts, {} rate-limit backoffs)",
        summary.live,
        path.display(),
        summary.dead,
        summary.indeterminate,
        summary.attempts,
        summary.backoffs
    );
    Ok(live.len())
}

/// Reads a validated links file back into a set
///
/// # Errors
/// Errors when the file is missing or unreadable
pub async fn read_links(path: &Path) -> Result<HashSet<String>> {
    ensure!(
        tokio::fs::try_exists(path).await.unwrap_or(false),
        "{} missing",
        path.display()
    );
    let body = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Reading validated links from {}", path.display()))?;

    Ok(body
        .lines()
        .filter(|l| !l.is_empty())
        .map(str::to_string)
        .collect())
}
