use std::{future::Future, sync::Arc, time::Duration};

use anyhow::{Context, Result, bail};
use indicatif::ProgressBar;
use reqwest::StatusCode;
use tokio::{select, sync::Semaphore, task::JoinSet, time::timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;
pub const DEFAULT_BACKOFF: Duration = Duration::from_secs(5);
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_WORKERS: usize = 10;

/// Knobs of the probing protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeConfig {
    /// Attempts per candidate before giving up as indeterminate
    pub max_attempts: u32,
    /// Sleep after a rate-limited (429) response
    pub backoff: Duration,
    /// Bound on every single HEAD / GET request
    pub request_timeout: Duration,
    /// Candidates probed concurrently
    pub workers: usize,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            backoff: DEFAULT_BACKOFF,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            workers: DEFAULT_WORKERS,
        }
    }
}

/// The network side of a probe. Any `Err` is a transport failure (DNS, refused
/// connection, TLS, ...).
pub trait LinkProbe: Send + Sync {
    fn head_status(&self, url: &str) -> impl Future<Output = Result<StatusCode>> + Send;
    fn get_status(&self, url: &str) -> impl Future<Output = Result<StatusCode>> + Send;
}

impl LinkProbe for reqwest::Client {
    async fn head_status(&self, url: &str) -> Result<StatusCode> {
        let res = self.head(url).send().await.context("HEAD request")?;
        Ok(res.status())
    }

    async fn get_status(&self, url: &str) -> Result<StatusCode> {
        let res = self.get(url).send().await.context("GET request")?;
        Ok(res.status())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Live,
    Dead,
    /// Every attempt ended without a live or dead answer
    Indeterminate,
}

impl Verdict {
    #[must_use]
    pub const fn is_live(self) -> bool {
        matches!(self, Self::Live)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeReport {
    pub verdict: Verdict,
    pub attempts: u32,
    pub backoffs: u32,
}

/// A candidate URL together with how its probe ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeOutcome {
    pub url: String,
    pub report: ProbeReport,
}

enum ProbeState {
    Attempting(u32),
    Done(Verdict),
}

async fn bounded<F>(limit: Duration, request: F) -> Result<StatusCode>
where
    F: Future<Output = Result<StatusCode>>,
{
    timeout(limit, request)
        .await
        .with_context(|| format!("Request timed out after {limit:?}"))?
}

/// Runs the retry protocol for one candidate.
///
/// * 200 on HEAD: live
/// * 429 on HEAD: back off, retry
/// * 404 on HEAD: dead
/// * anything else: GET, live on 200, otherwise retry
/// * any transport error or timeout: dead
#[instrument(skip(probe, config))]
pub async fn probe_candidate<P: LinkProbe + ?Sized>(
    probe: &P,
    url: &str,
    config: &ProbeConfig,
) -> ProbeReport {
    let mut backoffs = 0;
    let mut attempts = 0;
    let mut state = ProbeState::Attempting(1);

    let verdict = loop {
        let attempt = match state {
            ProbeState::Done(verdict) => break verdict,
            ProbeState::Attempting(n) if n > config.max_attempts => break Verdict::Indeterminate,
            ProbeState::Attempting(n) => n,
        };
        attempts = attempt;
        debug!("{url} (try {attempt})");

        state = match bounded(config.request_timeout, probe.head_status(url)).await {
            Ok(StatusCode::OK) => ProbeState::Done(Verdict::Live),
            Ok(StatusCode::NOT_FOUND) => ProbeState::Done(Verdict::Dead),
            Ok(StatusCode::TOO_MANY_REQUESTS) => {
                warn!("Rate limited on {url}, backing off {:?}", config.backoff);
                tokio::time::sleep(config.backoff).await;
                backoffs += 1;
                ProbeState::Attempting(attempt + 1)
            }
            Ok(status) => {
                debug!("HEAD {url} returned {status}, retrying with GET");
                match bounded(config.request_timeout, probe.get_status(url)).await {
                    Ok(StatusCode::OK) => ProbeState::Done(Verdict::Live),
                    Ok(_) => ProbeState::Attempting(attempt + 1),
                    Err(e) => {
                        debug!("GET {url} failed: {e:#}");
                        ProbeState::Done(Verdict::Dead)
                    }
                }
            }
            Err(e) => {
                debug!("HEAD {url} failed: {e:#}");
                ProbeState::Done(Verdict::Dead)
            }
        };
    };

    debug!("{url}: {verdict:?} after {attempts} attempt(s), {backoffs} backoff(s)");
    ProbeReport {
        verdict,
        attempts,
        backoffs,
    }
}

/// Probes every candidate with at most `config.workers` probes in flight.
///
/// Outcomes are returned in candidate order regardless of completion order.
///
/// # Errors
/// Errors when cancelled or when a probe task panics
pub async fn probe_all<P>(
    probe: Arc<P>,
    candidates: Vec<String>,
    config: ProbeConfig,
    progress: &ProgressBar,
    ct: &CancellationToken,
) -> Result<Vec<ProbeOutcome>>
where
    P: LinkProbe + 'static,
{
    info!(
        "Checking {} URLs with {} workers",
        candidates.len(),
        config.workers
    );

    let workers = Arc::new(Semaphore::new(config.workers.max(1)));
    let mut tasks = JoinSet::new();
    let mut outcomes: Vec<Option<ProbeOutcome>> = vec![None; candidates.len()];

    for (index, url) in candidates.into_iter().enumerate() {
        let permit = select! {
            biased;
            () = ct.cancelled() => {
                tasks.abort_all();
                bail!("Probing interrupted");
            }
            p = workers.clone().acquire_owned() => p.context("Worker pool closed")?
        };
        let probe = probe.clone();

        tasks.spawn(async move {
            let _permit = permit;
            let report = probe_candidate(&*probe, &url, &config).await;
            (index, ProbeOutcome { url, report })
        });

        // Reap finished probes while still queueing so progress keeps moving
        while let Some(done) = tasks.try_join_next() {
            let (index, outcome) = done.context("Probe task panicked")?;
            outcomes[index] = Some(outcome);
            progress.inc(1);
        }
    }

    while let Some(done) = select! {
        biased;
        () = ct.cancelled() => {
            tasks.abort_all();
            bail!("Probing interrupted");
        }
        d = tasks.join_next() => d
    } {
        let (index, outcome) = done.context("Probe task panicked")?;
        outcomes[index] = Some(outcome);
        progress.inc(1);
    }

    Ok(outcomes.into_iter().flatten().collect())
}

#[cfg(test)]
mod tests {
    use std::{
        collections::{HashMap, VecDeque},
        sync::{
            Mutex,
            atomic::{AtomicUsize, Ordering},
        },
    };

    use anyhow::anyhow;
    use tokio::{
        io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
        net::TcpListener,
        time::Instant,
    };

    use super::*;

    #[derive(Debug, Clone, Copy)]
    enum Reply {
        Status(u16),
        Transport,
        Hang,
    }

    /// Replays a script of replies per URL and per method
    #[derive(Default)]
    struct Scripted {
        head: Mutex<HashMap<String, VecDeque<Reply>>>,
        get: Mutex<HashMap<String, VecDeque<Reply>>>,
        head_calls: AtomicUsize,
        get_calls: AtomicUsize,
        in_flight: AtomicUsize,
        peak_in_flight: AtomicUsize,
    }

    impl Scripted {
        fn head(self, url: &str, replies: &[Reply]) -> Self {
            self.head
                .lock()
                .unwrap()
                .insert(url.to_string(), replies.iter().copied().collect());
            self
        }

        fn get(self, url: &str, replies: &[Reply]) -> Self {
            self.get
                .lock()
                .unwrap()
                .insert(url.to_string(), replies.iter().copied().collect());
            self
        }

        async fn reply(
            &self,
            script: &Mutex<HashMap<String, VecDeque<Reply>>>,
            url: &str,
        ) -> Result<StatusCode> {
            let reply = script
                .lock()
                .unwrap()
                .get_mut(url)
                .and_then(VecDeque::pop_front)
                .unwrap_or(Reply::Status(404));

            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak_in_flight.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(100)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            match reply {
                Reply::Status(code) => Ok(StatusCode::from_u16(code).unwrap()),
                Reply::Transport => Err(anyhow!("connection refused")),
                Reply::Hang => std::future::pending().await,
            }
        }
    }

    impl LinkProbe for Scripted {
        async fn head_status(&self, url: &str) -> Result<StatusCode> {
            self.head_calls.fetch_add(1, Ordering::SeqCst);
            self.reply(&self.head, url).await
        }

        async fn get_status(&self, url: &str) -> Result<StatusCode> {
            self.get_calls.fetch_add(1, Ordering::SeqCst);
            self.reply(&self.get, url).await
        }
    }

    const URL: &str = "https://mirror.example/premium7/mono.m3u8";

    async fn probe_once(probe: &Scripted) -> ProbeReport {
        probe_candidate(probe, URL, &ProbeConfig::default()).await
    }

    #[tokio::test(start_paused = true)]
    async fn live_on_first_attempt() {
        let probe = Scripted::default().head(URL, &[Reply::Status(200)]);
        let report = probe_once(&probe).await;

        assert_eq!(
            report,
            ProbeReport {
                verdict: Verdict::Live,
                attempts: 1,
                backoffs: 0
            }
        );
        assert_eq!(probe.get_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limited_then_live_on_last_attempt() {
        let probe = Scripted::default().head(
            URL,
            &[
                Reply::Status(429),
                Reply::Status(429),
                Reply::Status(429),
                Reply::Status(429),
                Reply::Status(200),
            ],
        );

        let started = Instant::now();
        let report = probe_once(&probe).await;

        assert_eq!(report.verdict, Verdict::Live);
        assert_eq!(report.attempts, 5);
        assert_eq!(report.backoffs, 4);
        assert!(started.elapsed() >= DEFAULT_BACKOFF * 4);
        assert_eq!(probe.head_calls.load(Ordering::SeqCst), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn not_found_is_dead_immediately() {
        let probe = Scripted::default().head(URL, &[Reply::Status(404), Reply::Status(200)]);

        let started = Instant::now();
        let report = probe_once(&probe).await;

        assert_eq!(
            report,
            ProbeReport {
                verdict: Verdict::Dead,
                attempts: 1,
                backoffs: 0
            }
        );
        assert!(started.elapsed() < DEFAULT_BACKOFF);
    }

    #[tokio::test(start_paused = true)]
    async fn transport_error_is_dead_without_retry() {
        let probe = Scripted::default().head(URL, &[Reply::Transport; 5]);
        let report = probe_once(&probe).await;

        assert_eq!(report.verdict, Verdict::Dead);
        assert_eq!(report.attempts, 1);
        assert_eq!(probe.head_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn get_transport_error_is_dead() {
        let probe = Scripted::default()
            .head(URL, &[Reply::Status(405)])
            .get(URL, &[Reply::Transport]);
        let report = probe_once(&probe).await;

        assert_eq!(report.verdict, Verdict::Dead);
        assert_eq!(report.attempts, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn falls_back_to_get() {
        let probe = Scripted::default()
            .head(URL, &[Reply::Status(403)])
            .get(URL, &[Reply::Status(200)]);
        let report = probe_once(&probe).await;

        assert_eq!(report.verdict, Verdict::Live);
        assert_eq!(report.attempts, 1);
        assert_eq!(probe.get_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_get_moves_to_next_attempt() {
        let probe = Scripted::default()
            .head(URL, &[Reply::Status(500), Reply::Status(200)])
            .get(URL, &[Reply::Status(503)]);
        let report = probe_once(&probe).await;

        assert_eq!(report.verdict, Verdict::Live);
        assert_eq!(report.attempts, 2);
        assert_eq!(report.backoffs, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_attempts_are_indeterminate() {
        let probe = Scripted::default().head(URL, &[Reply::Status(429); 5]);
        let report = probe_once(&probe).await;

        assert_eq!(report.verdict, Verdict::Indeterminate);
        assert_eq!(report.attempts, 5);
        assert!(!report.verdict.is_live());
    }

    #[tokio::test(start_paused = true)]
    async fn respects_configured_attempts() {
        let probe = Scripted::default().head(URL, &[Reply::Status(500); 5]);
        let config = ProbeConfig {
            max_attempts: 2,
            ..ProbeConfig::default()
        };
        let report = probe_candidate(&probe, URL, &config).await;

        assert_eq!(report.verdict, Verdict::Indeterminate);
        assert_eq!(report.attempts, 2);
        assert_eq!(probe.get_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn hanging_request_times_out_as_dead() {
        let probe = Scripted::default().head(URL, &[Reply::Hang]);

        let started = Instant::now();
        let report = probe_once(&probe).await;

        assert_eq!(report.verdict, Verdict::Dead);
        assert_eq!(report.attempts, 1);
        assert!(started.elapsed() >= DEFAULT_REQUEST_TIMEOUT);
    }

    #[tokio::test(start_paused = true)]
    async fn pool_correlates_outcomes_and_bounds_concurrency() {
        let candidates = (0..40)
            .map(|i| format!("https://mirror.example/premium{i}/mono.m3u8"))
            .collect::<Vec<_>>();

        // Every third candidate is live; early ones are slowed down by rate limiting
        let mut probe = Scripted::default();
        for (i, url) in candidates.iter().enumerate() {
            let replies: &[Reply] = match i % 3 {
                0 if i < 10 => &[Reply::Status(429), Reply::Status(200)],
                0 => &[Reply::Status(200)],
                _ => &[Reply::Status(404)],
            };
            probe = probe.head(url, replies);
        }
        let probe = Arc::new(probe);

        let outcomes = probe_all(
            probe.clone(),
            candidates.clone(),
            ProbeConfig::default(),
            &ProgressBar::hidden(),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        assert_eq!(
            outcomes.iter().map(|o| o.url.clone()).collect::<Vec<_>>(),
            candidates
        );
        for (i, outcome) in outcomes.iter().enumerate() {
            assert_eq!(outcome.report.verdict.is_live(), i % 3 == 0, "{}", outcome.url);
        }
        let peak = probe.peak_in_flight.load(Ordering::SeqCst);
        assert!(peak <= DEFAULT_WORKERS, "peak {peak}");
        assert!(peak > 1, "probes never overlapped");
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_pool_errors() {
        let ct = CancellationToken::new();
        ct.cancel();

        let result = probe_all(
            Arc::new(Scripted::default()),
            vec![URL.to_string()],
            ProbeConfig::default(),
            &ProgressBar::hidden(),
            &ct,
        )
        .await;

        assert!(result.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn single_live_mirror_ends_up_alone_in_links_file() {
        use std::collections::BTreeSet;

        use crate::{aggregate::write_links, candidates::{UrlTemplate, generate_candidates}};

        let ids = BTreeSet::from(["7".to_string()]);
        let candidates = generate_candidates(&ids, &UrlTemplate::defaults());
        assert_eq!(candidates.len(), 5);

        let mut probe = Scripted::default();
        for (i, url) in candidates.iter().enumerate() {
            let code = if i == 2 { 200 } else { 404 };
            probe = probe.head(url, &[Reply::Status(code)]);
        }

        let outcomes = probe_all(
            Arc::new(probe),
            candidates.clone(),
            ProbeConfig::default(),
            &ProgressBar::hidden(),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("links.m3u8");
        assert_eq!(write_links(&path, &outcomes).await.unwrap(), 1);
        assert_eq!(std::fs::read_to_string(&path).unwrap(), candidates[2]);
    }

    /// Answers each request with the status code named in its path, `/200/...` etc.
    /// `HEAD /405/...` answers 405 but `GET /405/...` answers 200.
    async fn spawn_status_server() -> String {
        let socket = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();

        tokio::spawn(async move {
            loop {
                let (mut stream, _addr) = socket.accept().await.unwrap();
                tokio::spawn(async move {
                    let mut reader = BufReader::new(&mut stream);
                    let mut req = String::new();
                    reader.read_line(&mut req).await.unwrap();
                    loop {
                        let mut header = String::new();
                        let read = reader.read_line(&mut header).await.unwrap();
                        if read == 0 || header == "\r\n" {
                            break;
                        }
                    }

                    let mut parts = req.split_whitespace();
                    let method = parts.next().unwrap_or_default().to_string();
                    let code = parts
                        .next()
                        .and_then(|path| path.split('/').nth(1))
                        .and_then(|c| c.parse::<u16>().ok())
                        .unwrap_or(404);
                    let code = if code == 405 && method == "GET" { 200 } else { code };

                    stream
                        .write_all(
                            format!(
                                "HTTP/1.1 {code} Status\r\ncontent-length: 0\r\nconnection: close\r\n\r\n"
                            )
                            .as_bytes(),
                        )
                        .await
                        .ok();
                });
            }
        });

        format!("http://{addr}")
    }

    #[tokio::test]
    async fn reqwest_transport_against_local_server() {
        let base = spawn_status_server().await;
        let client = reqwest::Client::builder().no_proxy().build().unwrap();
        let config = ProbeConfig::default();

        let live = probe_candidate(&client, &format!("{base}/200/mono.m3u8"), &config).await;
        assert_eq!(live.verdict, Verdict::Live);

        let dead = probe_candidate(&client, &format!("{base}/404/mono.m3u8"), &config).await;
        assert_eq!(dead.verdict, Verdict::Dead);

        let via_get = probe_candidate(&client, &format!("{base}/405/mono.m3u8"), &config).await;
        assert_eq!(via_get.verdict, Verdict::Live);
    }

    #[tokio::test]
    async fn reqwest_connection_refused_is_dead() {
        // Bind then drop to get a port nothing listens on
        let addr = TcpListener::bind("127.0.0.1:0")
            .await
            .unwrap()
            .local_addr()
            .unwrap();
        let client = reqwest::Client::builder().no_proxy().build().unwrap();

        let report = probe_candidate(
            &client,
            &format!("http://{addr}/200/mono.m3u8"),
            &ProbeConfig::default(),
        )
        .await;
        assert_eq!(report.verdict, Verdict::Dead);
        assert_eq!(report.attempts, 1);
    }
}
