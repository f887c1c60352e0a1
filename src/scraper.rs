//! Fetch coordinator: a bounded worker pool over the deduplicating queue.
//!
//! Workers take tasks, wait on a shared token-bucket limiter, fetch, store
//! every response verbatim, and feed supported documents back through the
//! rewriters to discover more URLs. Redirects are followed manually so that
//! every hop of the chain is archived under the URL it was fetched for.

use std::collections::HashMap;
use std::io::Write;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use thiserror::Error;
use tokio::task::JoinSet;
use url::Url;

use crate::queue::{Queue, Task};
use crate::rewrite::{self, RewriteAction, RewriteError, UrlRef};
use crate::store::{DocumentMetadata, HeaderValues, Store, StoreError};
use crate::urlkey;

/// Process-global limiter shared by every worker.
pub type Limiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// Admission predicate: decides whether a discovered URL joins the crawl.
pub type FollowUrl = dyn Fn(&Url) -> bool + Send + Sync;

/// A dial target for address remapping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostPort {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone)]
pub struct ScraperConfig {
    /// Worker pool size.
    pub workers: usize,
    /// Token-bucket refill rate, requests per second.
    pub requests_per_second: u32,
    /// Optional `User-Agent` header.
    pub user_agent: Option<String>,
    /// Fetch `https` URLs over plain HTTP, archiving them under the
    /// original URL.
    pub strip_https: bool,
    /// Dial remapping table, keyed by lowercase `host:port`. The stored URL
    /// and the `Host` header keep the original authority.
    pub remap_addresses: HashMap<String, HostPort>,
    /// Redirect-chain depth limit: the most responses a task processes
    /// before giving up on the chain.
    pub redirect_limit: usize,
    /// Per-request timeout.
    pub timeout_secs: u64,
}

impl Default for ScraperConfig {
    fn default() -> Self {
        Self {
            workers: 10,
            requests_per_second: 10,
            user_agent: None,
            strip_https: false,
            remap_addresses: HashMap::new(),
            redirect_limit: 10,
            timeout_secs: 30,
        }
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("building http client: {0}")]
    ClientBuild(#[source] reqwest::Error),
    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("stopped after {0} redirects")]
    TooManyRedirects(usize),
    #[error("redirect location is invalid: {0}")]
    BadLocation(String),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Rewrite(#[from] RewriteError),
}

pub struct Scraper {
    client: reqwest::Client,
    store: Arc<Store>,
    limiter: Arc<Limiter>,
    follow: Arc<FollowUrl>,
    config: ScraperConfig,
}

impl Scraper {
    pub fn new(
        store: Arc<Store>,
        follow: Arc<FollowUrl>,
        config: ScraperConfig,
    ) -> Result<Self, FetchError> {
        let client = reqwest::Client::builder()
            // The redirect chain is followed manually so that every hop can
            // be archived.
            .redirect(reqwest::redirect::Policy::none())
            .timeout(Duration::from_secs(config.timeout_secs))
            .connect_timeout(Duration::from_secs(30))
            .pool_max_idle_per_host(64)
            .pool_idle_timeout(Duration::from_secs(90))
            .tcp_keepalive(Duration::from_secs(60))
            .tcp_nodelay(true)
            .build()
            .map_err(FetchError::ClientBuild)?;

        let rate = NonZeroU32::new(config.requests_per_second).unwrap_or(NonZeroU32::MIN);
        let limiter = Arc::new(RateLimiter::direct(
            Quota::per_second(rate).allow_burst(NonZeroU32::MIN),
        ));

        Ok(Self {
            client,
            store,
            limiter,
            follow,
            config,
        })
    }

    /// Crawls the transitive closure of the initial URLs under the
    /// admission predicate. Returns when the queue is quiescent.
    pub async fn run(self: Arc<Self>, initial_urls: Vec<Url>) {
        let initial = initial_urls
            .into_iter()
            .map(|u| {
                let key = urlkey::key(&u);
                Task {
                    download_url: u,
                    key,
                }
            })
            .collect();
        let queue = Queue::start(initial);

        let mut workers = JoinSet::new();
        for worker in 0..self.config.workers.max(1) {
            let scraper = Arc::clone(&self);
            let queue = Arc::clone(&queue);
            workers.spawn(async move {
                while let Some(task) = queue.take().await {
                    if let Err(error) = scraper.scrape_task(&task, &queue).await {
                        tracing::warn!(worker, url = %task.download_url, %error, "task failed");
                    }
                    queue.done().await;
                }
            });
        }
        while workers.join_next().await.is_some() {}
    }

    /// Fetches one task, following and archiving the whole redirect chain.
    #[tracing::instrument(skip_all, fields(url = %task.download_url))]
    async fn scrape_task(&self, task: &Task, queue: &Queue) -> Result<(), FetchError> {
        self.limiter.until_ready().await;

        let mut current = task.download_url.clone();
        for _ in 0..self.config.redirect_limit {
            let started = Utc::now();
            let response = self.fetch(&current).await?;

            let next = if response.status().is_redirection() {
                match response
                    .headers()
                    .get(reqwest::header::LOCATION)
                    .and_then(|v| v.to_str().ok())
                {
                    Some(location) => Some(
                        current
                            .join(location)
                            .map_err(|e| FetchError::BadLocation(format!("{location:?}: {e}")))?,
                    ),
                    None => None,
                }
            } else {
                None
            };

            self.process_response(&current, response, started, queue)
                .await?;

            match next {
                Some(next_url) => {
                    tracing::debug!(from = %current, to = %next_url, "following redirect");
                    current = next_url;
                }
                None => return Ok(()),
            }
        }
        Err(FetchError::TooManyRedirects(self.config.redirect_limit))
    }

    /// Issues one GET, applying the transport shims. The caller keeps
    /// addressing the response by `url`; only the wire target changes.
    async fn fetch(&self, url: &Url) -> Result<reqwest::Response, FetchError> {
        let mut request_url = url.clone();
        if self.config.strip_https && request_url.scheme() == "https" {
            let _ = request_url.set_scheme("http");
        }

        let mut host_header = None;
        if !self.config.remap_addresses.is_empty() {
            if let (Some(host), Some(port)) =
                (request_url.host_str(), request_url.port_or_known_default())
            {
                let dial = format!("{}:{}", host.to_ascii_lowercase(), port);
                if let Some(target) = self.config.remap_addresses.get(&dial) {
                    host_header = Some(authority(&request_url));
                    request_url
                        .set_host(Some(&target.host))
                        .map_err(|e| FetchError::BadLocation(format!("{}: {e}", target.host)))?;
                    let _ = request_url.set_port(Some(target.port));
                }
            }
        }

        let mut request = self.client.get(request_url);
        if let Some(agent) = &self.config.user_agent {
            request = request.header(reqwest::header::USER_AGENT, agent);
        }
        if let Some(host) = host_header {
            request = request.header(reqwest::header::HOST, host);
        }
        Ok(request.send().await?)
    }

    /// Stores the response verbatim and, for supported media types, runs
    /// the stored bytes through the rewriter to discover new URLs.
    async fn process_response(
        &self,
        request_url: &Url,
        response: reqwest::Response,
        started: DateTime<Utc>,
        queue: &Queue,
    ) -> Result<(), FetchError> {
        let status = response.status();
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default();
        let media = rewrite::media_kind(content_type).ok();

        let metadata = DocumentMetadata {
            key: urlkey::key(request_url),
            download_started_time: started,
            url: request_url.to_string(),
            status: match status.canonical_reason() {
                Some(reason) => format!("{} {}", status.as_u16(), reason),
                None => status.as_u16().to_string(),
            },
            status_code: status.as_u16(),
            proto: proto_string(response.version()),
            headers: header_values(response.headers()),
            trailers: HeaderValues::new(),
        };

        let mut writer = self.store.writer()?;
        let mut buffered = media.map(|_| Vec::new());
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            writer.write_all(&chunk).map_err(StoreError::from)?;
            if let Some(buf) = buffered.as_mut() {
                buf.extend_from_slice(&chunk);
            }
        }
        writer.close(&metadata)?;
        tracing::info!(url = %request_url, status = status.as_u16(), "stored");

        let (kind, data) = match (media, buffered) {
            (Some(kind), Some(data)) => (kind, data),
            _ => return Ok(()),
        };

        // The rewriter is used purely for discovery here: collect admitted
        // URLs in document order, never modify the archived bytes.
        let mut discovered = Vec::new();
        {
            let follow: &FollowUrl = self.follow.as_ref();
            let mut callback = |url: UrlRef<'_>| -> Result<RewriteAction, RewriteError> {
                let value = url.value.trim();
                let base = if url.base.is_empty() {
                    request_url.clone()
                } else {
                    Url::parse(url.base).map_err(|e| {
                        RewriteError::Callback(format!(
                            "document {request_url} declares an unparseable base {:?}: {e}",
                            url.base
                        ))
                    })?
                };
                match base.join(value) {
                    Ok(absolute) => {
                        if follow(&absolute) {
                            discovered.push(absolute);
                        }
                    }
                    Err(error) => {
                        tracing::debug!(document = %request_url, reference = value, %error,
                            "skipping unparseable reference");
                    }
                }
                Ok(RewriteAction::Keep)
            };
            let mut sink = std::io::sink();
            rewrite::rewrite_document(kind, &data, &mut sink, &mut callback)?;
        }

        for url in discovered {
            let key = urlkey::key(&url);
            queue
                .offer(Task {
                    download_url: url,
                    key,
                })
                .await;
        }
        Ok(())
    }
}

/// `host[:port]` as it appears in a URL, with default ports elided.
fn authority(url: &Url) -> String {
    match (url.host_str(), url.port()) {
        (Some(host), Some(port)) => format!("{host}:{port}"),
        (Some(host), None) => host.to_string(),
        _ => String::new(),
    }
}

fn proto_string(version: reqwest::Version) -> String {
    match version {
        reqwest::Version::HTTP_09 => "HTTP/0.9".to_string(),
        reqwest::Version::HTTP_10 => "HTTP/1.0".to_string(),
        reqwest::Version::HTTP_11 => "HTTP/1.1".to_string(),
        reqwest::Version::HTTP_2 => "HTTP/2.0".to_string(),
        reqwest::Version::HTTP_3 => "HTTP/3.0".to_string(),
        other => format!("{other:?}"),
    }
}

/// Converts wire headers to the stored representation, grouping values
/// under canonical `Http-Header-Case` names.
fn header_values(headers: &reqwest::header::HeaderMap) -> HeaderValues {
    let mut out = HeaderValues::new();
    for name in headers.keys() {
        let values = headers
            .get_all(name)
            .iter()
            .filter_map(|v| v.to_str().ok().map(str::to_string))
            .collect();
        out.insert(canonical_header_name(name.as_str()), values);
    }
    out
}

fn canonical_header_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut upper_next = true;
    for c in name.chars() {
        if upper_next {
            out.extend(c.to_uppercase());
        } else {
            out.push(c);
        }
        upper_next = c == '-';
    }
    out
}

/// Parses a repeatable `orig_host:port|new_host:port` mapping flag.
pub fn parse_remap_mapping(mapping: &str) -> Result<(String, HostPort), String> {
    let (orig, target) = mapping
        .split_once('|')
        .ok_or_else(|| format!("address mapping {mapping:?}: '|' not found"))?;
    let (host, port) = target
        .rsplit_once(':')
        .ok_or_else(|| format!("address mapping target {target:?}: port not found"))?;
    let port = port
        .parse::<u16>()
        .map_err(|e| format!("address mapping target {target:?}: {e}"))?;
    Ok((
        orig.to_ascii_lowercase(),
        HostPort {
            host: host.to_string(),
            port,
        },
    ))
}
