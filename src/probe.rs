//! Service health probes.
//!
//! Each probe is independent: a failing control API never suppresses the
//! direct-route result and vice versa. Probes run concurrently under a
//! small worker limit and results are merged only after every probe has
//! finished or timed out.

use std::fmt;
use std::time::{Duration, Instant};

use futures::{stream, StreamExt};

const CONTROL_URL: &str = "http://127.0.0.1:9090/version";
const ECHO_URL: &str = "http://httpbin.org/ip";
const HTTP_PROXY_URL: &str = "http://127.0.0.1:7890";

/// Domains resolved by the DNS probes. All of them failing points at the
/// resolver, not the engine.
const DNS_PROBE_DOMAINS: &[&str] = &["www.google.com", "github.com", "www.baidu.com", "www.taobao.com"];

const CONTROL_TIMEOUT: Duration = Duration::from_secs(5);
const FETCH_TIMEOUT: Duration = Duration::from_secs(10);
const PROBE_CONCURRENCY: usize = 4;

/// One thing the prober can check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeTarget {
    /// The engine's local control API version route
    ControlApi,
    /// The echo endpoint without any proxy, as a connectivity baseline
    DirectRoute,
    /// The echo endpoint through the local HTTP proxy listener
    ProxiedRoute,
    /// One domain resolved through the OS resolver
    Dns(String),
}

impl fmt::Display for ProbeTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProbeTarget::ControlApi => write!(f, "control-api"),
            ProbeTarget::DirectRoute => write!(f, "direct-route"),
            ProbeTarget::ProxiedRoute => write!(f, "proxied-route"),
            ProbeTarget::Dns(domain) => write!(f, "dns:{domain}"),
        }
    }
}

/// Outcome of a single probe. Ephemeral, never persisted.
#[derive(Debug, Clone)]
pub struct ProbeResult {
    pub target: ProbeTarget,
    pub reachable: bool,
    pub latency: Duration,
    pub detail: Option<String>,
}

/// Issues health probes against a live engine instance.
///
/// Independent of the lifecycle calls; may run at any time.
pub struct Prober {
    control_url: String,
    echo_url: String,
    proxy_url: String,
}

impl Prober {
    pub fn new() -> Self {
        Self {
            control_url: CONTROL_URL.to_string(),
            echo_url: ECHO_URL.to_string(),
            proxy_url: HTTP_PROXY_URL.to_string(),
        }
    }

    /// Prober against custom endpoints.
    pub fn with_endpoints(control_url: String, echo_url: String, proxy_url: String) -> Self {
        Self {
            control_url,
            echo_url,
            proxy_url,
        }
    }

    /// The full default probe set.
    pub fn default_targets() -> Vec<ProbeTarget> {
        let mut targets = vec![
            ProbeTarget::ControlApi,
            ProbeTarget::DirectRoute,
            ProbeTarget::ProxiedRoute,
        ];
        targets.extend(
            DNS_PROBE_DOMAINS
                .iter()
                .map(|d| ProbeTarget::Dns(d.to_string())),
        );
        targets
    }

    /// Run every probe and aggregate the results.
    pub async fn probe_all(&self, targets: Vec<ProbeTarget>) -> Vec<ProbeResult> {
        stream::iter(targets.into_iter().map(|target| self.probe(target)))
            .buffer_unordered(PROBE_CONCURRENCY)
            .collect()
            .await
    }

    /// Run one probe.
    pub async fn probe(&self, target: ProbeTarget) -> ProbeResult {
        let started = Instant::now();

        let outcome = match &target {
            ProbeTarget::ControlApi => {
                http_get(&self.control_url, CONTROL_TIMEOUT, None).await
            }
            ProbeTarget::DirectRoute => http_get(&self.echo_url, FETCH_TIMEOUT, None).await,
            ProbeTarget::ProxiedRoute => {
                http_get(&self.echo_url, FETCH_TIMEOUT, Some(&self.proxy_url)).await
            }
            ProbeTarget::Dns(domain) => resolve(domain).await,
        };

        let latency = started.elapsed();
        match outcome {
            Ok(()) => {
                log::debug!("probe {target} ok in {latency:?}");
                ProbeResult {
                    target,
                    reachable: true,
                    latency,
                    detail: None,
                }
            }
            Err(detail) => {
                log::debug!("probe {target} failed: {detail}");
                ProbeResult {
                    target,
                    reachable: false,
                    latency,
                    detail: Some(detail),
                }
            }
        }
    }
}

impl Default for Prober {
    fn default() -> Self {
        Self::new()
    }
}

/// GET `url` and require a success status. `proxy` routes the request
/// through the given HTTP proxy; without one the request bypasses any
/// environment proxy settings so the baseline is genuinely direct.
async fn http_get(url: &str, timeout: Duration, proxy: Option<&str>) -> Result<(), String> {
    let mut builder = reqwest::Client::builder().timeout(timeout);
    builder = match proxy {
        Some(proxy_url) => {
            builder.proxy(reqwest::Proxy::all(proxy_url).map_err(|e| e.to_string())?)
        }
        None => builder.no_proxy(),
    };

    let client = builder.build().map_err(|e| e.to_string())?;
    let response = client.get(url).send().await.map_err(|e| e.to_string())?;

    if response.status().is_success() {
        Ok(())
    } else {
        Err(format!("HTTP {}", response.status()))
    }
}

async fn resolve(domain: &str) -> Result<(), String> {
    let mut addrs = tokio::net::lookup_host((domain, 80))
        .await
        .map_err(|e| e.to_string())?;

    if addrs.next().is_some() {
        Ok(())
    } else {
        Err("resolver returned no addresses".to_string())
    }
}
