//! Retrying HTTP fetcher for the experiment server
//!
//! Every request is retried indefinitely with a fixed backoff until it
//! succeeds or the fetcher is cancelled. HTTP 406 is not a failure: the
//! server uses it to say "call move-to-next before fetching the config
//! again", and the fetcher hands that back to the caller as
//! [`FetchOutcome::AdvanceRequired`].
//!
//! Whether 406 is a deliberate protocol signal or a workaround on the server
//! side cannot be decided from this side of the wire. It is kept as a
//! contract assumption about the experiment server.

use expflow_common::events::{EventBus, FlowEvent};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Status code the experiment server uses to request an explicit advance
pub const ADVANCE_REQUIRED_STATUS: u16 = 406;

const USER_AGENT: &str = concat!("expflow-ctl/", env!("CARGO_PKG_VERSION"));

/// Fetcher errors
///
/// Transport failures never show up here; they are retried.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("Request cancelled")]
    Cancelled,

    #[error("HTTP client error: {0}")]
    Client(String),
}

/// HTTP verb for a request
///
/// State-changing endpoints (advance, move-to-block, shutdown) must use POST.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestMethod {
    Get,
    Post,
}

impl std::fmt::Display for RequestMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RequestMethod::Get => write!(f, "GET"),
            RequestMethod::Post => write!(f, "POST"),
        }
    }
}

/// Successful outcome of a fetch
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchOutcome {
    /// Raw response body, to be decoded by the caller
    Payload(String),
    /// Server answered 406: advance first, then repeat the request
    AdvanceRequired,
}

/// Experiment server client with unbounded fixed-delay retries
pub struct RetryingFetcher {
    http_client: reqwest::Client,
    base_url: String,
    retry_delay: Duration,
    retry_count: AtomicU64,
    cancel_token: CancellationToken,
    event_bus: Option<EventBus>,
    /// Serializes requests: at most one is in flight at any time
    request_lock: Mutex<()>,
}

impl RetryingFetcher {
    /// Create a fetcher for the server at `base_url`
    ///
    /// # Arguments
    /// * `base_url` - Server root, e.g. `http://127.0.0.1:5000`
    /// * `retry_delay` - Fixed wait between attempts
    /// * `request_timeout` - Per-attempt timeout
    pub fn new(
        base_url: impl Into<String>,
        retry_delay: Duration,
        request_timeout: Duration,
    ) -> Result<Self, FetchError> {
        let http_client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(request_timeout)
            .build()
            .map_err(|e| FetchError::Client(e.to_string()))?;

        Ok(Self {
            http_client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            retry_delay,
            retry_count: AtomicU64::new(0),
            cancel_token: CancellationToken::new(),
            event_bus: None,
            request_lock: Mutex::new(()),
        })
    }

    /// Broadcast a `FetchRetry` event for every failed attempt
    pub fn with_event_bus(mut self, event_bus: EventBus) -> Self {
        self.event_bus = Some(event_bus);
        self
    }

    /// Stop any retry loop in progress and refuse further requests
    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }

    /// Failed attempts since the last success
    pub fn retry_count(&self) -> u64 {
        self.retry_count.load(Ordering::Relaxed)
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, endpoint: &str) -> String {
        format!("{}/{}", self.base_url, endpoint.trim_start_matches('/'))
    }

    fn request(&self, method: RequestMethod, url: &str) -> reqwest::RequestBuilder {
        match method {
            RequestMethod::Get => self.http_client.get(url),
            RequestMethod::Post => self.http_client.post(url),
        }
    }

    /// Perform `method endpoint` until it succeeds or the fetcher is cancelled
    ///
    /// Transport errors, timeouts and non-success statuses other than 406
    /// are logged, counted and retried after the fixed delay. A success
    /// resets the retry counter.
    pub async fn fetch(
        &self,
        endpoint: &str,
        method: RequestMethod,
    ) -> Result<FetchOutcome, FetchError> {
        let _in_flight = self.request_lock.lock().await;
        let url = self.url(endpoint);
        debug!(method = %method, url = %url, "Request");

        loop {
            if self.cancel_token.is_cancelled() {
                return Err(FetchError::Cancelled);
            }

            let send = self.request(method, &url).send();
            let response = tokio::select! {
                _ = self.cancel_token.cancelled() => return Err(FetchError::Cancelled),
                response = send => response,
            };

            let reason = match response {
                Ok(response) if response.status().as_u16() == ADVANCE_REQUIRED_STATUS => {
                    info!(endpoint = %endpoint, "Server requires an advance before this request");
                    return Ok(FetchOutcome::AdvanceRequired);
                }
                Ok(response) if response.status().is_success() => match response.text().await {
                    Ok(body) => {
                        self.retry_count.store(0, Ordering::Relaxed);
                        return Ok(FetchOutcome::Payload(body));
                    }
                    Err(e) => format!("reading body failed: {}", e),
                },
                Ok(response) => format!("HTTP {}", response.status()),
                Err(e) => e.to_string(),
            };

            let attempt = self.retry_count.fetch_add(1, Ordering::Relaxed) + 1;
            warn!(
                url = %url,
                attempt,
                reason = %reason,
                retry_in_ms = self.retry_delay.as_millis() as u64,
                "Request failed, retrying"
            );
            if let Some(bus) = &self.event_bus {
                bus.emit_lossy(FlowEvent::FetchRetry {
                    endpoint: endpoint.to_string(),
                    attempt,
                    reason,
                    timestamp: expflow_common::time::now(),
                });
            }

            self.backoff().await?;
        }
    }

    /// Wait one retry interval, or fail early if the fetcher is cancelled
    pub async fn backoff(&self) -> Result<(), FetchError> {
        tokio::select! {
            _ = self.cancel_token.cancelled() => Err(FetchError::Cancelled),
            _ = tokio::time::sleep(self.retry_delay) => Ok(()),
        }
    }

    /// Fire a single request without retries, reporting only whether it succeeded
    ///
    /// Used for fire-and-forget calls such as shutdown.
    pub async fn send_once(&self, endpoint: &str, method: RequestMethod) -> bool {
        let _in_flight = self.request_lock.lock().await;
        let url = self.url(endpoint);

        match self.request(method, &url).send().await {
            Ok(response) if response.status().is_success() => true,
            Ok(response) => {
                warn!(url = %url, status = %response.status(), "Fire-and-forget request rejected");
                false
            }
            Err(e) => {
                warn!(url = %url, error = %e, "Fire-and-forget request failed");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_url_joins_without_double_slash() {
        let fetcher = RetryingFetcher::new(
            "http://127.0.0.1:5000/",
            Duration::from_millis(10),
            Duration::from_secs(1),
        )
        .unwrap();
        assert_eq!(fetcher.url("api/config"), "http://127.0.0.1:5000/api/config");
        assert_eq!(fetcher.url("/api/config"), "http://127.0.0.1:5000/api/config");
        assert_eq!(fetcher.retry_count(), 0);
    }

    #[tokio::test]
    async fn test_cancelled_fetcher_refuses_requests() {
        let fetcher = RetryingFetcher::new(
            "http://127.0.0.1:9",
            Duration::from_millis(10),
            Duration::from_millis(100),
        )
        .unwrap();
        fetcher.cancel();

        let result = fetcher.fetch("api/active", RequestMethod::Get).await;
        assert!(matches!(result, Err(FetchError::Cancelled)));
    }
}
