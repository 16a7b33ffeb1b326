//! Remote config source: the experiment server
//!
//! Endpoint semantics:
//! - `GET api/active` - is a session active on the server
//! - `GET api/global-data` - session summary
//! - `GET api/config` - current block config, 406 if the server wants a
//!   move-to-next first
//! - `POST api/move-to-next` - advance, returns the next block or the end marker
//! - `POST api/move-to-block/{index}` - jump to a block (editor/debug)
//! - `POST api/shutdown` - fire-and-forget, sent once the session is over

use super::{ConfigSource, SourceError};
use crate::block::{BlockConfig, NextBlock, SessionSummary};
use crate::fetcher::{FetchOutcome, RequestMethod, RetryingFetcher};
use async_trait::async_trait;
use expflow_common::events::EventBus;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Experiment server endpoint paths
pub mod endpoints {
    pub const ACTIVE: &str = "api/active";
    pub const GLOBAL_DATA: &str = "api/global-data";
    pub const CONFIG: &str = "api/config";
    pub const MOVE_TO_NEXT: &str = "api/move-to-next";
    pub const SHUTDOWN: &str = "api/shutdown";

    pub fn move_to_block(index: u32) -> String {
        format!("api/move-to-block/{}", index)
    }
}

/// Config source that talks to the experiment server
pub struct RemoteSource {
    fetcher: RetryingFetcher,
    /// Jump the server to this block instead of joining the active session
    start_from_block: Option<u32>,
    /// Set once the session on the server has been joined
    joined: AtomicBool,
    advance_calls: AtomicU64,
}

impl RemoteSource {
    pub fn new(
        server_url: &str,
        retry_delay: Duration,
        request_timeout: Duration,
    ) -> Result<Self, SourceError> {
        let fetcher = RetryingFetcher::new(server_url, retry_delay, request_timeout)?;
        Ok(Self::with_fetcher(fetcher))
    }

    pub fn with_fetcher(fetcher: RetryingFetcher) -> Self {
        Self {
            fetcher,
            start_from_block: None,
            joined: AtomicBool::new(false),
            advance_calls: AtomicU64::new(0),
        }
    }

    pub fn with_event_bus(mut self, event_bus: EventBus) -> Self {
        self.fetcher = self.fetcher.with_event_bus(event_bus);
        self
    }

    pub fn with_start_block(mut self, start_from_block: Option<u32>) -> Self {
        self.start_from_block = start_from_block;
        self
    }

    pub fn fetcher(&self) -> &RetryingFetcher {
        &self.fetcher
    }

    /// Number of `move-to-next` requests issued so far
    pub fn advance_calls(&self) -> u64 {
        self.advance_calls.load(Ordering::Relaxed)
    }

    /// Ask whether the server has an active session
    ///
    /// Accepts a bare JSON boolean or an object with an `active` field. Any
    /// other successful body counts as active.
    pub async fn is_session_active(&self) -> Result<bool, SourceError> {
        match self.fetcher.fetch(endpoints::ACTIVE, RequestMethod::Get).await? {
            FetchOutcome::Payload(body) => Ok(match serde_json::from_str::<Value>(&body) {
                Ok(Value::Bool(active)) => active,
                Ok(Value::Object(map)) => map.get("active").and_then(Value::as_bool).unwrap_or(true),
                _ => true,
            }),
            FetchOutcome::AdvanceRequired => Ok(true),
        }
    }

    /// Post `move-to-next` and interpret the answer
    async fn post_advance(&self) -> Result<NextBlock, SourceError> {
        self.advance_calls.fetch_add(1, Ordering::Relaxed);
        let body = self
            .expect_payload(endpoints::MOVE_TO_NEXT, RequestMethod::Post)
            .await?;
        let next: BlockConfig = decode(endpoints::MOVE_TO_NEXT, &body)?;

        if next.is_end_marker() {
            info!("Experiment server reports end of session");
            self.shutdown().await;
            Ok(NextBlock::EndOfSession)
        } else {
            debug!(name = %next.name, "Server moved to next block");
            Ok(NextBlock::Block(next))
        }
    }

    /// Tell the server the session is over; a single attempt, result ignored
    pub async fn shutdown(&self) {
        if self
            .fetcher
            .send_once(endpoints::SHUTDOWN, RequestMethod::Post)
            .await
        {
            info!("Experiment server shutdown requested");
        }
    }

    async fn expect_payload(
        &self,
        endpoint: &str,
        method: RequestMethod,
    ) -> Result<String, SourceError> {
        match self.fetcher.fetch(endpoint, method).await? {
            FetchOutcome::Payload(body) => Ok(body),
            FetchOutcome::AdvanceRequired => Err(SourceError::Source(format!(
                "Unexpected advance-required status from {}",
                endpoint
            ))),
        }
    }
}

fn decode<T: DeserializeOwned>(endpoint: &str, body: &str) -> Result<T, SourceError> {
    serde_json::from_str(body).map_err(|e| SourceError::Decode {
        endpoint: endpoint.to_string(),
        message: e.to_string(),
    })
}

#[async_trait]
impl ConfigSource for RemoteSource {
    fn kind(&self) -> &'static str {
        "remote"
    }

    async fn get_summary(&self) -> Result<SessionSummary, SourceError> {
        // Repeated summary requests must not move the server again
        match self.start_from_block {
            _ if self.joined.load(Ordering::Acquire) => {}
            Some(index) => {
                info!(index, "Forcing experiment server to start block");
                self.move_to_block(index).await?;
            }
            None => {
                while !self.is_session_active().await? {
                    warn!("No active session on the experiment server, waiting");
                    self.fetcher.backoff().await?;
                }
            }
        }
        self.joined.store(true, Ordering::Release);

        let body = self
            .expect_payload(endpoints::GLOBAL_DATA, RequestMethod::Get)
            .await?;
        let summary: SessionSummary = decode(endpoints::GLOBAL_DATA, &body)?;
        info!(
            participant_index = summary.participant_index,
            total_block_count = summary.total_block_count,
            "Received session data"
        );
        Ok(summary)
    }

    async fn get_current_config(&self) -> Result<BlockConfig, SourceError> {
        loop {
            match self.fetcher.fetch(endpoints::CONFIG, RequestMethod::Get).await? {
                FetchOutcome::Payload(body) => {
                    let config: BlockConfig = decode(endpoints::CONFIG, &body)?;
                    if config.is_end_marker() {
                        return Err(SourceError::SessionComplete);
                    }
                    return Ok(config);
                }
                FetchOutcome::AdvanceRequired => {
                    info!("Server moving to next");
                    if let NextBlock::EndOfSession = self.post_advance().await? {
                        return Err(SourceError::SessionComplete);
                    }
                }
            }
        }
    }

    async fn advance_to_next_config(&self) -> Result<NextBlock, SourceError> {
        match self.post_advance().await? {
            NextBlock::EndOfSession => Ok(NextBlock::EndOfSession),
            NextBlock::Block(_) => match self.get_current_config().await {
                Ok(config) => Ok(NextBlock::Block(config)),
                Err(SourceError::SessionComplete) => Ok(NextBlock::EndOfSession),
                Err(e) => Err(e),
            },
        }
    }

    async fn move_to_block(&self, index: u32) -> Result<(), SourceError> {
        self.expect_payload(&endpoints::move_to_block(index), RequestMethod::Post)
            .await?;
        Ok(())
    }

    fn retry_count(&self) -> u64 {
        self.fetcher.retry_count()
    }

    fn cancel_pending(&self) {
        self.fetcher.cancel();
    }
}
