//! Config sources: where block configuration comes from
//!
//! Two implementations share the [`ConfigSource`] trait:
//! - [`LocalSource`]: an ordered list loaded once from a JSON payload
//! - [`RemoteSource`]: the experiment server, through the retrying fetcher
//!
//! The kind is chosen from configuration when the controller is built and
//! never changes afterwards.

mod local;
mod remote;

pub use local::LocalSource;
pub use remote::{endpoints, RemoteSource};

use crate::block::{BlockConfig, NextBlock, SessionSummary};
use crate::fetcher::FetchError;
use async_trait::async_trait;
use expflow_common::config::SourceConfig;
use expflow_common::events::EventBus;
use expflow_common::time;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;

/// Config source errors
#[derive(Debug, Error)]
pub enum SourceError {
    /// The request was abandoned because the session is shutting down
    #[error("Request cancelled")]
    Cancelled,

    /// The source has no more blocks
    #[error("Session complete: no more blocks")]
    SessionComplete,

    /// A payload arrived but did not have the expected shape
    #[error("Malformed payload from {endpoint}: {message}")]
    Decode { endpoint: String, message: String },

    /// Loading or addressing the source failed
    #[error("Config source error: {0}")]
    Source(String),
}

impl From<FetchError> for SourceError {
    fn from(err: FetchError) -> Self {
        match err {
            FetchError::Cancelled => SourceError::Cancelled,
            FetchError::Client(msg) => SourceError::Source(msg),
        }
    }
}

/// Origin of block configuration, as seen by the flow controller
#[async_trait]
pub trait ConfigSource: Send + Sync {
    /// Short identifier for logs ("local", "remote")
    fn kind(&self) -> &'static str;

    /// Session-wide summary (participant index, block count)
    async fn get_summary(&self) -> Result<SessionSummary, SourceError>;

    /// Configuration of the block the source currently points at
    async fn get_current_config(&self) -> Result<BlockConfig, SourceError>;

    /// Move to the next block and return its configuration
    ///
    /// Returns [`NextBlock::EndOfSession`] when the source is exhausted or
    /// reports the end sentinel.
    async fn advance_to_next_config(&self) -> Result<NextBlock, SourceError>;

    /// Point the source at a specific block index (editor/debug use)
    async fn move_to_block(&self, index: u32) -> Result<(), SourceError>;

    /// Failed attempts since the last successful request
    fn retry_count(&self) -> u64 {
        0
    }

    /// Abandon any request in progress; called when the session ends
    fn cancel_pending(&self) {}
}

/// Build the source described by `config`
///
/// Relative local config paths are resolved against `base_dir`.
pub fn build_source(
    config: &SourceConfig,
    event_bus: &EventBus,
    base_dir: &Path,
) -> Result<Arc<dyn ConfigSource>, SourceError> {
    match config {
        SourceConfig::Local {
            participant_index,
            config_file,
        } => {
            let path = if config_file.is_absolute() {
                config_file.clone()
            } else {
                base_dir.join(config_file)
            };
            Ok(Arc::new(LocalSource::from_file(&path, *participant_index)?))
        }
        SourceConfig::Remote {
            server_url,
            retry_delay_ms,
            request_timeout_ms,
            start_from_block,
        } => {
            let source = RemoteSource::new(
                server_url,
                time::millis_to_duration(*retry_delay_ms),
                time::millis_to_duration(*request_timeout_ms),
            )?
            .with_event_bus(event_bus.clone())
            .with_start_block(*start_from_block);
            Ok(Arc::new(source))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[tokio::test]
    async fn test_local_config_path_resolves_against_base_dir() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("blocks.json"), r#"[{"name": "b1"}]"#).unwrap();
        let config = SourceConfig::Local {
            participant_index: 9,
            config_file: PathBuf::from("blocks.json"),
        };

        let source = build_source(&config, &EventBus::default(), dir.path()).unwrap();

        assert_eq!(source.kind(), "local");
        assert_eq!(source.get_summary().await.unwrap().participant_index, 9);
        assert_eq!(source.get_current_config().await.unwrap().name, "b1");
    }

    #[test]
    fn test_missing_local_file_is_source_error() {
        let dir = tempfile::tempdir().unwrap();
        let config = SourceConfig::Local {
            participant_index: 1,
            config_file: PathBuf::from("absent.json"),
        };

        assert!(matches!(
            build_source(&config, &EventBus::default(), dir.path()),
            Err(SourceError::Source(_))
        ));
    }

    #[test]
    fn test_remote_config_builds_remote_source() {
        let config = SourceConfig::Remote {
            server_url: "http://127.0.0.1:5000".to_string(),
            retry_delay_ms: 100,
            request_timeout_ms: 1000,
            start_from_block: Some(2),
        };

        let source = build_source(&config, &EventBus::default(), Path::new(".")).unwrap();
        assert_eq!(source.kind(), "remote");
        assert_eq!(source.retry_count(), 0);
    }
}
