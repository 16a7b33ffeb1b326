//! Local config source backed by a preloaded list

use super::{ConfigSource, SourceError};
use crate::block::{BlockConfig, NextBlock, SessionSummary};
use async_trait::async_trait;
use std::path::Path;
use tokio::sync::Mutex;
use tracing::{debug, info};

/// Ordered, finite list of block configs
///
/// "Fetch next" advances an index; running past the end (or reaching a
/// block named `end`) finishes the session.
pub struct LocalSource {
    blocks: Vec<BlockConfig>,
    participant_index: i64,
    current: Mutex<usize>,
}

impl LocalSource {
    pub fn new(blocks: Vec<BlockConfig>, participant_index: i64) -> Self {
        info!(
            blocks = blocks.len(),
            participant_index, "Local config source loaded"
        );
        Self {
            blocks,
            participant_index,
            current: Mutex::new(0),
        }
    }

    /// Parse a JSON array of block configs
    pub fn from_json(payload: &str, participant_index: i64) -> Result<Self, SourceError> {
        let blocks: Vec<BlockConfig> =
            serde_json::from_str(payload).map_err(|e| SourceError::Decode {
                endpoint: "local config".to_string(),
                message: e.to_string(),
            })?;
        Ok(Self::new(blocks, participant_index))
    }

    pub fn from_file(path: &Path, participant_index: i64) -> Result<Self, SourceError> {
        let payload = std::fs::read_to_string(path).map_err(|e| {
            SourceError::Source(format!("Read {} failed: {}", path.display(), e))
        })?;
        Self::from_json(&payload, participant_index)
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// Index of the block the source currently points at
    pub async fn position(&self) -> usize {
        *self.current.lock().await
    }
}

#[async_trait]
impl ConfigSource for LocalSource {
    fn kind(&self) -> &'static str {
        "local"
    }

    async fn get_summary(&self) -> Result<SessionSummary, SourceError> {
        Ok(SessionSummary {
            participant_index: self.participant_index,
            total_block_count: self.blocks.len() as i64,
        })
    }

    async fn get_current_config(&self) -> Result<BlockConfig, SourceError> {
        let index = *self.current.lock().await;
        match self.blocks.get(index) {
            Some(block) if !block.is_end_marker() => {
                debug!(index, name = %block.name, "Local block config");
                Ok(block.clone())
            }
            _ => Err(SourceError::SessionComplete),
        }
    }

    async fn advance_to_next_config(&self) -> Result<NextBlock, SourceError> {
        let mut index = self.current.lock().await;
        // Never step past the end of the list or past an end marker
        if self
            .blocks
            .get(*index)
            .is_some_and(|block| !block.is_end_marker())
        {
            *index += 1;
        }

        match self.blocks.get(*index) {
            Some(block) if !block.is_end_marker() => Ok(NextBlock::Block(block.clone())),
            _ => {
                info!(index = *index, "Local config list exhausted");
                Ok(NextBlock::EndOfSession)
            }
        }
    }

    async fn move_to_block(&self, index: u32) -> Result<(), SourceError> {
        let index = index as usize;
        if index >= self.blocks.len() {
            return Err(SourceError::Source(format!(
                "Block index {} out of range (0..{})",
                index,
                self.blocks.len()
            )));
        }
        *self.current.lock().await = index;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_blocks() -> LocalSource {
        LocalSource::from_json(r#"[{"name": "b1"}, {"name": "b2", "calibrationName": "hand"}]"#, 5)
            .unwrap()
    }

    #[tokio::test]
    async fn test_summary_reports_configured_participant() {
        let source = two_blocks();
        let summary = source.get_summary().await.unwrap();
        assert_eq!(summary.participant_index, 5);
        assert_eq!(summary.total_block_count, 2);
    }

    #[tokio::test]
    async fn test_current_config_is_repeatable() {
        let source = two_blocks();
        assert_eq!(source.get_current_config().await.unwrap().name, "b1");
        assert_eq!(source.get_current_config().await.unwrap().name, "b1");
    }

    #[tokio::test]
    async fn test_advance_walks_list_then_ends() {
        let source = two_blocks();

        match source.advance_to_next_config().await.unwrap() {
            NextBlock::Block(block) => assert_eq!(block.name, "b2"),
            NextBlock::EndOfSession => panic!("expected second block"),
        }
        assert_eq!(source.get_current_config().await.unwrap().name, "b2");

        assert_eq!(
            source.advance_to_next_config().await.unwrap(),
            NextBlock::EndOfSession
        );
        // Stays exhausted
        assert_eq!(
            source.advance_to_next_config().await.unwrap(),
            NextBlock::EndOfSession
        );
        assert!(matches!(
            source.get_current_config().await,
            Err(SourceError::SessionComplete)
        ));
    }

    #[tokio::test]
    async fn test_end_marker_in_list_ends_session() {
        let source =
            LocalSource::from_json(r#"[{"name": "b1"}, {"name": "END"}, {"name": "b3"}]"#, 1)
                .unwrap();
        assert_eq!(
            source.advance_to_next_config().await.unwrap(),
            NextBlock::EndOfSession
        );
    }

    #[tokio::test]
    async fn test_empty_list_has_no_current_block() {
        let source = LocalSource::from_json("[]", 1).unwrap();
        assert!(source.is_empty());
        assert!(matches!(
            source.get_current_config().await,
            Err(SourceError::SessionComplete)
        ));
    }

    #[tokio::test]
    async fn test_move_to_block_bounds() {
        let source = two_blocks();
        source.move_to_block(1).await.unwrap();
        assert_eq!(source.position().await, 1);
        assert!(source.move_to_block(2).await.is_err());
    }

    #[test]
    fn test_malformed_payload_is_decode_error() {
        assert!(matches!(
            LocalSource::from_json("{\"name\": 1}", 1),
            Err(SourceError::Decode { .. })
        ));
    }
}
