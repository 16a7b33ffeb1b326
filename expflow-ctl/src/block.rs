//! Block configuration and session summary records
//!
//! Both records are deserialized straight from the experiment server's JSON
//! (or from the local config file) and are immutable once received.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Block name that marks the end of the session
pub const END_OF_SESSION: &str = "end";

/// Configuration of one block, as supplied by the config source
///
/// The controller only inspects `name` and `calibration_name`. Any other
/// field of the payload is kept untouched in `extra`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockConfig {
    pub name: String,

    #[serde(default)]
    pub participant_index: i64,

    /// Empty or absent means the block has no calibration phase
    #[serde(rename = "calibrationName", default, skip_serializing_if = "Option::is_none")]
    pub calibration_name: Option<String>,

    /// Index of the block in the server's configuration list
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub block_id: Option<i64>,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl BlockConfig {
    /// Minimal config with no calibration and no extra fields
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            participant_index: 0,
            calibration_name: None,
            block_id: None,
            extra: Map::new(),
        }
    }

    pub fn with_calibration(mut self, calibration_name: impl Into<String>) -> Self {
        self.calibration_name = Some(calibration_name.into());
        self
    }

    pub fn with_extra(mut self, key: impl Into<String>, value: Value) -> Self {
        self.extra.insert(key.into(), value);
        self
    }

    /// True when this record is the end-of-session sentinel
    pub fn is_end_marker(&self) -> bool {
        self.name.eq_ignore_ascii_case(END_OF_SESSION)
    }

    /// Calibration name, with an empty string treated as absent
    pub fn calibration(&self) -> Option<&str> {
        self.calibration_name
            .as_deref()
            .filter(|name| !name.trim().is_empty())
    }

    /// Decode the whole payload into a caller-defined block type
    ///
    /// The required fields are included, so a caller type may declare them
    /// alongside its own domain fields.
    pub fn extra_as<T: DeserializeOwned>(&self) -> serde_json::Result<T> {
        serde_json::from_value(serde_json::to_value(self)?)
    }
}

impl std::fmt::Display for BlockConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} (participant {}, calibration {}, block id {})",
            self.name,
            self.participant_index,
            self.calibration().unwrap_or("-"),
            self.block_id
                .map(|id| id.to_string())
                .unwrap_or_else(|| "-".to_string())
        )
    }
}

/// Session-wide information fetched once at session start
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSummary {
    pub participant_index: i64,

    /// Informational only; blocks are created lazily so the real count may differ
    #[serde(rename = "config_length", alias = "total_block_count", default)]
    pub total_block_count: i64,
}

/// Result of asking a source for the next block
#[derive(Debug, Clone, PartialEq)]
pub enum NextBlock {
    Block(BlockConfig),
    EndOfSession,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_deserialize_keeps_extra_fields() {
        let config: BlockConfig = serde_json::from_value(json!({
            "name": "pinch",
            "participant_index": 4,
            "calibrationName": "hand",
            "block_id": 2,
            "conditionVal": 7,
            "targets": ["a", "b"]
        }))
        .unwrap();

        assert_eq!(config.name, "pinch");
        assert_eq!(config.participant_index, 4);
        assert_eq!(config.calibration(), Some("hand"));
        assert_eq!(config.block_id, Some(2));
        assert_eq!(config.extra["conditionVal"], 7);
        assert_eq!(config.extra.len(), 2);
    }

    #[test]
    fn test_missing_optional_fields_default() {
        let config: BlockConfig = serde_json::from_value(json!({ "name": "b1" })).unwrap();
        assert_eq!(config.participant_index, 0);
        assert_eq!(config.calibration(), None);
        assert!(config.extra.is_empty());
    }

    #[test]
    fn test_empty_calibration_name_means_none() {
        let config = BlockConfig::named("b1").with_calibration("  ");
        assert_eq!(config.calibration(), None);
    }

    #[test]
    fn test_end_marker_is_case_insensitive() {
        assert!(BlockConfig::named("end").is_end_marker());
        assert!(BlockConfig::named("END").is_end_marker());
        assert!(!BlockConfig::named("endurance").is_end_marker());
    }

    #[test]
    fn test_extra_as_decodes_domain_type() {
        #[derive(Deserialize)]
        struct Sample {
            name: String,
            #[serde(rename = "conditionVal")]
            condition_val: i32,
        }

        let config = BlockConfig::named("b1").with_extra("conditionVal", json!(3));
        let sample: Sample = config.extra_as().unwrap();
        assert_eq!(sample.name, "b1");
        assert_eq!(sample.condition_val, 3);
    }

    #[test]
    fn test_summary_uses_server_field_names() {
        let summary: SessionSummary =
            serde_json::from_str(r#"{"participant_index": 12, "config_length": 8}"#).unwrap();
        assert_eq!(summary.participant_index, 12);
        assert_eq!(summary.total_block_count, 8);
    }
}
