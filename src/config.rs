use log::debug;
use serde::{Deserialize, Serialize};

use crate::query_ast::QueryBuilderError;

/// Physical names and tuning knobs for the calls compiler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompilerConfig {
    pub calls_table: String,
    pub feedback_table: String,
    pub object_versions_table: String,
    pub table_rows_table: String,
    /// Depth used when a descendant scope does not name one.
    pub default_descendant_depth: u64,
    /// Slack, in seconds, applied when turning a timestamp into an id bound.
    pub id_time_buffer_secs: u64,
    /// Ids matching this pattern carry their creation time; any other id
    /// (externally supplied, random) is never pruned by a time bound.
    pub time_ordered_id_pattern: String,
    pub format_sql: bool,
}

/// Lowercase canonical UUIDv7.
pub const TIME_ORDERED_ID_PATTERN: &str = "^[0-9a-f]{8}-[0-9a-f]{4}-7[0-9a-f]{3}-[89ab][0-9a-f]{3}-[0-9a-f]{12}$";

impl Default for CompilerConfig {
    fn default() -> Self {
        Self {
            calls_table: "calls_merged".to_string(),
            feedback_table: "feedback".to_string(),
            object_versions_table: "object_versions".to_string(),
            table_rows_table: "table_rows".to_string(),
            default_descendant_depth: 100,
            id_time_buffer_secs: 300,
            time_ordered_id_pattern: TIME_ORDERED_ID_PATTERN.to_string(),
            format_sql: false,
        }
    }
}

impl CompilerConfig {
    pub fn from_json(raw: &str) -> Result<Self, QueryBuilderError> {
        let cfg: CompilerConfig = serde_json::from_str(raw)?;
        cfg.validate()?;
        debug!("loaded compiler config: calls table {}", cfg.calls_table);
        Ok(cfg)
    }

    /// Table names are spliced into SQL text, so they must be plain identifiers.
    pub fn validate(&self) -> Result<(), QueryBuilderError> {
        for name in [&self.calls_table, &self.feedback_table, &self.object_versions_table, &self.table_rows_table] {
            validate_identifier(name)?;
        }
        Ok(())
    }
}

pub fn validate_identifier(name: &str) -> Result<(), QueryBuilderError> {
    if name.is_empty() {
        return Err(QueryBuilderError::InvalidIdentifier("empty".to_string()));
    }
    if name.len() > 128 {
        return Err(QueryBuilderError::InvalidIdentifier(format!("too long: {}", name.len())));
    }
    if !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.') || name.starts_with('.') || name.ends_with('.') {
        return Err(QueryBuilderError::InvalidIdentifier(format!("forbidden characters in: {}", name)));
    }
    Ok(())
}
