//! Event publishing configuration

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Settings applied to every envelope the emitter builds
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventsConfig {
    /// Prefix prepended to every subject (e.g. `apgms.dev.reconciliation.completed`)
    #[serde(default = "default_subject_prefix")]
    pub subject_prefix: String,

    /// Identifier of the emitting component
    #[serde(default = "default_source")]
    pub source: String,

    /// Payload schema version advertised to subscribers
    #[serde(default = "default_schema_version")]
    pub schema_version: String,

    /// Broadcast buffer size; subscribers further behind than this lag
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,

    /// Directory for the JSONL event log (disabled when unset)
    #[serde(default)]
    pub log_dir: Option<PathBuf>,
}

fn default_subject_prefix() -> String {
    "apgms.dev".to_string()
}

fn default_source() -> String {
    "services.ledger".to_string()
}

fn default_schema_version() -> String {
    "2025-03-12".to_string()
}

fn default_channel_capacity() -> usize {
    1024
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            subject_prefix: default_subject_prefix(),
            source: default_source(),
            schema_version: default_schema_version(),
            channel_capacity: default_channel_capacity(),
            log_dir: None,
        }
    }
}

impl EventsConfig {
    /// Fully qualified subject for `subject`, prefixed once
    pub fn full_subject(&self, subject: &str) -> String {
        let prefix = format!("{}.", self.subject_prefix);
        if self.subject_prefix.is_empty() || subject.starts_with(&prefix) {
            subject.to_string()
        } else {
            format!("{}{}", prefix, subject)
        }
    }
}
