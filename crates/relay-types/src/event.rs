use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventLevel {
    Info,
    Warn,
    Error,
}

impl EventLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }
}

/// Append-only audit row for a run. Progress reporting only; the executor
/// never consults events for correctness.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunEvent {
    pub run_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,
    pub level: EventLevel,
    pub message: String,
    pub ts: DateTime<Utc>,
}

impl RunEvent {
    pub fn info(run_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(run_id, EventLevel::Info, message)
    }

    pub fn warn(run_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(run_id, EventLevel::Warn, message)
    }

    pub fn error(run_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(run_id, EventLevel::Error, message)
    }

    fn new(run_id: impl Into<String>, level: EventLevel, message: impl Into<String>) -> Self {
        Self {
            run_id: run_id.into(),
            node_id: None,
            level,
            message: message.into(),
            ts: Utc::now(),
        }
    }

    pub fn with_node(mut self, node_id: impl Into<String>) -> Self {
        self.node_id = Some(node_id.into());
        self
    }
}
