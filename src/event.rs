use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::Serialize;

pub const MODULE_NAME: &str = "loki";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum EventKind {
    Log,
}

/// Hint for the downstream pipeline: `TimeMachine` events carry their own
/// timestamp and must not be treated as live.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ExpectMode {
    TimeMachine,
    Live,
}

/// One log line handed to the consumer channel. Built by the acquisition
/// driver and never touched again after the send.
#[derive(Debug, Clone, Serialize)]
pub struct Event {
    pub raw: String,
    pub timestamp: DateTime<Utc>,
    pub source: String,
    pub labels: HashMap<String, String>,
    pub module: &'static str,
    pub process: bool,
    pub kind: EventKind,
    pub expect_mode: ExpectMode,
}

impl Event {
    pub fn log(
        raw: String,
        timestamp: DateTime<Utc>,
        source: String,
        labels: HashMap<String, String>,
    ) -> Self {
        Self {
            raw,
            timestamp,
            source,
            labels,
            module: MODULE_NAME,
            process: true,
            kind: EventKind::Log,
            expect_mode: ExpectMode::TimeMachine,
        }
    }
}
