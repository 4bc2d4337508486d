use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer};

/// Envelope returned by `loki/api/v1/query_range`.
#[derive(Debug, Clone, Deserialize)]
pub struct QueryRangeResponse {
    pub status: String,
    pub data: QueryRangeData,
}

#[derive(Debug, Clone, Deserialize)]
pub struct QueryRangeData {
    #[serde(rename = "resultType", default)]
    pub result_type: String,
    #[serde(default)]
    pub result: Vec<LogStream>,
}

impl QueryRangeData {
    /// Highest entry timestamp across every stream of the batch, used to
    /// advance the pagination window.
    pub fn max_timestamp(&self) -> Option<i64> {
        self.result
            .iter()
            .flat_map(|stream| stream.entries.iter().map(|entry| entry.timestamp))
            .max()
    }
}

/// One frame of the `loki/api/v1/tail` websocket. Dropped entries are
/// informational: the server already lost them.
#[derive(Debug, Clone, Deserialize)]
pub struct TailResponse {
    #[serde(default)]
    pub streams: Vec<LogStream>,
    #[serde(default)]
    pub dropped_entries: Vec<DroppedEntry>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DroppedEntry {
    #[serde(default)]
    pub labels: HashMap<String, String>,
    #[serde(default)]
    pub timestamp: String,
}

/// A labelled sequence of entries. Entry order is the server's; timestamps
/// are non-decreasing within a stream but not strictly monotonic.
#[derive(Debug, Clone, Deserialize)]
pub struct LogStream {
    #[serde(rename = "stream", default)]
    pub labels: HashMap<String, String>,
    #[serde(rename = "values", default)]
    pub entries: Vec<LogEntry>,
}

/// A `(timestamp, line)` pair. On the wire this is a two-element array with
/// the timestamp encoded as a decimal string of nanoseconds since the epoch.
#[derive(Debug, Clone, Deserialize)]
pub struct LogEntry {
    #[serde(deserialize_with = "nanos_from_string")]
    pub timestamp: i64,
    pub line: String,
}

impl LogEntry {
    pub fn datetime(&self) -> DateTime<Utc> {
        DateTime::from_timestamp_nanos(self.timestamp)
    }
}

fn nanos_from_string<'de, D>(deserializer: D) -> Result<i64, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    raw.parse::<i64>().map_err(|_| {
        serde::de::Error::custom(format!("invalid nanosecond timestamp: {raw}"))
    })
}
