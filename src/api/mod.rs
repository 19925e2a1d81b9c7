pub mod client;

pub use client::CloudClient;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::pipeline::CollectorError;

/// Log type selecting device data report events.
pub const LOG_TYPE_REPORT: u32 = 7;
/// Query type selecting a time-range log query.
pub const QUERY_TYPE_TIME_RANGE: u32 = 1;
/// Status code under which the plug reports instantaneous power.
pub const POWER_CODE: &str = "cur_power";

/// Read access to the cloud device-log API.
#[async_trait::async_trait]
pub trait DeviceLogsApi: Send + Sync {
    async fn device_logs(
        &self,
        device_id: &str,
        query: &LogsQuery,
    ) -> Result<LogsPage, CollectorError>;
}

/// Query parameters for one page of the device log endpoint. The first page
/// of a window carries no `start_row_key`; later pages thread the key the
/// previous page returned.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LogsQuery {
    #[serde(rename = "type")]
    pub log_type: u32,
    pub query_type: u32,
    pub start_time: i64,
    pub end_time: i64,
    pub size: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_row_key: Option<String>,
}

impl LogsQuery {
    /// Report-log query for the closed window `[start, end]`, first page.
    pub fn for_window(start: OffsetDateTime, end: OffsetDateTime, size: u32) -> Self {
        Self {
            log_type: LOG_TYPE_REPORT,
            query_type: QUERY_TYPE_TIME_RANGE,
            start_time: unix_millis(start),
            end_time: unix_millis(end),
            size,
            start_row_key: None,
        }
    }
}

fn unix_millis(ts: OffsetDateTime) -> i64 {
    (ts.unix_timestamp_nanos() / 1_000_000) as i64
}

/// Standard response envelope wrapped around every API payload.
#[derive(Debug, Deserialize)]
pub struct ApiResponse<T> {
    pub success: Option<bool>,
    pub msg: Option<String>,
    pub result: Option<T>,
}

/// One page of device log records.
#[derive(Debug, Clone, Deserialize)]
pub struct LogsPage {
    #[serde(default)]
    pub logs: Vec<LogRecord>,
    #[serde(default)]
    pub has_next: bool,
    pub next_row_key: Option<String>,
}

/// A single device log event. `event_time` is unix epoch milliseconds.
#[derive(Debug, Clone, Deserialize)]
pub struct LogRecord {
    pub event_time: i64,
    pub code: String,
    pub value: RawValue,
}

/// Raw status value as reported by the API. Numeric values arrive either as
/// JSON numbers or as decimal strings depending on firmware.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum RawValue {
    Integer(i64),
    Text(String),
}

impl RawValue {
    pub fn as_int(&self) -> Option<i64> {
        match self {
            RawValue::Integer(v) => Some(*v),
            RawValue::Text(s) => s.trim().parse().ok(),
        }
    }
}
