//! Operational event log: the tenant-visible record of what automation did.

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OpsLevel {
    Info,
    Warn,
    Error,
}

/// Subsystem an entry is attributed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OpsSource {
    Automation,
    Integration,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OpsLogEntry {
    pub tenant: String,
    pub level: OpsLevel,
    pub source: OpsSource,
    pub message: String,
    pub meta: Value,
}

#[derive(Debug, thiserror::Error)]
pub enum OpsLogError {
    #[error("ops log unavailable: {0}")]
    Unavailable(String),
}

#[async_trait]
pub trait OpsLogger: Send + Sync {
    async fn log(&self, entry: OpsLogEntry) -> Result<(), OpsLogError>;
}

/// Writes entries to the process log under the `slotd::ops` target.
pub struct TracingOpsLog;

#[async_trait]
impl OpsLogger for TracingOpsLog {
    async fn log(&self, entry: OpsLogEntry) -> Result<(), OpsLogError> {
        let source = match entry.source {
            OpsSource::Automation => "automation",
            OpsSource::Integration => "integration",
        };
        match entry.level {
            OpsLevel::Info => tracing::info!(
                target: "slotd::ops",
                tenant = %entry.tenant,
                source,
                meta = %entry.meta,
                "{}",
                entry.message
            ),
            OpsLevel::Warn => tracing::warn!(
                target: "slotd::ops",
                tenant = %entry.tenant,
                source,
                meta = %entry.meta,
                "{}",
                entry.message
            ),
            OpsLevel::Error => tracing::error!(
                target: "slotd::ops",
                tenant = %entry.tenant,
                source,
                meta = %entry.meta,
                "{}",
                entry.message
            ),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn entry_serializes_lowercase() {
        let entry = OpsLogEntry {
            tenant: "acme".into(),
            level: OpsLevel::Error,
            source: OpsSource::Integration,
            message: "Failed to send email for booking.reminder".into(),
            meta: json!({ "channel": "email", "action": "booking.reminder", "error": "boom" }),
        };
        let v = serde_json::to_value(&entry).unwrap();
        assert_eq!(v["level"], "error");
        assert_eq!(v["source"], "integration");
        assert_eq!(v["meta"]["action"], "booking.reminder");
    }

    #[tokio::test]
    async fn tracing_logger_accepts_entries() {
        let entry = OpsLogEntry {
            tenant: "acme".into(),
            level: OpsLevel::Info,
            source: OpsSource::Automation,
            message: "Booking reminder sent".into(),
            meta: json!({}),
        };
        TracingOpsLog.log(entry).await.unwrap();
    }
}
