use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bridge_common::event::{IntakeEvent, OutboundEvent, ProcessingContext};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Value};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::error;
use uuid::Uuid;

pub const AUDIT_FILE_NAME: &str = "audit.log";

/// Result of one delivery, as recorded in the audit trail.
#[derive(Debug, Clone, PartialEq)]
pub struct SubmissionOutcome {
    pub success: bool,
    pub status_code: Option<u16>,
    pub error_message: Option<String>,
    pub processing_time_ms: u64,
}

/// Durable trail of what happened to every event. Appends never fail the caller.
#[async_trait]
pub trait AuditLog: Send + Sync {
    async fn log_received(&self, event: &IntakeEvent);
    async fn log_submission(
        &self,
        context: &ProcessingContext,
        event: &OutboundEvent,
        outcome: &SubmissionOutcome,
    );
    async fn log_dead_lettered(&self, event_id: Uuid, correlation_id: Uuid, reason: &str);
}

#[derive(Serialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct AuditEntry {
    pub audit_id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub event_type: &'static str,
    pub correlation_id: Uuid,
    pub actor: &'static str,
    pub action: String,
    pub resource: String,
    pub status: &'static str,
    pub details: Value,
}

/// Writes one JSON entry per line to `<directory>/audit.log`.
pub struct JsonlAuditLog {
    path: PathBuf,
    action: String,
    lock: Mutex<()>,
}

impl JsonlAuditLog {
    /// `endpoint_path` names the submission target in submission entries.
    pub async fn open(directory: &Path, endpoint_path: &str) -> std::io::Result<Self> {
        tokio::fs::create_dir_all(directory).await?;
        Ok(Self {
            path: directory.join(AUDIT_FILE_NAME),
            action: format!("POST {endpoint_path}"),
            lock: Mutex::new(()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn append(&self, entry: AuditEntry) {
        let mut line = match serde_json::to_string(&entry) {
            Ok(line) => line,
            Err(e) => {
                error!("failed to serialize audit entry: {}", e);
                return;
            }
        };
        line.push('\n');

        let _guard = self.lock.lock().await;
        let result: std::io::Result<()> = async {
            let mut file = tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.path)
                .await?;
            file.write_all(line.as_bytes()).await
        }
        .await;

        if let Err(e) = result {
            error!(
                path = %self.path.display(),
                event_type = entry.event_type,
                "failed to write audit entry: {}",
                e
            );
        }
    }
}

#[async_trait]
impl AuditLog for JsonlAuditLog {
    async fn log_received(&self, event: &IntakeEvent) {
        self.append(AuditEntry {
            audit_id: Uuid::new_v4(),
            timestamp: event.received_at,
            event_type: "EventReceived",
            correlation_id: event.id,
            actor: "system",
            action: "SCOM XML ingest".to_owned(),
            resource: format!("scom-event:{}", event.id),
            status: "success",
            details: json!({
                "severity": event.severity,
                "sourceFile": event.source_file,
            }),
        })
        .await
    }

    async fn log_submission(
        &self,
        context: &ProcessingContext,
        event: &OutboundEvent,
        outcome: &SubmissionOutcome,
    ) {
        self.append(AuditEntry {
            audit_id: Uuid::new_v4(),
            timestamp: Utc::now(),
            event_type: "EventSubmitted",
            correlation_id: context.correlation_id,
            actor: "system",
            action: self.action.clone(),
            resource: format!("obm-event:{}", context.event_id),
            status: if outcome.success { "success" } else { "failure" },
            details: json!({
                "httpStatus": outcome.status_code,
                "error": outcome.error_message,
                "processingTimeMs": outcome.processing_time_ms,
                "attempt": context.attempt,
                "sourceFile": context.source_file,
                "title": event.title,
                "severity": event.severity,
            }),
        })
        .await
    }

    async fn log_dead_lettered(&self, event_id: Uuid, correlation_id: Uuid, reason: &str) {
        self.append(AuditEntry {
            audit_id: Uuid::new_v4(),
            timestamp: Utc::now(),
            event_type: "EventMovedToDLQ",
            correlation_id,
            actor: "system",
            action: "DLQ write".to_owned(),
            resource: format!("dlq-event:{event_id}"),
            status: "failure",
            details: json!({ "reason": reason }),
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use bridge_common::event::IntakeSeverity;
    use serde_json::Map;

    use super::*;

    fn intake() -> IntakeEvent {
        IntakeEvent {
            id: Uuid::new_v4(),
            name: "Heartbeat failure".to_owned(),
            severity: IntakeSeverity::Error,
            description: String::new(),
            source_object_ref: None,
            category: None,
            time_raised: None,
            time_added: None,
            priority: None,
            resolution_state: None,
            custom_fields: Map::new(),
            source_file: "alerts.xml".to_owned(),
            received_at: Utc::now(),
        }
    }

    async fn entries(log: &JsonlAuditLog) -> Vec<Value> {
        tokio::fs::read_to_string(log.path())
            .await
            .unwrap()
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect()
    }

    #[tokio::test]
    async fn test_entries_are_appended_as_json_lines() {
        let dir = tempfile::tempdir().unwrap();
        let log = JsonlAuditLog::open(&dir.path().join("audit"), "/opr-web/rest/event_list")
            .await
            .unwrap();
        let event = intake();
        let correlation_id = Uuid::new_v4();

        log.log_received(&event).await;
        log.log_dead_lettered(event.id, correlation_id, "HTTP 503")
            .await;

        let entries = entries(&log).await;
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0]["eventType"], "EventReceived");
        assert_eq!(entries[0]["details"]["severity"], "Error");
        assert_eq!(entries[0]["details"]["sourceFile"], "alerts.xml");
        assert_eq!(entries[1]["eventType"], "EventMovedToDLQ");
        assert_eq!(entries[1]["correlationId"], correlation_id.to_string());
        assert_eq!(entries[1]["status"], "failure");
        assert_eq!(entries[1]["details"]["reason"], "HTTP 503");
    }

    #[tokio::test]
    async fn test_submission_entry() {
        let dir = tempfile::tempdir().unwrap();
        let log = JsonlAuditLog::open(dir.path(), "/opr-web/rest/event_list")
            .await
            .unwrap();
        let event = intake();
        let outbound = crate::transformer::transform(&event);
        let mut context =
            ProcessingContext::new(outbound.correlation_id, event.id, &event.source_file);
        context.attempt = 2;

        log.log_submission(
            &context,
            &outbound,
            &SubmissionOutcome {
                success: true,
                status_code: Some(202),
                error_message: None,
                processing_time_ms: 15,
            },
        )
        .await;

        let entries = entries(&log).await;
        assert_eq!(entries[0]["action"], "POST /opr-web/rest/event_list");
        assert_eq!(entries[0]["status"], "success");
        assert_eq!(entries[0]["details"]["httpStatus"], 202);
        assert_eq!(entries[0]["details"]["attempt"], 2);
    }

    #[tokio::test]
    async fn test_write_failures_are_swallowed() {
        let dir = tempfile::tempdir().unwrap();
        let log = JsonlAuditLog::open(dir.path(), "/events").await.unwrap();
        // A directory where the file should be makes every append fail.
        tokio::fs::create_dir_all(log.path()).await.unwrap();

        log.log_received(&intake()).await;
    }

    #[tokio::test]
    async fn test_open_failure_is_an_audit_error() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("not-a-directory");
        std::fs::write(&blocker, "").unwrap();

        let error = JsonlAuditLog::open(&blocker.join("audit"), "/opr-web/rest/event_list")
            .await
            .err()
            .map(crate::error::WorkerError::from)
            .expect("opening under a file must fail");

        assert!(matches!(error, crate::error::WorkerError::Audit(_)));
        assert!(error.to_string().starts_with("failed to open the audit log"));
    }
}
