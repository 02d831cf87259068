//! Moves decoded events through transformation and submission, and dead-letters the ones
//! that cannot be delivered.
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use bridge_common::circuit_breaker::CircuitBreaker;
use bridge_common::dlq::{DeadLetterRecord, DeadLetterStore, DlqError};
use bridge_common::event::{IntakeEvent, OutboundEvent, ProcessingContext};
use bridge_common::metrics::{
    EVENTS_TOTAL, PROCESSING_DURATION, RETRIES_TOTAL, SUBMISSION_DURATION,
};
use chrono::Utc;
use health::HealthHandle;
use serde_json::{Map, Value};
use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};

use crate::alerts::{evaluate, MetricsSnapshot};
use crate::audit::{AuditLog, SubmissionOutcome};
use crate::client::{EventSubmitter, RetryClassifier, SubmitResponse};
use crate::config::RuntimeSettings;
use crate::error::DeliveryError;
use crate::notify::{DeliveryStatus, Notifier, PushMessage, RecentEvent};
use crate::queue::TaskQueue;
use crate::stats::{ProcessingStatistics, StatisticsSnapshot};
use crate::transformer::{transform, transform_with_correlation};
use crate::watcher::FileBatch;

pub const RECENT_EVENTS_CAPACITY: usize = 100;

/// Source tag of events resubmitted from the dead letter store.
pub const DEAD_LETTER_SOURCE: &str = "dlq";

/// Terminal state of one event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Delivered,
    DeadLettered,
}

pub struct DeliveryOrchestrator {
    settings: watch::Receiver<RuntimeSettings>,
    breaker: Arc<CircuitBreaker>,
    classifier: RetryClassifier,
    submitter: Arc<dyn EventSubmitter>,
    dead_letters: Arc<DeadLetterStore>,
    audit: Arc<dyn AuditLog>,
    notifier: Notifier,
    stats: ProcessingStatistics,
    recent: Mutex<VecDeque<RecentEvent>>,
}

impl DeliveryOrchestrator {
    pub fn new(
        settings: watch::Receiver<RuntimeSettings>,
        breaker: Arc<CircuitBreaker>,
        classifier: RetryClassifier,
        submitter: Arc<dyn EventSubmitter>,
        dead_letters: Arc<DeadLetterStore>,
        audit: Arc<dyn AuditLog>,
        notifier: Notifier,
    ) -> Self {
        Self {
            settings,
            breaker,
            classifier,
            submitter,
            dead_letters,
            audit,
            notifier,
            stats: ProcessingStatistics::default(),
            recent: Mutex::new(VecDeque::with_capacity(RECENT_EVENTS_CAPACITY)),
        }
    }

    pub fn statistics(&self) -> StatisticsSnapshot {
        self.stats.snapshot()
    }

    /// Newest first.
    pub fn recent_events(&self) -> Vec<RecentEvent> {
        self.recent
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .iter()
            .cloned()
            .collect()
    }

    /// Take batches off the watcher channel until every sender is gone, reporting liveness
    /// on every `heartbeat`.
    pub async fn run(
        self: Arc<Self>,
        mut receiver: mpsc::Receiver<FileBatch>,
        queue: TaskQueue,
        liveness: HealthHandle,
        heartbeat: Duration,
    ) {
        let mut heartbeat = tokio::time::interval(heartbeat.max(Duration::from_millis(1)));
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = heartbeat.tick() => liveness.report_healthy().await,
                batch = receiver.recv() => match batch {
                    Some(batch) => self.dispatch(batch, &queue),
                    None => break,
                },
            }
        }
        info!("batch channel closed, dispatcher stopped");
    }

    /// Split a file batch into sub-batches of the configured size and queue each of them.
    pub fn dispatch(self: &Arc<Self>, batch: FileBatch, queue: &TaskQueue) {
        let batch_size = self.settings.borrow().batch_size.max(1);
        let FileBatch {
            source_file,
            events,
        } = batch;

        let mut events = events.into_iter().peekable();
        let mut index = 0;
        while events.peek().is_some() {
            let chunk: Vec<IntakeEvent> = events.by_ref().take(batch_size).collect();
            let orchestrator = self.clone();
            let source_file = source_file.clone();

            queue.submit(&format!("{source_file}#{index}"), async move {
                orchestrator.process_batch(chunk, &source_file).await
            });
            index += 1;
        }
    }

    /// Deliver `events` one after the other, then publish the aggregate statistics and
    /// evaluate the alert rules. A dead letter that could not be persisted does not stop the
    /// rest of the batch, the first such error is returned at the end.
    pub async fn process_batch(
        &self,
        events: Vec<IntakeEvent>,
        source_file: &str,
    ) -> Result<(), DlqError> {
        let mut first_error = None;

        for event in events {
            if let Err(e) = self.process_event(event, source_file).await {
                if first_error.is_none() {
                    first_error = Some(e);
                }
            }
        }

        self.publish_statistics();

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    pub async fn process_event(
        &self,
        event: IntakeEvent,
        source_file: &str,
    ) -> Result<DeliveryOutcome, DlqError> {
        self.stats.record_received();
        self.audit.log_received(&event).await;

        let outbound = transform(&event);
        self.deliver(event, outbound, source_file).await
    }

    /// Resubmit a dead letter through the regular delivery path. The stored payload is sent
    /// as is, or re-derived under the original correlation id when there is none.
    pub async fn replay_record(
        &self,
        record: DeadLetterRecord,
    ) -> Result<DeliveryOutcome, DlqError> {
        let source_file = replay_source(record.metadata.as_ref());
        let outbound = match record.transformed_event {
            Some(outbound) => outbound,
            None => transform_with_correlation(&record.original_event, record.correlation_id),
        };

        self.stats.record_received();
        self.audit.log_received(&record.original_event).await;
        self.deliver(record.original_event, outbound, &source_file)
            .await
    }

    /// Replay every dead letter matching `predicate`. Records that fail again are written
    /// back as new dead letters; only a record whose outcome could not be persisted stays.
    pub async fn replay_dead_letters<P>(&self, predicate: P) -> Result<usize, DlqError>
    where
        P: Fn(&DeadLetterRecord) -> bool,
    {
        let orchestrator = self;
        let replayed = self
            .dead_letters
            .replay(predicate, move |record| async move {
                orchestrator.replay_record(record).await.map(|_| ())
            })
            .await?;

        self.publish_statistics();
        Ok(replayed)
    }

    async fn deliver(
        &self,
        event: IntakeEvent,
        outbound: OutboundEvent,
        source_file: &str,
    ) -> Result<DeliveryOutcome, DlqError> {
        let mut context = ProcessingContext::new(outbound.correlation_id, event.id, source_file);
        let policy = self.settings.borrow().retry.clone();

        let attempts = AtomicU32::new(0);
        let attempts_ref = &attempts;
        let payload = &outbound;
        let result = policy
            .execute(
                move || async move {
                    attempts_ref.fetch_add(1, Ordering::SeqCst);
                    self.submit(payload).await
                },
                |e| self.classifier.is_retryable(e),
                |attempt, wait, e| {
                    self.stats.record_retry();
                    metrics::counter!(RETRIES_TOTAL).increment(1);
                    warn!(
                        event_id = %context.event_id,
                        correlation_id = %context.correlation_id,
                        attempt,
                        wait_ms = wait.as_millis() as u64,
                        "submission failed, retrying: {}",
                        e
                    );
                },
            )
            .await;
        context.attempt = attempts.load(Ordering::SeqCst);
        let elapsed = context.started_at.elapsed();
        metrics::histogram!(PROCESSING_DURATION).record(elapsed.as_secs_f64());

        match result {
            Ok(response) => {
                self.stats.record_success();
                metrics::counter!(EVENTS_TOTAL, &[("status", "success")]).increment(1);
                self.audit
                    .log_submission(
                        &context,
                        &outbound,
                        &SubmissionOutcome {
                            success: true,
                            status_code: Some(response.status),
                            error_message: None,
                            processing_time_ms: elapsed.as_millis() as u64,
                        },
                    )
                    .await;
                self.push_recent(&context, &outbound, DeliveryStatus::Success, None);
                Ok(DeliveryOutcome::Delivered)
            }
            Err(e) => {
                self.fail(event, outbound, &context, e, elapsed.as_millis() as u64)
                    .await
            }
        }
    }

    /// One attempt, gated by the circuit breaker.
    async fn submit(&self, outbound: &OutboundEvent) -> Result<SubmitResponse, DeliveryError> {
        if !self.breaker.can_proceed() {
            return Err(DeliveryError::CircuitOpen);
        }

        let started = Instant::now();
        let result = self.submitter.post_event(outbound).await;
        metrics::histogram!(SUBMISSION_DURATION).record(started.elapsed().as_secs_f64());

        let response = result?;
        self.breaker.record_success();
        Ok(response)
    }

    async fn fail(
        &self,
        event: IntakeEvent,
        outbound: OutboundEvent,
        context: &ProcessingContext,
        error: DeliveryError,
        processing_time_ms: u64,
    ) -> Result<DeliveryOutcome, DlqError> {
        // A rejection by the open breaker must not push its reopen time further out.
        if error != DeliveryError::CircuitOpen {
            self.breaker.record_failure();
        }

        let reason = error.to_string();
        self.stats.record_failure(&reason);
        metrics::counter!(EVENTS_TOTAL, &[("status", "failed")]).increment(1);
        warn!(
            event_id = %context.event_id,
            correlation_id = %context.correlation_id,
            attempt = context.attempt,
            "delivery failed, dead-lettering: {}",
            reason
        );

        self.audit
            .log_submission(
                context,
                &outbound,
                &SubmissionOutcome {
                    success: false,
                    status_code: error.status(),
                    error_message: Some(reason.clone()),
                    processing_time_ms,
                },
            )
            .await;

        let mut metadata = Map::new();
        metadata.insert(
            "sourceFile".to_owned(),
            Value::String(context.source_file.clone()),
        );
        let record = DeadLetterRecord {
            event_id: event.id,
            correlation_id: context.correlation_id,
            original_event: event,
            transformed_event: Some(outbound.clone()),
            failure_reason: reason.clone(),
            failure_timestamp: Utc::now(),
            retry_count: context.attempt,
            last_http_status: error.status(),
            metadata: Some(metadata),
        };

        if let Err(e) = self.dead_letters.write(&record).await {
            error!(
                event_id = %context.event_id,
                correlation_id = %context.correlation_id,
                "failed to persist dead letter, event is lost: {}",
                e
            );
            self.notifier
                .publish_error(format!("event {} could not be dead-lettered: {}", context.event_id, e));
            return Err(e);
        }

        self.audit
            .log_dead_lettered(context.event_id, context.correlation_id, &reason)
            .await;
        self.push_recent(context, &outbound, DeliveryStatus::Failed, Some(reason));
        Ok(DeliveryOutcome::DeadLettered)
    }

    fn push_recent(
        &self,
        context: &ProcessingContext,
        outbound: &OutboundEvent,
        status: DeliveryStatus,
        error: Option<String>,
    ) {
        let recent = RecentEvent {
            event_id: context.event_id,
            correlation_id: context.correlation_id,
            title: outbound.title.clone(),
            severity: outbound.severity.to_string(),
            status,
            source_file: context.source_file.clone(),
            timestamp: Utc::now(),
            error,
        };

        {
            let mut ring = self
                .recent
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            ring.push_front(recent.clone());
            ring.truncate(RECENT_EVENTS_CAPACITY);
        }
        self.notifier.publish(PushMessage::RecentEvent(recent));
    }

    fn publish_statistics(&self) {
        let statistics = self.stats.snapshot();
        let snapshot = MetricsSnapshot {
            throughput: statistics.total as f64,
            success_rate: statistics.success_rate,
            error_rate: statistics.failure_rate,
            retry_count: statistics.retries as f64,
            dlq_size: self.dead_letters.size() as f64,
            circuit_breaker_state: self.breaker.state().gauge_value(),
        };
        self.notifier.publish(PushMessage::Stats(statistics));

        let rules = self.settings.borrow().alert_rules.clone();
        for alert in evaluate(&rules, &snapshot) {
            self.notifier.publish(PushMessage::Alert(alert));
        }
    }
}

fn replay_source(metadata: Option<&Map<String, Value>>) -> String {
    let origin = metadata
        .and_then(|metadata| metadata.get("sourceFile"))
        .and_then(Value::as_str)
        .map(|source| {
            source
                .strip_prefix(DEAD_LETTER_SOURCE)
                .and_then(|rest| rest.strip_prefix(':'))
                .unwrap_or(source)
        });

    match origin {
        Some(origin) if origin != DEAD_LETTER_SOURCE && !origin.is_empty() => {
            format!("{DEAD_LETTER_SOURCE}:{origin}")
        }
        _ => DEAD_LETTER_SOURCE.to_owned(),
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_replay_source() {
        let metadata = |value: Value| match value {
            Value::Object(map) => map,
            _ => unreachable!(),
        };

        assert_eq!(replay_source(None), "dlq");
        assert_eq!(
            replay_source(Some(&metadata(json!({"sourceFile": "/in/alerts.xml"})))),
            "dlq:/in/alerts.xml"
        );
        assert_eq!(
            replay_source(Some(&metadata(json!({"sourceFile": "dlq:/in/alerts.xml"})))),
            "dlq:/in/alerts.xml"
        );
        assert_eq!(
            replay_source(Some(&metadata(json!({"sourceFile": "dlq"})))),
            "dlq"
        );
    }
}
