//! Cron- and queue-triggered invocations.
//!
//! Neither trigger carries an HTTP request, but both are traced the same way:
//! a start record, the work, a stop record. Queue messages sent with
//! [`Invocation::send_queue`] carry the sender's correlation id and trace
//! level, and each message is handled in an invocation that continues them.

use std::future::Future;

use serde_json::{Value, json};
use tracing::{debug, warn};

use crate::config::TraceLevel;
use crate::error::Error;
use crate::invocation::Invocation;
use crate::service::Service;
use crate::trace::{self, ServiceIdentity};

/// One run of a scheduled job.
pub struct CronRun {
    inv: Invocation,
    schedule: String,
}

impl CronRun {
    pub fn start(service: &Service, schedule: &str) -> Self {
        let inv = service.invocation_as(ServiceIdentity::new(service.config()));
        inv.trace_message(&trace::pretty(&json!({ "cron": schedule })), "cron_start", None);
        Self { inv, schedule: schedule.to_owned() }
    }

    pub fn invocation(&self) -> &Invocation {
        &self.inv
    }

    /// Ends the run, reporting `error` if the job failed.
    pub async fn stop(self, error: Option<&Error>) {
        let error = error.map(|e| {
            warn!(schedule = %self.schedule, "cron job failed: {e}");
            Value::String(self.inv.exception_message(e, &self.schedule, ""))
        });
        self.inv.trace_message(&trace::pretty(&json!({ "cron": self.schedule })), "cron_stop", error);
        self.inv.finish().await;
    }
}

/// A message as [`Invocation::send_queue`] wraps it.
#[derive(Clone, Debug, PartialEq)]
pub struct QueueMessage {
    pub id: Option<String>,
    pub trace: Option<TraceLevel>,
    pub message: Value,
}

impl QueueMessage {
    /// Unwraps `{id, trace, message}`. Anything else is a bare payload.
    pub fn from_value(raw: Value) -> Self {
        match raw {
            Value::Object(mut map) if map.contains_key("message") => {
                let id = map.get("id").and_then(Value::as_str).map(str::to_owned);
                let trace = map.get("trace").and_then(|level| match level {
                    Value::Number(n) => n.as_u64().and_then(|n| u8::try_from(n).ok()).and_then(TraceLevel::try_from_u8),
                    Value::String(s) => TraceLevel::parse_propagated(s),
                    _ => None,
                });
                let message = map.remove("message").unwrap_or(Value::Null);
                Self { id, trace, message }
            }
            other => Self { id: None, trace: None, message: other },
        }
    }
}

/// One delivered batch of a work queue.
pub struct QueueBatch {
    inv: Invocation,
    queue: String,
}

impl QueueBatch {
    pub fn start(service: &Service, queue: &str, size: usize) -> Self {
        let inv = service.invocation_as(ServiceIdentity::new(service.config()));
        inv.trace_message(&trace::pretty(&json!({ "queue": queue, "messages": size })), "queue_start", None);
        Self { inv, queue: queue.to_owned() }
    }

    pub fn invocation(&self) -> &Invocation {
        &self.inv
    }

    /// Runs `handler` on one message in an invocation continuing the sender's
    /// context. A failure is reported and returned.
    pub async fn handle_message<F, Fut>(&self, raw: Value, handler: F) -> crate::Result<()>
    where
        F: FnOnce(Invocation, Value) -> Fut,
        Fut: Future<Output = crate::Result<()>>,
    {
        let message = QueueMessage::from_value(raw);
        let identity = ServiceIdentity::new(self.inv.config()).propagated(message.id.as_deref(), message.trace);
        let inv = self.inv.with_identity(identity);
        debug!(queue = %self.queue, correlation_id = %inv.identity().id, "queue message");

        if inv.identity().trace == TraceLevel::Verbose {
            inv.trace_message(&trace::pretty(&message.message), "queue_handle", None);
        }
        let result = handler(inv.clone(), message.message).await;
        if let Err(e) = &result {
            warn!(queue = %self.queue, "queue message failed: {e}");
            inv.exception_message(e, &self.queue, "");
        }
        inv.finish().await;
        result
    }

    pub async fn stop(self, error: Option<&Error>) {
        let error = error.map(|e| Value::String(self.inv.exception_message(e, &self.queue, "")));
        self.inv.trace_message(&trace::pretty(&json!({ "queue": self.queue })), "queue_stop", error);
        self.inv.finish().await;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use crate::channel::{Channels, MemoryQueue};
    use crate::config::ServiceConfig;

    use super::*;

    fn service(trace: TraceLevel) -> (Service, Arc<MemoryQueue>) {
        let sink = MemoryQueue::new();
        let service = Service::builder("worker")
            .config(ServiceConfig { trace, ..ServiceConfig::default() })
            .channels(Channels { trace: sink.clone(), ..Channels::default() })
            .build()
            .unwrap();
        (service, sink)
    }

    fn kinds(sink: &MemoryQueue) -> Vec<String> {
        sink.messages().iter().map(|r| r["type"].as_str().unwrap_or_default().to_owned()).collect()
    }

    #[test]
    fn unwraps_sent_messages() {
        let message = QueueMessage::from_value(json!({"id": "c-1", "trace": 2, "message": {"n": 1}}));
        assert_eq!(message.id.as_deref(), Some("c-1"));
        assert_eq!(message.trace, Some(TraceLevel::Verbose));
        assert_eq!(message.message, json!({"n": 1}));

        let out_of_range = QueueMessage::from_value(json!({"id": "c-2", "trace": 7, "message": 1}));
        assert_eq!(out_of_range.trace, None);

        let bare = QueueMessage::from_value(json!({"n": 1}));
        assert_eq!(bare.id, None);
        assert_eq!(bare.message, json!({"n": 1}));
    }

    #[tokio::test]
    async fn cron_run_is_traced() {
        let (service, sink) = service(TraceLevel::On);
        let run = CronRun::start(&service, "*/5 * * * *");
        run.stop(None).await;
        assert_eq!(kinds(&sink), ["cron_start", "cron_stop"]);
    }

    #[tokio::test]
    async fn cron_is_silent_at_level_zero() {
        let (service, sink) = service(TraceLevel::Off);
        CronRun::start(&service, "@daily").stop(Some(&Error::Store("down".into()))).await;
        assert!(sink.messages().is_empty());
    }

    #[tokio::test]
    async fn queue_messages_continue_the_sender_context() {
        let (service, sink) = service(TraceLevel::On);
        let batch = QueueBatch::start(&service, "jobs", 1);
        batch
            .handle_message(json!({"id": "c-9", "trace": 2, "message": {"job": 1}}), |inv, payload| async move {
                assert_eq!(inv.identity().id, "c-9");
                assert_eq!(inv.identity().trace, TraceLevel::Verbose);
                assert_eq!(payload, json!({"job": 1}));
                Ok(())
            })
            .await
            .unwrap();
        batch.stop(None).await;

        assert_eq!(kinds(&sink), ["queue_start", "queue_handle", "queue_stop"]);
        let handled = &sink.messages()[1];
        assert_eq!(handled["id"], "c-9");
    }

    #[tokio::test]
    async fn queue_handle_is_verbose_only() {
        let (service, sink) = service(TraceLevel::On);
        let batch = QueueBatch::start(&service, "jobs", 1);
        let result = batch
            .handle_message(json!({"message": 1}), |_, _| async { Err(Error::Validation("bad job".into())) })
            .await;
        assert!(result.is_err());
        batch.stop(None).await;
        assert_eq!(kinds(&sink), ["queue_start", "queue_stop"]);
    }
}
