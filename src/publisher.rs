//! Fan-out of log and exception records
//!
//! Every record goes to two groups at once: the instance's own logger
//! queues (record as-is) and the shared queue (record wrapped with the
//! account). All publishes run concurrently and the call settles when the
//! last one does. Nothing is rolled back: if one target fails the others may
//! already hold the record, and the returned [`PublishReport`] says which.

use bytes::Bytes;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::timeout;

use crate::broker::QueueHandle;
use crate::error::{PluginError, Result};
use crate::merger::is_empty_value;
use crate::metrics::PluginMetrics;
use crate::registry::QueueRegistry;
use crate::routing::{RoutingTable, EXCEPTIONS_QUEUE, LOGS_QUEUE};

/// Record as it lands on a shared queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope<T> {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub account: Option<String>,
    pub data: T,
}

pub type LogEntry = Envelope<Value>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExceptionEntry {
    pub name: String,
    pub message: String,
    pub stack: Option<String>,
}

impl ExceptionEntry {
    /// Describe a Rust error: the concrete type name, its message, and its
    /// `source()` chain as the stack.
    pub fn from_error<E>(err: &E) -> Result<Self>
    where
        E: std::error::Error + ?Sized,
    {
        let name = short_type_name(std::any::type_name::<E>());
        let message = err.to_string();
        if message.is_empty() {
            return Err(PluginError::Validation(
                "Please specify a valid error to log.".into(),
            ));
        }

        let mut stack = format!("{name}: {message}");
        let mut source = err.source();
        while let Some(cause) = source {
            stack.push_str(&format!("\n    caused by: {cause}"));
            source = cause.source();
        }

        Ok(Self {
            name,
            message,
            stack: Some(stack),
        })
    }

    /// Accept a JSON error record: an object with a non-empty string
    /// `message`, an optional string `name` (defaults to `Error`) and an
    /// optional string `stack`.
    pub fn from_value(value: &Value) -> Result<Self> {
        let invalid = || PluginError::Validation("Please specify a valid error to log.".into());

        let record = value.as_object().ok_or_else(invalid)?;
        let message = match record.get("message") {
            Some(Value::String(message)) if !message.is_empty() => message.clone(),
            _ => return Err(invalid()),
        };
        let name = match record.get("name") {
            None | Some(Value::Null) => "Error".to_string(),
            Some(Value::String(name)) if !name.is_empty() => name.clone(),
            _ => return Err(invalid()),
        };
        let stack = match record.get("stack") {
            None | Some(Value::Null) => None,
            Some(Value::String(stack)) => Some(stack.clone()),
            _ => return Err(invalid()),
        };

        Ok(Self {
            name,
            message,
            stack,
        })
    }
}

fn short_type_name(full: &str) -> String {
    let base = full.split('<').next().unwrap_or(full);
    base.rsplit("::").next().unwrap_or(base).to_string()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PublishFailure {
    pub queue: String,
    pub reason: String,
}

/// Outcome of one fan-out, target by target.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PublishReport {
    pub delivered: Vec<String>,
    pub failed: Vec<PublishFailure>,
}

impl PublishReport {
    pub fn attempted(&self) -> usize {
        self.delivered.len() + self.failed.len()
    }

    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

impl fmt::Display for PublishReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} of {} publishes failed",
            self.failed.len(),
            self.attempted()
        )?;
        for (i, failure) in self.failed.iter().enumerate() {
            let sep = if i == 0 { ": " } else { ", " };
            write!(f, "{sep}{} ({})", failure.queue, failure.reason)?;
        }
        Ok(())
    }
}

pub struct Publisher {
    registry: Arc<QueueRegistry>,
    routing: Arc<RoutingTable>,
    account: Option<String>,
    publish_timeout: Duration,
    metrics: Arc<PluginMetrics>,
}

impl Publisher {
    pub fn new(
        registry: Arc<QueueRegistry>,
        routing: Arc<RoutingTable>,
        account: Option<String>,
        publish_timeout: Duration,
        metrics: Arc<PluginMetrics>,
    ) -> Self {
        Self {
            registry,
            routing,
            account,
            publish_timeout,
            metrics,
        }
    }

    /// Forward a string or record to every logger queue and, wrapped with
    /// the account, to the shared `logs` queue.
    pub async fn log(&self, payload: &Value) -> Result<PublishReport> {
        if is_empty_value(payload) {
            return Err(PluginError::Validation("Please specify a data to log.".into()));
        }
        if !payload.is_object() && !payload.is_string() {
            return Err(PluginError::Validation(
                "Log data must be a string or object".into(),
            ));
        }

        let verbatim = Bytes::from(serde_json::to_vec(payload)?);
        let wrapped = self.wrap(payload)?;

        let mut targets = self.targets(self.routing.loggers(), &verbatim)?;
        targets.push((self.registry.get(LOGS_QUEUE)?, wrapped));
        self.fan_out(targets).await
    }

    /// Forward an exception record to every exception-logger queue and,
    /// wrapped with the account, to the shared `exceptions` queue.
    pub async fn log_exception(&self, entry: &ExceptionEntry) -> Result<PublishReport> {
        let verbatim = Bytes::from(serde_json::to_vec(entry)?);
        let wrapped = self.wrap(entry)?;

        let mut targets = self.targets(self.routing.exception_loggers(), &verbatim)?;
        targets.push((self.registry.get(EXCEPTIONS_QUEUE)?, wrapped));
        self.fan_out(targets).await
    }

    /// Publish one payload to each of `queues`.
    pub async fn publish_to(&self, queues: &[String], payload: Bytes) -> Result<PublishReport> {
        let targets = self.targets(queues, &payload)?;
        self.fan_out(targets).await
    }

    fn wrap<T: Serialize>(&self, data: &T) -> Result<Bytes> {
        let envelope = Envelope {
            account: self.account.clone(),
            data,
        };
        Ok(Bytes::from(serde_json::to_vec(&envelope)?))
    }

    fn targets(
        &self,
        queues: &[String],
        payload: &Bytes,
    ) -> Result<Vec<(Arc<dyn QueueHandle>, Bytes)>> {
        queues
            .iter()
            .map(|name| Ok((self.registry.get(name)?, payload.clone())))
            .collect()
    }

    /// Publish every target concurrently and wait for all of them.
    async fn fan_out(&self, targets: Vec<(Arc<dyn QueueHandle>, Bytes)>) -> Result<PublishReport> {
        let started = Instant::now();
        let limit = self.publish_timeout;

        let attempts = targets.into_iter().map(|(queue, payload)| async move {
            let outcome = match timeout(limit, queue.publish(payload)).await {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => Err(e.to_string()),
                Err(_) => Err(format!("timed out after {limit:?}")),
            };
            (queue.name().to_string(), outcome)
        });

        let mut report = PublishReport::default();
        for (queue, outcome) in join_all(attempts).await {
            match outcome {
                Ok(()) => {
                    tracing::debug!(queue = %queue, "Message written to queue");
                    report.delivered.push(queue);
                }
                Err(reason) => {
                    tracing::error!(queue = %queue, error = %reason, "Publish failed");
                    report.failed.push(PublishFailure { queue, reason });
                }
            }
        }

        self.metrics
            .record_fan_out(started.elapsed(), report.attempted(), report.failed.len());

        if report.is_complete() {
            Ok(report)
        } else {
            Err(PluginError::Publish(report))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{Broker, MemoryBroker};
    use serde_json::json;

    #[derive(Debug, thiserror::Error)]
    #[error("disk full")]
    struct DiskFull;

    #[derive(Debug, thiserror::Error)]
    #[error("could not save report")]
    struct SaveFailed {
        #[source]
        cause: DiskFull,
    }

    fn names(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    async fn build_publisher(broker: &MemoryBroker, routing: RoutingTable) -> Publisher {
        let conn = broker.connect("memory://test").await.unwrap();
        let registry = QueueRegistry::declare_all(conn.as_ref(), &routing, Duration::from_secs(1))
            .await
            .unwrap();
        Publisher::new(
            Arc::new(registry),
            Arc::new(routing),
            Some("acme".into()),
            Duration::from_secs(1),
            Arc::new(PluginMetrics::new()),
        )
    }

    #[test]
    fn test_exception_entry_from_error_chain() {
        let entry = ExceptionEntry::from_error(&SaveFailed { cause: DiskFull }).unwrap();
        assert_eq!(entry.name, "SaveFailed");
        assert_eq!(entry.message, "could not save report");
        assert_eq!(
            entry.stack.as_deref(),
            Some("SaveFailed: could not save report\n    caused by: disk full")
        );
    }

    #[test]
    fn test_exception_entry_from_value() {
        let entry = ExceptionEntry::from_value(&json!({
            "name": "TypeError",
            "message": "x is undefined",
            "stack": "TypeError: x is undefined\n    at main"
        }))
        .unwrap();
        assert_eq!(entry.name, "TypeError");

        let entry = ExceptionEntry::from_value(&json!({"message": "boom"})).unwrap();
        assert_eq!(entry.name, "Error");
        assert_eq!(entry.stack, None);

        for bad in [json!("boom"), json!({}), json!({"message": 5}), json!({"message": ""})] {
            assert!(matches!(
                ExceptionEntry::from_value(&bad),
                Err(PluginError::Validation(_))
            ));
        }
    }

    #[test]
    fn test_exception_entry_serializes_exactly_three_fields() {
        let entry = ExceptionEntry::from_value(&json!({"message": "boom"})).unwrap();
        let value = serde_json::to_value(&entry).unwrap();
        let keys: Vec<_> = value.as_object().unwrap().keys().cloned().collect();
        assert_eq!(keys, vec!["message", "name", "stack"]);
    }

    #[test]
    fn test_report_display() {
        let report = PublishReport {
            delivered: names(&["logs"]),
            failed: vec![PublishFailure {
                queue: "audit".into(),
                reason: "refused".into(),
            }],
        };
        assert_eq!(report.to_string(), "1 of 2 publishes failed: audit (refused)");
    }

    #[tokio::test]
    async fn test_log_fans_out_to_loggers_and_shared_queue() {
        let broker = MemoryBroker::new();
        let routing = RoutingTable::new(names(&["in"]), vec![], names(&["audit", "mirror"]), vec![]);
        let publisher = build_publisher(&broker, routing).await;

        let report = publisher.log(&json!({"level": "info"})).await.unwrap();
        assert_eq!(report.attempted(), 3);

        assert_eq!(broker.published_json("audit").await, vec![json!({"level": "info"})]);
        assert_eq!(broker.published_json("mirror").await, vec![json!({"level": "info"})]);
        assert_eq!(
            broker.published_json(LOGS_QUEUE).await,
            vec![json!({"account": "acme", "data": {"level": "info"}})]
        );
    }

    #[tokio::test]
    async fn test_log_validation() {
        let broker = MemoryBroker::new();
        let publisher = build_publisher(&broker, RoutingTable::new(names(&["in"]), vec![], vec![], vec![])).await;

        for bad in [json!(null), json!(""), json!({}), json!(42), json!([1, 2])] {
            assert!(matches!(
                publisher.log(&bad).await,
                Err(PluginError::Validation(_))
            ));
        }
        assert!(broker.published(LOGS_QUEUE).await.is_empty());
        assert!(publisher.log(&json!("plain text")).await.is_ok());
    }

    #[tokio::test]
    async fn test_partial_failure_is_reported_without_rollback() {
        let broker = MemoryBroker::new();
        let routing = RoutingTable::new(names(&["in"]), vec![], names(&["audit"]), vec![]);
        let publisher = build_publisher(&broker, routing).await;
        broker.fail_publish("audit");

        match publisher.log(&json!("hello")).await {
            Err(PluginError::Publish(report)) => {
                assert_eq!(report.delivered, names(&[LOGS_QUEUE]));
                assert_eq!(report.failed.len(), 1);
                assert_eq!(report.failed[0].queue, "audit");
            }
            other => panic!("Expected Publish error, got {other:?}"),
        }
        assert_eq!(broker.published(LOGS_QUEUE).await.len(), 1);
    }

    #[tokio::test]
    async fn test_log_exception_routes() {
        let broker = MemoryBroker::new();
        let routing = RoutingTable::new(names(&["in"]), vec![], vec![], names(&["errors"]));
        let publisher = build_publisher(&broker, routing).await;

        let entry = ExceptionEntry::from_error(&DiskFull).unwrap();
        publisher.log_exception(&entry).await.unwrap();

        let bare = json!({"name": "DiskFull", "message": "disk full", "stack": "DiskFull: disk full"});
        assert_eq!(broker.published_json("errors").await, vec![bare.clone()]);
        assert_eq!(
            broker.published_json(EXCEPTIONS_QUEUE).await,
            vec![json!({"account": "acme", "data": bare})]
        );
    }
}
