use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;

use crate::broker::{Consumer, Delivery};
use crate::error::{PluginError, Result};
use crate::metrics::PluginMetrics;
use crate::plugin::PluginEvent;
use crate::registry::QueueRegistry;

/// Which event an inbound message turns into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InboundKind {
    Data,
    Log,
}

impl InboundKind {
    fn event(&self, payload: Value) -> PluginEvent {
        match self {
            InboundKind::Data => PluginEvent::Data(payload),
            InboundKind::Log => PluginEvent::Log(payload),
        }
    }
}

/// Decode inbound bytes: UTF-8 text holding one JSON value.
pub fn decode(content: &[u8]) -> Result<Value> {
    let text = std::str::from_utf8(content)
        .map_err(|e| PluginError::Decode(format!("payload is not UTF-8: {e}")))?;
    serde_json::from_str(text).map_err(|e| PluginError::Decode(format!("payload is not JSON: {e}")))
}

/// Moves messages from input queues to the host as events.
///
/// One task per input queue keeps that queue's arrival order. Messages are
/// taken off the broker as soon as they arrive (auto-ack); one that fails
/// to decode is logged, counted and dropped with no redelivery.
#[derive(Clone)]
pub struct MessageRelay {
    kind: InboundKind,
    events: mpsc::UnboundedSender<PluginEvent>,
    metrics: Arc<PluginMetrics>,
}

impl MessageRelay {
    pub fn new(
        kind: InboundKind,
        events: mpsc::UnboundedSender<PluginEvent>,
        metrics: Arc<PluginMetrics>,
    ) -> Self {
        Self {
            kind,
            events,
            metrics,
        }
    }

    /// Register a consumer on every input queue.
    ///
    /// All or nothing: if any registration fails, the relay tasks already
    /// started are aborted before the error is returned.
    pub async fn attach(
        &self,
        registry: &QueueRegistry,
        inputs: &[String],
        per_call: Duration,
    ) -> Result<Vec<JoinHandle<()>>> {
        let mut tasks: Vec<JoinHandle<()>> = Vec::with_capacity(inputs.len());

        for name in inputs {
            let consumer = match self.register(registry, name, per_call).await {
                Ok(consumer) => consumer,
                Err(e) => {
                    for task in &tasks {
                        task.abort();
                    }
                    return Err(e);
                }
            };

            let relay = self.clone();
            let queue = name.clone();
            tasks.push(tokio::spawn(async move {
                relay.run(queue, consumer).await;
            }));
        }

        tracing::info!(inputs = ?inputs, "Input pipes consumed");
        Ok(tasks)
    }

    async fn register(
        &self,
        registry: &QueueRegistry,
        name: &str,
        per_call: Duration,
    ) -> Result<Consumer> {
        let queue = registry.get(name)?;
        timeout(per_call, queue.consume())
            .await
            .map_err(|_| PluginError::Timeout {
                operation: format!("consuming queue '{name}'"),
                after: per_call,
            })?
    }

    async fn run(self, queue: String, mut consumer: Consumer) {
        while let Some(delivery) = consumer.recv().await {
            if !self.handle(delivery) {
                break;
            }
        }
        tracing::debug!(queue = %queue, "Relay stopped");
    }

    /// Returns false once nobody listens for events any more.
    pub fn handle(&self, delivery: Delivery) -> bool {
        self.metrics.record_received();

        let payload = match decode(&delivery.content) {
            Ok(payload) => payload,
            Err(e) => {
                self.metrics.record_decode_error();
                tracing::warn!(
                    queue = %delivery.queue,
                    delivery_tag = delivery.delivery_tag,
                    error = %e,
                    "Dropping undecodable message"
                );
                return true;
            }
        };

        if self.events.send(self.kind.event(payload)).is_err() {
            tracing::debug!(queue = %delivery.queue, "Event receiver dropped");
            return false;
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use chrono::Utc;
    use serde_json::json;

    fn delivery(content: &'static [u8]) -> Delivery {
        Delivery {
            queue: "in".into(),
            delivery_tag: 1,
            content: Bytes::from_static(content),
            received_at: Utc::now(),
        }
    }

    #[test]
    fn test_decode() {
        assert_eq!(decode(br#"{"a": [1, 2]}"#).unwrap(), json!({"a": [1, 2]}));
        assert_eq!(decode(b"\"text\"").unwrap(), json!("text"));
        assert!(matches!(decode(b"{broken"), Err(PluginError::Decode(_))));
        assert!(matches!(decode(&[0xff, 0xfe]), Err(PluginError::Decode(_))));
    }

    #[test]
    fn test_handle_emits_kind_specific_event() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let metrics = Arc::new(PluginMetrics::new());
        let relay = MessageRelay::new(InboundKind::Log, tx, metrics.clone());

        assert!(relay.handle(delivery(br#"{"msg": "hi"}"#)));
        match rx.try_recv().unwrap() {
            PluginEvent::Log(payload) => assert_eq!(payload, json!({"msg": "hi"})),
            other => panic!("Expected Log event, got {other:?}"),
        }
        assert_eq!(metrics.messages_received.get(), 1);
    }

    #[test]
    fn test_handle_drops_bad_payload() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let metrics = Arc::new(PluginMetrics::new());
        let relay = MessageRelay::new(InboundKind::Data, tx, metrics.clone());

        assert!(relay.handle(delivery(b"not json")));
        assert!(rx.try_recv().is_err());
        assert_eq!(metrics.decode_errors.get(), 1);
    }

    #[test]
    fn test_handle_reports_closed_receiver() {
        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);
        let relay = MessageRelay::new(InboundKind::Data, tx, Arc::new(PluginMetrics::new()));
        assert!(!relay.handle(delivery(b"{}")));
    }
}
