use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use dashmap::{DashMap, DashSet};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};

use super::{Broker, BrokerConnection, Consumer, Delivery, QueueHandle};
use crate::error::{BrokerError, Result};

/// In-process broker.
///
/// Queues live as long as the broker value (clones share them). Each queue
/// keeps FIFO order, hands deliveries to its consumers round-robin and parks
/// them while nobody consumes. Faults can be switched on per queue so
/// callers can exercise failure paths without a real broker.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    inner: Arc<MemoryInner>,
}

#[derive(Default)]
struct MemoryInner {
    queues: DashMap<String, Arc<MemoryQueue>>,
    declare_counts: DashMap<String, usize>,
    connections: AtomicUsize,
    refuse_connections: AtomicBool,
    failing_declares: DashSet<String>,
    failing_consumes: DashSet<String>,
    failing_publishes: DashSet<String>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent `connect` fail.
    pub fn refuse_connections(&self, refuse: bool) {
        self.inner.refuse_connections.store(refuse, Ordering::SeqCst);
    }

    pub fn fail_declare(&self, queue: &str) {
        self.inner.failing_declares.insert(queue.to_string());
    }

    pub fn fail_consume(&self, queue: &str) {
        self.inner.failing_consumes.insert(queue.to_string());
    }

    pub fn fail_publish(&self, queue: &str) {
        self.inner.failing_publishes.insert(queue.to_string());
    }

    pub fn heal_publish(&self, queue: &str) {
        self.inner.failing_publishes.remove(queue);
    }

    pub fn connection_count(&self) -> usize {
        self.inner.connections.load(Ordering::SeqCst)
    }

    /// How many times `name` has been declared across all connections.
    pub fn declare_count(&self, name: &str) -> usize {
        self.inner.declare_counts.get(name).map(|c| *c).unwrap_or(0)
    }

    pub fn has_queue(&self, name: &str) -> bool {
        self.inner.queues.contains_key(name)
    }

    /// Every payload successfully published to `name`, oldest first.
    pub async fn published(&self, name: &str) -> Vec<Bytes> {
        match self.inner.queue(name) {
            Some(queue) => queue.history.lock().await.clone(),
            None => Vec::new(),
        }
    }

    /// Published payloads of `name` decoded as JSON.
    pub async fn published_json(&self, name: &str) -> Vec<serde_json::Value> {
        self.published(name)
            .await
            .iter()
            .filter_map(|payload| serde_json::from_slice(payload).ok())
            .collect()
    }

    /// Push a message onto `name` as an outside producer would.
    pub async fn deliver(&self, name: &str, payload: impl Into<Bytes>) -> Result<()> {
        let queue = self.inner.queue_or_create(name);
        queue.enqueue(payload.into()).await;
        Ok(())
    }
}

impl MemoryInner {
    fn queue(&self, name: &str) -> Option<Arc<MemoryQueue>> {
        self.queues.get(name).map(|q| q.clone())
    }

    fn queue_or_create(self: &Arc<Self>, name: &str) -> Arc<MemoryQueue> {
        self.queues
            .entry(name.to_string())
            .or_insert_with(|| {
                Arc::new(MemoryQueue {
                    name: name.to_string(),
                    broker: Arc::downgrade(self),
                    state: Mutex::new(QueueState::default()),
                    history: Mutex::new(Vec::new()),
                })
            })
            .clone()
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn connect(&self, uri: &str) -> Result<Arc<dyn BrokerConnection>> {
        if !uri.starts_with("memory://") {
            return Err(BrokerError::UnsupportedScheme(uri.to_string()).into());
        }
        if self.inner.refuse_connections.load(Ordering::SeqCst) {
            return Err(BrokerError::ConnectionFailed(format!("{uri} refused the connection")).into());
        }

        self.inner.connections.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(MemoryConnection {
            inner: self.inner.clone(),
            closed: AtomicBool::new(false),
        }))
    }
}

pub struct MemoryConnection {
    inner: Arc<MemoryInner>,
    closed: AtomicBool,
}

#[async_trait]
impl BrokerConnection for MemoryConnection {
    async fn declare_queue(&self, name: &str) -> Result<Arc<dyn QueueHandle>> {
        if self.is_closed() {
            return Err(BrokerError::Closed.into());
        }
        if self.inner.failing_declares.contains(name) {
            return Err(BrokerError::DeclareFailed {
                queue: name.to_string(),
                reason: "declaration rejected".into(),
            }
            .into());
        }

        *self.inner.declare_counts.entry(name.to_string()).or_insert(0) += 1;
        Ok(self.inner.queue_or_create(name))
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[derive(Default)]
struct QueueState {
    pending: VecDeque<Delivery>,
    consumers: Vec<mpsc::UnboundedSender<Delivery>>,
    next_consumer: usize,
    next_tag: u64,
}

pub struct MemoryQueue {
    name: String,
    broker: std::sync::Weak<MemoryInner>,
    state: Mutex<QueueState>,
    history: Mutex<Vec<Bytes>>,
}

impl MemoryQueue {
    fn faulty(&self, pick: impl Fn(&MemoryInner) -> &DashSet<String>) -> bool {
        self.broker
            .upgrade()
            .map(|inner| pick(&*inner).contains(&self.name))
            .unwrap_or(false)
    }

    async fn enqueue(&self, content: Bytes) {
        self.history.lock().await.push(content.clone());

        let mut state = self.state.lock().await;
        state.next_tag += 1;
        let mut delivery = Delivery {
            queue: self.name.clone(),
            delivery_tag: state.next_tag,
            content,
            received_at: Utc::now(),
        };

        state.consumers.retain(|tx| !tx.is_closed());
        while !state.consumers.is_empty() {
            let index = state.next_consumer % state.consumers.len();
            state.next_consumer = state.next_consumer.wrapping_add(1);
            match state.consumers[index].send(delivery) {
                Ok(()) => return,
                Err(mpsc::error::SendError(returned)) => {
                    state.consumers.remove(index);
                    delivery = returned;
                }
            }
        }

        state.pending.push_back(delivery);
    }
}

#[async_trait]
impl QueueHandle for MemoryQueue {
    fn name(&self) -> &str {
        &self.name
    }

    async fn publish(&self, payload: Bytes) -> Result<()> {
        if self.faulty(|inner| &inner.failing_publishes) {
            return Err(BrokerError::PublishFailed {
                queue: self.name.clone(),
                reason: "publish rejected".into(),
            }
            .into());
        }

        self.enqueue(payload).await;
        Ok(())
    }

    async fn consume(&self) -> Result<Consumer> {
        if self.faulty(|inner| &inner.failing_consumes) {
            return Err(BrokerError::ConsumeFailed {
                queue: self.name.clone(),
                reason: "consumer registration rejected".into(),
            }
            .into());
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.state.lock().await;
        while let Some(delivery) = state.pending.pop_front() {
            // rx is alive, send cannot fail here
            let _ = tx.send(delivery);
        }
        state.consumers.push(tx);

        tracing::debug!(queue = %self.name, consumer_tag = %uuid::Uuid::new_v4(), "Consumer attached");
        Ok(rx)
    }
}
