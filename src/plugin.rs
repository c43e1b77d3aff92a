//! Unified pipeline plugin
//!
//! One type covers the connector, logger and service shapes. Construction is
//! cheap and synchronous; [`PipelinePlugin::initialize`] then walks the setup
//! stages strictly in order:
//!
//! 1. parse the opaque host configuration
//! 2. connect to the broker
//! 3. declare every queue in the routing table (once per distinct name)
//! 4. attach a consumer to each input queue
//!
//! The first failing stage ends setup for good. `log`, `log_exception` and
//! `pipe` refuse to run with [`PluginError::NotReady`] until every stage has
//! succeeded.

use serde_json::Value;
use std::sync::{Arc, OnceLock};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;

use crate::broker::{Broker, BrokerConnection};
use crate::config::{self, PluginSettings, RawConfig};
use crate::error::{BrokerError, ConfigError, PluginError, Result};
use crate::lifecycle::{Lifecycle, LifecycleStage, LifecycleState};
use crate::merger::OutputMerger;
use crate::metrics::PluginMetrics;
use crate::publisher::{ExceptionEntry, Publisher};
use crate::registry::QueueRegistry;
use crate::relay::{InboundKind, MessageRelay};
use crate::routing::RoutingTable;

pub use crate::config::PluginVariant;

/// Everything a plugin tells its host.
#[derive(Debug, Clone, PartialEq)]
pub enum PluginEvent {
    /// Fired once, after the last setup stage succeeded.
    Ready,
    /// Decoded inbound message (connector and service variants).
    Data(Value),
    /// Decoded inbound message (logger variant).
    Log(Value),
    /// Setup stopped at `stage`; the instance is unusable.
    Failed { stage: LifecycleStage, error: String },
}

pub struct PipelinePlugin {
    name: String,
    settings: PluginSettings,
    routing: Arc<RoutingTable>,
    merger: Option<OutputMerger>,
    broker: Arc<dyn Broker>,
    lifecycle: Lifecycle,
    metrics: Arc<PluginMetrics>,
    events: mpsc::UnboundedSender<PluginEvent>,

    // Written once during setup, read-only afterwards.
    host_config: OnceLock<Value>,
    connection: OnceLock<Arc<dyn BrokerConnection>>,
    publisher: OnceLock<Publisher>,
    relay_tasks: OnceLock<Vec<JoinHandle<()>>>,
}

impl PipelinePlugin {
    /// Build an instance in the `Start` state.
    ///
    /// Settings are validated here, so an unknown output scheme or a service
    /// without one is rejected before anything touches the broker.
    pub fn new(
        settings: PluginSettings,
        broker: Arc<dyn Broker>,
    ) -> Result<(Arc<Self>, mpsc::UnboundedReceiver<PluginEvent>)> {
        config::validate(&settings)?;

        let merger = match (settings.variant, settings.output_scheme()?) {
            (PluginVariant::Service, Some(scheme)) => Some(OutputMerger::new(scheme)),
            (PluginVariant::Service, None) => {
                return Err(ConfigError::MissingField("output_scheme".into()).into())
            }
            (_, _) => None,
        };

        let name = format!(
            "{}:{}",
            settings.variant,
            settings.input_pipes.first().map(String::as_str).unwrap_or("-")
        );
        let routing = Arc::new(RoutingTable::from_settings(&settings));
        let (events, events_rx) = mpsc::unbounded_channel();

        let plugin = Arc::new(Self {
            lifecycle: Lifecycle::new(name.clone()),
            name,
            settings,
            routing,
            merger,
            broker,
            metrics: Arc::new(PluginMetrics::new()),
            events,
            host_config: OnceLock::new(),
            connection: OnceLock::new(),
            publisher: OnceLock::new(),
            relay_tasks: OnceLock::new(),
        });

        Ok((plugin, events_rx))
    }

    /// Run every setup stage. Only the first call does anything; later
    /// calls fail with `InvalidStateTransition`.
    ///
    /// On failure the instance moves to `Failed`, a [`PluginEvent::Failed`]
    /// is emitted and the stage's own error is returned.
    pub async fn initialize(&self) -> Result<()> {
        self.lifecycle.begin().await?;
        tracing::info!(plugin = %self.name, variant = %self.variant(), "Plugin init process started");

        match self.run_stages().await {
            Ok(()) => {
                self.lifecycle.mark_ready().await?;
                self.metrics.record_ready();
                let _ = self.events.send(PluginEvent::Ready);
                tracing::info!(plugin = %self.name, "Plugin init process done");
                Ok(())
            }
            Err((stage, error)) => {
                self.lifecycle.mark_failed(stage, error.to_string()).await;
                self.metrics.record_setup_failure();
                let _ = self.events.send(PluginEvent::Failed {
                    stage,
                    error: error.to_string(),
                });
                Err(error)
            }
        }
    }

    async fn run_stages(&self) -> std::result::Result<(), (LifecycleStage, PluginError)> {
        let per_call = self.settings.setup_timeout();

        // 1. host configuration
        let stage = LifecycleStage::ParseConfig;
        let host_config = parse_host_config(&self.settings.config).map_err(at(stage))?;
        let _ = self.host_config.set(host_config);
        self.lifecycle.complete(stage).await.map_err(at(stage))?;

        // 2. broker connection
        let stage = LifecycleStage::ConnectBroker;
        let connection = timeout(per_call, self.broker.connect(&self.settings.broker))
            .await
            .map_err(|_| PluginError::Timeout {
                operation: "connecting to the broker".into(),
                after: per_call,
            })
            .and_then(|connected| connected)
            .map_err(at(stage))?;
        tracing::info!(plugin = %self.name, "Connected to broker");
        let _ = self.connection.set(connection.clone());
        self.lifecycle.complete(stage).await.map_err(at(stage))?;

        // 3. queues
        let stage = LifecycleStage::DeclareQueues;
        let registry = QueueRegistry::declare_all(connection.as_ref(), &self.routing, per_call)
            .await
            .map_err(at(stage))?;
        let registry = Arc::new(registry);
        tracing::info!(
            plugin = %self.name,
            queues = ?registry.names().collect::<Vec<_>>(),
            "Connected to queues"
        );
        let _ = self.publisher.set(Publisher::new(
            registry.clone(),
            self.routing.clone(),
            self.settings.account.clone(),
            self.settings.publish_timeout(),
            self.metrics.clone(),
        ));
        self.lifecycle.complete(stage).await.map_err(at(stage))?;

        // 4. consumers
        let stage = LifecycleStage::AttachConsumers;
        let relay = MessageRelay::new(self.inbound_kind(), self.events.clone(), self.metrics.clone());
        let tasks = relay
            .attach(&registry, self.routing.inputs(), per_call)
            .await
            .map_err(at(stage))?;
        let _ = self.relay_tasks.set(tasks);
        self.lifecycle.complete(stage).await.map_err(at(stage))?;

        Ok(())
    }

    /// Wait until setup has finished one way or the other.
    pub async fn wait_ready(&self) -> Result<()> {
        let mut watch = self.lifecycle.subscribe();
        let settled = watch
            .wait_for(LifecycleState::is_terminal)
            .await
            .map(|state| (*state).clone());

        match settled {
            Ok(LifecycleState::Ready { .. }) => Ok(()),
            Ok(LifecycleState::Failed { stage, error }) => {
                Err(PluginError::SetupFailed { stage, reason: error })
            }
            Ok(other) => Err(PluginError::NotReady(other.name().to_string())),
            Err(_) => Err(PluginError::NotReady("lifecycle closed".into())),
        }
    }

    /// Forward a string or record to the logger queues and the shared `logs` queue.
    pub async fn log(&self, data: &Value) -> Result<()> {
        self.publisher().await?.log(data).await.map(|_| ())
    }

    /// Forward a Rust error to the exception-logger queues and the shared
    /// `exceptions` queue.
    pub async fn log_exception<E>(&self, err: &E) -> Result<()>
    where
        E: std::error::Error + ?Sized,
    {
        let publisher = self.publisher().await?;
        let entry = ExceptionEntry::from_error(err)?;
        publisher.log_exception(&entry).await.map(|_| ())
    }

    /// Like [`log_exception`](Self::log_exception) for an error record that
    /// arrived as JSON.
    pub async fn log_exception_value(&self, err: &Value) -> Result<()> {
        let publisher = self.publisher().await?;
        let entry = ExceptionEntry::from_value(err)?;
        publisher.log_exception(&entry).await.map(|_| ())
    }

    /// Combine `original` and `result` per the output scheme and publish the
    /// outcome to every output queue. Service variant only.
    pub async fn pipe(&self, original: &Value, result: &Value) -> Result<()> {
        let publisher = self.publisher().await?;
        let merger = self
            .merger
            .as_ref()
            .ok_or_else(|| PluginError::PipeUnsupported(self.variant().to_string()))?;

        let output = merger.merge(original, result)?;
        let payload = bytes::Bytes::from(serde_json::to_vec(&output)?);

        publisher
            .publish_to(self.routing.outputs(), payload)
            .await
            .map(|report| {
                self.metrics.record_pipe();
                tracing::debug!(
                    plugin = %self.name,
                    scheme = %merger.scheme(),
                    targets = report.attempted(),
                    "Result piped"
                );
            })
    }

    async fn publisher(&self) -> Result<&Publisher> {
        self.lifecycle.ensure_ready().await?;
        if self.connection.get().is_some_and(|c| c.is_closed()) {
            return Err(BrokerError::Closed.into());
        }
        self.publisher
            .get()
            .ok_or_else(|| PluginError::NotReady("publisher missing".into()))
    }

    /// Stop relaying and close the broker connection. The lifecycle state is
    /// left alone, but every later `log`, `log_exception` or `pipe` fails
    /// with `BrokerError::Closed`; there is no way to start it again.
    pub async fn close(&self) -> Result<()> {
        if let Some(tasks) = self.relay_tasks.get() {
            for task in tasks {
                task.abort();
            }
        }
        if let Some(connection) = self.connection.get() {
            connection.close().await?;
        }
        tracing::info!(plugin = %self.name, "Plugin closed");
        Ok(())
    }

    fn inbound_kind(&self) -> InboundKind {
        match self.variant() {
            PluginVariant::Logger => InboundKind::Log,
            PluginVariant::Connector | PluginVariant::Service => InboundKind::Data,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn variant(&self) -> PluginVariant {
        self.settings.variant
    }

    pub fn settings(&self) -> &PluginSettings {
        &self.settings
    }

    pub fn routing(&self) -> &RoutingTable {
        &self.routing
    }

    pub fn metrics(&self) -> &Arc<PluginMetrics> {
        &self.metrics
    }

    /// The parsed host configuration, once the config stage has run.
    pub fn config(&self) -> Option<&Value> {
        self.host_config.get()
    }

    pub async fn state(&self) -> LifecycleState {
        self.lifecycle.current().await
    }

    pub async fn is_ready(&self) -> bool {
        self.lifecycle.is_ready().await
    }
}

impl Drop for PipelinePlugin {
    fn drop(&mut self) {
        if let Some(tasks) = self.relay_tasks.get() {
            for task in tasks {
                task.abort();
            }
        }
    }
}

fn at(stage: LifecycleStage) -> impl Fn(PluginError) -> (LifecycleStage, PluginError) {
    move |error| (stage, error)
}

fn parse_host_config(raw: &RawConfig) -> Result<Value> {
    match raw {
        RawConfig::Text(text) => serde_json::from_str(text)
            .map_err(|e| ConfigError::Parse(format!("config is not valid JSON: {e}")).into()),
        RawConfig::Structured(value) => Ok(value.clone()),
    }
}
