use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;
use tokio::sync::{watch, Mutex};

use crate::error::PluginError;

/// The ordered setup phases a plugin walks through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum LifecycleStage {
    ParseConfig,
    ConnectBroker,
    DeclareQueues,
    AttachConsumers,
}

impl LifecycleStage {
    pub const ALL: [LifecycleStage; 4] = [
        LifecycleStage::ParseConfig,
        LifecycleStage::ConnectBroker,
        LifecycleStage::DeclareQueues,
        LifecycleStage::AttachConsumers,
    ];

    /// State reached once this stage completes.
    pub fn completes_into(&self) -> LifecycleState {
        match self {
            LifecycleStage::ParseConfig => LifecycleState::ConfigParsed,
            LifecycleStage::ConnectBroker => LifecycleState::BrokerConnected,
            LifecycleStage::DeclareQueues => LifecycleState::QueuesDeclared,
            LifecycleStage::AttachConsumers => LifecycleState::ConsumersAttached,
        }
    }

    /// State the machine must be in for this stage to start.
    pub fn starts_from(&self) -> LifecycleState {
        match self {
            LifecycleStage::ParseConfig => LifecycleState::Start,
            LifecycleStage::ConnectBroker => LifecycleState::ConfigParsed,
            LifecycleStage::DeclareQueues => LifecycleState::BrokerConnected,
            LifecycleStage::AttachConsumers => LifecycleState::QueuesDeclared,
        }
    }
}

impl fmt::Display for LifecycleStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LifecycleStage::ParseConfig => "config parsing",
            LifecycleStage::ConnectBroker => "broker connection",
            LifecycleStage::DeclareQueues => "queue declaration",
            LifecycleStage::AttachConsumers => "consumer attachment",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleState {
    Start,
    ConfigParsed,
    BrokerConnected,
    QueuesDeclared,
    ConsumersAttached,
    Ready { ready_at: Instant },
    /// Terminal; there is no way back to `Start`.
    Failed { stage: LifecycleStage, error: String },
}

impl LifecycleState {
    pub fn name(&self) -> &'static str {
        match self {
            LifecycleState::Start => "Start",
            LifecycleState::ConfigParsed => "ConfigParsed",
            LifecycleState::BrokerConnected => "BrokerConnected",
            LifecycleState::QueuesDeclared => "QueuesDeclared",
            LifecycleState::ConsumersAttached => "ConsumersAttached",
            LifecycleState::Ready { .. } => "Ready",
            LifecycleState::Failed { .. } => "Failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            LifecycleState::Ready { .. } | LifecycleState::Failed { .. }
        )
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Guarded state holder for one plugin instance.
///
/// Every transition checks the current state first, so stages can only be
/// completed in order, `Ready` only follows `ConsumersAttached`, and neither
/// terminal state can be left. Watchers see each change.
pub struct Lifecycle {
    state: Mutex<LifecycleState>,
    watch_tx: watch::Sender<LifecycleState>,
    started: AtomicBool,
    plugin_name: String,
}

impl Lifecycle {
    pub fn new(plugin_name: impl Into<String>) -> Self {
        let (watch_tx, _) = watch::channel(LifecycleState::Start);
        Self {
            state: Mutex::new(LifecycleState::Start),
            watch_tx,
            started: AtomicBool::new(false),
            plugin_name: plugin_name.into(),
        }
    }

    pub async fn current(&self) -> LifecycleState {
        self.state.lock().await.clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<LifecycleState> {
        self.watch_tx.subscribe()
    }

    pub async fn is_ready(&self) -> bool {
        matches!(*self.state.lock().await, LifecycleState::Ready { .. })
    }

    /// Claim the right to run setup. Only one caller ever gets past `Start`.
    pub async fn begin(&self) -> Result<(), PluginError> {
        let state = self.state.lock().await;
        if *state != LifecycleState::Start || self.started.swap(true, Ordering::SeqCst) {
            return Err(PluginError::InvalidStateTransition {
                from: state.name().to_string(),
                to: LifecycleState::ConfigParsed.name().to_string(),
            });
        }
        Ok(())
    }

    /// Record that `stage` finished.
    pub async fn complete(&self, stage: LifecycleStage) -> Result<(), PluginError> {
        let mut state = self.state.lock().await;
        if *state != stage.starts_from() {
            return Err(PluginError::InvalidStateTransition {
                from: state.name().to_string(),
                to: stage.completes_into().name().to_string(),
            });
        }

        *state = stage.completes_into();
        tracing::info!(
            plugin = %self.plugin_name,
            stage = %stage,
            state = %state.name(),
            "Setup stage completed"
        );
        self.watch_tx.send_replace(state.clone());
        Ok(())
    }

    pub async fn mark_ready(&self) -> Result<(), PluginError> {
        let mut state = self.state.lock().await;
        match *state {
            LifecycleState::ConsumersAttached => {
                *state = LifecycleState::Ready {
                    ready_at: Instant::now(),
                };
                tracing::info!(plugin = %self.plugin_name, "Plugin ready");
                self.watch_tx.send_replace(state.clone());
                Ok(())
            }
            _ => Err(PluginError::InvalidStateTransition {
                from: state.name().to_string(),
                to: "Ready".to_string(),
            }),
        }
    }

    /// Move to `Failed` unless already `Ready`; failing twice keeps the first cause.
    pub async fn mark_failed(&self, stage: LifecycleStage, error: String) {
        let mut state = self.state.lock().await;
        if state.is_terminal() {
            return;
        }

        tracing::error!(
            plugin = %self.plugin_name,
            stage = %stage,
            from = %state.name(),
            error = %error,
            "Plugin setup failed"
        );
        *state = LifecycleState::Failed { stage, error };
        self.watch_tx.send_replace(state.clone());
    }

    /// Fail with `NotReady` unless the instance has reached `Ready`.
    pub async fn ensure_ready(&self) -> Result<(), PluginError> {
        let state = self.state.lock().await;
        match *state {
            LifecycleState::Ready { .. } => Ok(()),
            ref other => Err(PluginError::NotReady(other.name().to_string())),
        }
    }
}
