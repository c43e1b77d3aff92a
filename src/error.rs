use std::time::Duration;
use thiserror::Error;

use crate::lifecycle::LifecycleStage;
use crate::publisher::PublishReport;

#[derive(Error, Debug)]
pub enum PluginError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Broker error: {0}")]
    Broker(#[from] BrokerError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Plugin not ready (state: {0})")]
    NotReady(String),

    #[error("Setup failed during {stage}: {reason}")]
    SetupFailed { stage: LifecycleStage, reason: String },

    #[error("Invalid state transition from {from} to {to}")]
    InvalidStateTransition { from: String, to: String },

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Publish failed: {0}")]
    Publish(PublishReport),

    #[error("Queue '{0}' was never declared")]
    UnknownQueue(String),

    #[error("pipe is not supported by the {0} variant")]
    PipeUnsupported(String),

    #[error("Decode error: {0}")]
    Decode(String),

    #[error("{operation} timed out after {after:?}")]
    Timeout { operation: String, after: Duration },
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Unknown output scheme '{0}' (expected MERGE, NAMESPACE or RESULT)")]
    UnknownOutputScheme(String),

    #[error("Environment variable error: {0}")]
    EnvVar(String),
}

#[derive(Error, Debug)]
pub enum BrokerError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Unsupported broker scheme: {0}")]
    UnsupportedScheme(String),

    #[error("Failed to declare queue '{queue}': {reason}")]
    DeclareFailed { queue: String, reason: String },

    #[error("Failed to consume queue '{queue}': {reason}")]
    ConsumeFailed { queue: String, reason: String },

    #[error("Failed to publish to queue '{queue}': {reason}")]
    PublishFailed { queue: String, reason: String },

    #[error("Broker connection closed")]
    Closed,
}

pub type Result<T> = std::result::Result<T, PluginError>;
