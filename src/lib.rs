pub mod broker;
pub mod commands;
pub mod config;
pub mod error;
pub mod lifecycle;
pub mod merger;
pub mod metrics;
pub mod plugin;
pub mod publisher;
pub mod registry;
pub mod relay;
pub mod routing;

pub use error::{PluginError, Result};
pub use plugin::{PipelinePlugin, PluginEvent};
