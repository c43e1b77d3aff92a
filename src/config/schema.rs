use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;
use std::time::Duration;

use crate::error::ConfigError;
use crate::merger::OutputScheme;

/// Which of the three plugin shapes an instance takes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PluginVariant {
    /// Pure ingress: relays inbound messages as `data` events.
    #[default]
    Connector,
    /// Pass-through log relay: inbound messages surface as `log` events.
    Logger,
    /// Processing service: `data` events plus `pipe` to output queues.
    Service,
}

impl PluginVariant {
    pub fn as_str(&self) -> &'static str {
        match self {
            PluginVariant::Connector => "connector",
            PluginVariant::Logger => "logger",
            PluginVariant::Service => "service",
        }
    }

    pub fn supports_pipe(&self) -> bool {
        matches!(self, PluginVariant::Service)
    }
}

impl fmt::Display for PluginVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Opaque host configuration, either still JSON text or already structured.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(untagged)]
pub enum RawConfig {
    Text(String),
    Structured(serde_json::Value),
}

impl Default for RawConfig {
    fn default() -> Self {
        RawConfig::Text("{}".to_string())
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PluginSettings {
    #[serde(default, alias = "plugin_variant")]
    pub variant: PluginVariant,

    /// Broker connection URI
    pub broker: String,

    /// Account identifier stamped on every shared log/exception envelope
    #[serde(default)]
    pub account: Option<String>,

    #[serde(default, alias = "input_pipe", deserialize_with = "queue_list")]
    pub input_pipes: Vec<String>,

    #[serde(default, deserialize_with = "queue_list")]
    pub output_pipes: Vec<String>,

    #[serde(default, deserialize_with = "queue_list")]
    pub loggers: Vec<String>,

    #[serde(default, deserialize_with = "queue_list")]
    pub exception_loggers: Vec<String>,

    #[serde(default)]
    pub config: RawConfig,

    #[serde(default)]
    pub output_scheme: Option<String>,

    #[serde(default)]
    pub output_namespace: Option<String>,

    #[serde(default = "default_setup_timeout")]
    pub setup_timeout_ms: u64,

    #[serde(default = "default_publish_timeout")]
    pub publish_timeout_ms: u64,
}

fn default_setup_timeout() -> u64 {
    30000
}

fn default_publish_timeout() -> u64 {
    30000
}

/// Accepts either `"a,b,c"` (empty segments dropped) or a list of names.
///
/// Environment values arrive typed, so a bare `42` or `true` is taken as the
/// queue name it spells.
fn queue_list<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum QueueName {
        Text(String),
        Signed(i64),
        Unsigned(u64),
        Float(f64),
        Flag(bool),
    }

    impl QueueName {
        fn into_text(self) -> String {
            match self {
                QueueName::Text(text) => text,
                QueueName::Signed(n) => n.to_string(),
                QueueName::Unsigned(n) => n.to_string(),
                QueueName::Float(n) => n.to_string(),
                QueueName::Flag(b) => b.to_string(),
            }
        }
    }

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum QueueList {
        Joined(QueueName),
        Items(Vec<QueueName>),
    }

    let names = match QueueList::deserialize(deserializer)? {
        QueueList::Joined(joined) => joined
            .into_text()
            .split(',')
            .map(|name| name.trim().to_string())
            .filter(|name| !name.is_empty())
            .collect(),
        QueueList::Items(items) => items
            .into_iter()
            .map(|name| name.into_text().trim().to_string())
            .collect(),
    };
    Ok(names)
}

impl PluginSettings {
    /// Minimal settings for the given broker URI and input pipes.
    pub fn new(variant: PluginVariant, broker: impl Into<String>, input_pipes: Vec<String>) -> Self {
        Self {
            variant,
            broker: broker.into(),
            account: None,
            input_pipes,
            output_pipes: Vec::new(),
            loggers: Vec::new(),
            exception_loggers: Vec::new(),
            config: RawConfig::default(),
            output_scheme: None,
            output_namespace: None,
            setup_timeout_ms: default_setup_timeout(),
            publish_timeout_ms: default_publish_timeout(),
        }
    }

    pub fn setup_timeout(&self) -> Duration {
        Duration::from_millis(self.setup_timeout_ms)
    }

    pub fn publish_timeout(&self) -> Duration {
        Duration::from_millis(self.publish_timeout_ms)
    }

    /// Resolve the configured output scheme.
    ///
    /// `Ok(None)` when nothing is configured; an unrecognized selector or a
    /// `NAMESPACE` without a key is a configuration error.
    pub fn output_scheme(&self) -> Result<Option<OutputScheme>, ConfigError> {
        let Some(selector) = self.output_scheme.as_deref() else {
            return Ok(None);
        };

        match selector.trim().to_ascii_uppercase().as_str() {
            "MERGE" => Ok(Some(OutputScheme::Merge)),
            "RESULT" => Ok(Some(OutputScheme::Result)),
            "NAMESPACE" => match self.output_namespace.as_deref().map(str::trim) {
                Some(key) if !key.is_empty() => Ok(Some(OutputScheme::Namespace {
                    key: key.to_string(),
                })),
                _ => Err(ConfigError::MissingField(
                    "output_namespace (required by the NAMESPACE output scheme)".into(),
                )),
            },
            _ => Err(ConfigError::UnknownOutputScheme(selector.to_string())),
        }
    }
}
