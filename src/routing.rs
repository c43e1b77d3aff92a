use serde::Serialize;
use std::collections::HashSet;
use std::fmt;

use crate::config::{PluginSettings, PluginVariant};

/// Shared queue every plugin mirrors its log records to.
pub const LOGS_QUEUE: &str = "logs";
/// Shared queue every plugin mirrors its exception records to.
pub const EXCEPTIONS_QUEUE: &str = "exceptions";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum QueueRole {
    Input,
    Output,
    Logger,
    ExceptionLogger,
    SharedLogs,
    SharedExceptions,
}

impl fmt::Display for QueueRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            QueueRole::Input => "input",
            QueueRole::Output => "output",
            QueueRole::Logger => "logger",
            QueueRole::ExceptionLogger => "exceptionLogger",
            QueueRole::SharedLogs => "sharedLogs",
            QueueRole::SharedExceptions => "sharedExceptions",
        };
        f.write_str(name)
    }
}

/// Role assignment of every queue name a plugin instance touches.
///
/// Fixed at construction. A name may appear under several roles (a logger
/// queue that is also called `logs`, say); it is still declared only once.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RoutingTable {
    inputs: Vec<String>,
    outputs: Vec<String>,
    loggers: Vec<String>,
    exception_loggers: Vec<String>,
}

impl RoutingTable {
    pub fn new(
        inputs: Vec<String>,
        outputs: Vec<String>,
        loggers: Vec<String>,
        exception_loggers: Vec<String>,
    ) -> Self {
        Self {
            inputs,
            outputs,
            loggers,
            exception_loggers,
        }
    }

    /// Output pipes only route for the service variant.
    pub fn from_settings(settings: &PluginSettings) -> Self {
        let outputs = if settings.variant == PluginVariant::Service {
            settings.output_pipes.clone()
        } else {
            if !settings.output_pipes.is_empty() {
                tracing::warn!(
                    variant = %settings.variant,
                    ignored = ?settings.output_pipes,
                    "Output pipes are only used by the service variant; ignoring them"
                );
            }
            Vec::new()
        };

        Self::new(
            settings.input_pipes.clone(),
            outputs,
            settings.loggers.clone(),
            settings.exception_loggers.clone(),
        )
    }

    pub fn inputs(&self) -> &[String] {
        &self.inputs
    }

    pub fn outputs(&self) -> &[String] {
        &self.outputs
    }

    pub fn loggers(&self) -> &[String] {
        &self.loggers
    }

    pub fn exception_loggers(&self) -> &[String] {
        &self.exception_loggers
    }

    /// Every (name, role) pair, shared queues last.
    pub fn entries(&self) -> Vec<(&str, QueueRole)> {
        tagged(&self.inputs, QueueRole::Input)
            .chain(tagged(&self.outputs, QueueRole::Output))
            .chain(tagged(&self.loggers, QueueRole::Logger))
            .chain(tagged(&self.exception_loggers, QueueRole::ExceptionLogger))
            .chain([
                (LOGS_QUEUE, QueueRole::SharedLogs),
                (EXCEPTIONS_QUEUE, QueueRole::SharedExceptions),
            ])
            .collect()
    }

    /// Distinct queue names in first-seen order.
    pub fn queue_names(&self) -> Vec<String> {
        let mut seen = HashSet::new();
        self.entries()
            .into_iter()
            .filter(|(name, _)| seen.insert(*name))
            .map(|(name, _)| name.to_string())
            .collect()
    }

    pub fn roles_of(&self, name: &str) -> Vec<QueueRole> {
        self.entries()
            .into_iter()
            .filter(|(n, _)| *n == name)
            .map(|(_, role)| role)
            .collect()
    }
}

fn tagged(names: &[String], role: QueueRole) -> impl Iterator<Item = (&str, QueueRole)> {
    names.iter().map(move |name| (name.as_str(), role))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_queue_names_are_distinct_and_include_shared_queues() {
        let table = RoutingTable::new(
            names(&["in-a", "in-b"]),
            names(&["out"]),
            names(&["audit", "logs"]),
            names(&["audit"]),
        );

        assert_eq!(
            table.queue_names(),
            names(&["in-a", "in-b", "out", "audit", "logs", "exceptions"])
        );
    }

    #[test]
    fn test_overlapping_roles_are_kept() {
        let table = RoutingTable::new(names(&["in"]), vec![], names(&["logs"]), vec![]);

        assert_eq!(
            table.roles_of("logs"),
            vec![QueueRole::Logger, QueueRole::SharedLogs]
        );
        assert!(table.queue_names().contains(&"exceptions".to_string()));
        assert!(table.roles_of("elsewhere").is_empty());
    }

    #[test]
    fn test_outputs_dropped_for_non_service_variants() {
        let mut settings =
            PluginSettings::new(PluginVariant::Connector, "memory://t", names(&["in"]));
        settings.output_pipes = names(&["out"]);
        assert!(RoutingTable::from_settings(&settings).outputs().is_empty());

        settings.variant = PluginVariant::Service;
        assert_eq!(RoutingTable::from_settings(&settings).outputs(), names(&["out"]));
    }
}
