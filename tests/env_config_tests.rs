//! Environment loading. Process variables are global, so every scenario runs
//! inside one test and this file is its own test binary.

use pipeline_plugin::config::{load_from_env, PluginVariant, RawConfig};
use pipeline_plugin::error::{ConfigError, PluginError};
use serde_json::{json, Value};

const KEYS: &[&str] = &[
    "PLUGIN_VARIANT",
    "BROKER",
    "ACCOUNT",
    "INPUT_PIPES",
    "INPUT_PIPE",
    "OUTPUT_PIPES",
    "LOGGERS",
    "EXCEPTION_LOGGERS",
    "CONFIG",
    "OUTPUT_SCHEME",
    "OUTPUT_NAMESPACE",
    "SETUP_TIMEOUT_MS",
    "PUBLISH_TIMEOUT_MS",
];

fn with_env(vars: &[(&str, &str)]) {
    for key in KEYS {
        std::env::remove_var(key);
    }
    for (key, value) in vars {
        std::env::set_var(key, value);
    }
}

fn host_config(raw: &RawConfig) -> Value {
    match raw {
        RawConfig::Text(text) => serde_json::from_str(text).unwrap(),
        RawConfig::Structured(value) => value.clone(),
    }
}

#[tokio::test]
async fn test_load_from_env() {
    // Service with every key set.
    with_env(&[
        ("PLUGIN_VARIANT", "service"),
        ("BROKER", "memory://env"),
        ("ACCOUNT", "acme"),
        ("INPUT_PIPES", "orders, refunds"),
        ("OUTPUT_PIPES", "enriched"),
        ("LOGGERS", "audit"),
        ("EXCEPTION_LOGGERS", "errors"),
        ("CONFIG", r#"{"lang": "en"}"#),
        ("OUTPUT_SCHEME", "NAMESPACE"),
        ("OUTPUT_NAMESPACE", "meta"),
        ("SETUP_TIMEOUT_MS", "1500"),
        ("PUBLISH_TIMEOUT_MS", "250"),
    ]);
    let settings = load_from_env().await.unwrap();
    assert_eq!(settings.variant, PluginVariant::Service);
    assert_eq!(settings.broker, "memory://env");
    assert_eq!(settings.account.as_deref(), Some("acme"));
    assert_eq!(settings.input_pipes, vec!["orders", "refunds"]);
    assert_eq!(settings.output_pipes, vec!["enriched"]);
    assert_eq!(settings.loggers, vec!["audit"]);
    assert_eq!(settings.exception_loggers, vec!["errors"]);
    assert_eq!(host_config(&settings.config), json!({"lang": "en"}));
    assert_eq!(settings.setup_timeout_ms, 1500);
    assert_eq!(settings.publish_timeout_ms, 250);

    // Legacy single input key, defaults everywhere else.
    with_env(&[("BROKER", "memory://env"), ("INPUT_PIPE", "ingress")]);
    let settings = load_from_env().await.unwrap();
    assert_eq!(settings.variant, PluginVariant::Connector);
    assert_eq!(settings.input_pipes, vec!["ingress"]);
    assert!(settings.account.is_none());
    assert_eq!(host_config(&settings.config), json!({}));
    assert_eq!(settings.publish_timeout_ms, 30000);

    // Names that look like numbers or flags are still names.
    with_env(&[
        ("BROKER", "memory://env"),
        ("INPUT_PIPES", "42"),
        ("LOGGERS", "true"),
        ("EXCEPTION_LOGGERS", "123,orders"),
    ]);
    let settings = load_from_env().await.unwrap();
    assert_eq!(settings.input_pipes, vec!["42"]);
    assert_eq!(settings.loggers, vec!["true"]);
    assert_eq!(settings.exception_loggers, vec!["123", "orders"]);

    // Broker URI substitution.
    with_env(&[
        ("BROKER", "memory://${PIPELINE_PLUGIN_ENV_HOST:-fallback}"),
        ("INPUT_PIPES", "in"),
    ]);
    let settings = load_from_env().await.unwrap();
    assert_eq!(settings.broker, "memory://fallback");

    // Missing input pipes.
    with_env(&[("BROKER", "memory://env")]);
    assert!(matches!(
        load_from_env().await,
        Err(PluginError::Config(ConfigError::Validation(_)))
    ));

    // Unknown output scheme.
    with_env(&[
        ("BROKER", "memory://env"),
        ("INPUT_PIPES", "in"),
        ("OUTPUT_SCHEME", "SPLICE"),
    ]);
    assert!(matches!(
        load_from_env().await,
        Err(PluginError::Config(ConfigError::UnknownOutputScheme(_)))
    ));

    with_env(&[]);
}
