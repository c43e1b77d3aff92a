use super::schema::{PluginSettings, PluginVariant};
use crate::error::{ConfigError, Result};
use figment::{
    providers::{Env, Format, Json, Toml, Yaml},
    Figment,
};
use std::path::Path;

/// Upper-case process variables a plugin host passes in.
const ENV_KEYS: &[&str] = &[
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

fn plugin_env() -> Env {
    Env::raw().filter(|key| ENV_KEYS.iter().any(|k| key.as_str().eq_ignore_ascii_case(k)))
}

pub async fn load_from_env() -> Result<PluginSettings> {
    let settings: PluginSettings = Figment::new()
        .merge(plugin_env())
        .extract()
        .map_err(|e| ConfigError::Parse(e.to_string()))?;

    finish(settings)
}

pub async fn load_from_path<P: AsRef<Path>>(path: P) -> Result<PluginSettings> {
    let path = path.as_ref();

    let figment = match path.extension().and_then(|e| e.to_str()) {
        Some("toml") => Figment::new().merge(Toml::file(path)),
        Some("json") => Figment::new().merge(Json::file(path)),
        Some("yaml") | Some("yml") => Figment::new().merge(Yaml::file(path)),
        _ => {
            return Err(ConfigError::Parse(
                "Unsupported config file format. Use .toml, .json, .yaml, or .yml".into(),
            )
            .into())
        }
    };

    let settings: PluginSettings = figment
        .merge(plugin_env())
        .extract()
        .map_err(|e| ConfigError::Parse(e.to_string()))?;

    finish(settings)
}

fn finish(settings: PluginSettings) -> Result<PluginSettings> {
    let settings = apply_env_substitutions(settings)?;
    validate(&settings)?;
    Ok(settings)
}

pub fn validate(settings: &PluginSettings) -> Result<()> {
    if settings.broker.trim().is_empty() {
        return Err(ConfigError::MissingField("broker".into()).into());
    }

    if settings.input_pipes.is_empty() {
        return Err(ConfigError::Validation("At least one input pipe is required".into()).into());
    }

    let lists = [
        ("input_pipes", &settings.input_pipes),
        ("output_pipes", &settings.output_pipes),
        ("loggers", &settings.loggers),
        ("exception_loggers", &settings.exception_loggers),
    ];
    for (field, names) in lists {
        if names.iter().any(|name| name.trim().is_empty()) {
            return Err(
                ConfigError::Validation(format!("'{field}' contains an empty queue name")).into(),
            );
        }
    }

    // Resolving the scheme surfaces unknown selectors even on variants that ignore it.
    let scheme = settings.output_scheme()?;
    if settings.variant == PluginVariant::Service && scheme.is_none() {
        return Err(ConfigError::MissingField(
            "output_scheme (required by the service variant)".into(),
        )
        .into());
    }

    if settings.setup_timeout_ms == 0 || settings.publish_timeout_ms == 0 {
        return Err(ConfigError::Validation("Timeouts must be greater than 0".into()).into());
    }

    Ok(())
}

fn apply_env_substitutions(mut settings: PluginSettings) -> Result<PluginSettings> {
    settings.broker = substitute_env_vars(&settings.broker)?;

    if let Some(account) = &mut settings.account {
        *account = substitute_env_vars(account)?;
    }

    Ok(settings)
}

fn substitute_env_vars(input: &str) -> Result<String> {
    let mut result = input.to_string();
    let re = regex::Regex::new(r"\$\{([^}]+)\}")
        .map_err(|e| ConfigError::Parse(format!("Invalid substitution pattern: {e}")))?;

    for cap in re.captures_iter(input) {
        let var_name = &cap[1];
        match std::env::var(var_name) {
            Ok(value) => {
                result = result.replace(&cap[0], &value);
            }
            Err(_) => {
                // ${VAR:-default}
                if let Some((name, default)) = var_name.split_once(":-") {
                    match std::env::var(name) {
                        Ok(value) => result = result.replace(&cap[0], &value),
                        Err(_) => result = result.replace(&cap[0], default),
                    }
                } else {
                    return Err(ConfigError::EnvVar(format!(
                        "Environment variable '{var_name}' not found"
                    ))
                    .into());
                }
            }
        }
    }

    Ok(result)
}
