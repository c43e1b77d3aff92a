use crate::broker::create_broker;
use crate::config::{self, PluginSettings};
use crate::error::Result;
use crate::routing::RoutingTable;
use tracing::{info, warn};

/// Validate settings and print the queue topology they describe, without
/// connecting to anything.
pub async fn run_config_check(settings: PluginSettings) -> Result<()> {
    info!("Checking configuration...");

    config::validate(&settings)?;
    info!("✓ Configuration is valid");

    info!("  Variant: {}", settings.variant);
    info!("  Broker: {}", settings.broker);
    match settings.account.as_deref() {
        Some(account) => info!("  Account: {}", account),
        None => info!("  Account: (none)"),
    }
    if let Some(scheme) = settings.output_scheme()? {
        info!("  Output scheme: {}", scheme);
    }

    if !settings.variant.supports_pipe() && !settings.output_pipes.is_empty() {
        warn!(
            "  ! {} output pipe(s) ignored: the {} variant does not pipe",
            settings.output_pipes.len(),
            settings.variant
        );
    }

    // Only the scheme matters here; no connection is opened.
    create_broker(&settings.broker)?;
    info!("✓ Broker scheme supported");

    let routing = RoutingTable::from_settings(&settings);
    info!("\nQueues ({} distinct):", routing.queue_names().len());
    for name in routing.queue_names() {
        let roles: Vec<String> = routing
            .roles_of(&name)
            .iter()
            .map(|role| format!("{role:?}"))
            .collect();
        info!("  {} <- {}", name, roles.join(", "));
    }

    info!("\n✓ All checks passed");
    Ok(())
}
