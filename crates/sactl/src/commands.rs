//! CLI command implementations

use anyhow::{bail, Context, Result};
use sabus::{handler_fn, BusConfig, Envelope, EventBus, HealthReporter, Payload};
use saconf::{ConfigSources, SaConfig};
use crate::shutdown::ShutdownSignal;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

/// How long one-shot commands wait for the broker session.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Parse a command-line payload. It must be a JSON object.
pub fn parse_payload(json: &str) -> Result<Payload> {
    let value: serde_json::Value =
        serde_json::from_str(json).context("Failed to parse payload as JSON")?;
    match value {
        serde_json::Value::Object(map) => Ok(map),
        other => bail!("Payload must be a JSON object, got: {}", other),
    }
}

fn connect(config: &SaConfig, module: &str) -> Result<Arc<EventBus>> {
    let bus_config = BusConfig::from_config(config, module)
        .context("Invalid bus configuration")?;
    Ok(Arc::new(EventBus::connect(bus_config)))
}

/// Publish a single event and print its id
pub async fn publish(
    config: &SaConfig,
    module: &str,
    topic: &str,
    event_type: &str,
    json: &str,
    corr: Option<String>,
) -> Result<()> {
    let payload = parse_payload(json)?;
    let bus = connect(config, module)?;

    let result = async {
        bus.wait_connected(CONNECT_TIMEOUT).await.with_context(|| {
            format!(
                "Could not reach broker {}:{}",
                config.mqtt.broker, config.mqtt.port
            )
        })?;
        bus.publish(topic, event_type, payload, corr)
            .await
            .context("Publish failed")
    }
    .await;
    bus.stop().await;

    let envelope = result?;
    println!("Published {} on {} (corr {})", envelope.id, topic, envelope.corr);
    Ok(())
}

/// Print every envelope received on `filters` until SIGINT or SIGTERM
pub async fn listen(config: &SaConfig, module: &str, filters: &[String]) -> Result<()> {
    if filters.is_empty() {
        bail!("At least one topic filter is required");
    }

    let shutdown = ShutdownSignal::new()?;
    let bus = connect(config, module)?;
    let printer = handler_fn(|env: Envelope| async move {
        println!("{}", env.encode()?);
        anyhow::Ok(())
    });

    for filter in filters {
        if let Err(e) = bus.subscribe(filter, printer.clone()).await {
            bus.stop().await;
            return Err(e).with_context(|| format!("Cannot subscribe to '{}'", filter));
        }
    }
    if let Err(e) = bus.wait_connected(CONNECT_TIMEOUT).await {
        warn!("{}, still retrying in the background", e);
    }

    eprintln!("Listening on {} (Ctrl-C to stop)", filters.join(", "));
    shutdown.wait().await;
    bus.stop().await;
    Ok(())
}

/// Publish heartbeats for `module` until SIGINT or SIGTERM
pub async fn heartbeat(config: &SaConfig, module: &str, interval: Duration) -> Result<()> {
    if interval.is_zero() {
        bail!("Heartbeat interval must be positive");
    }

    let shutdown = ShutdownSignal::new()?;
    let bus = connect(config, module)?;
    if let Err(e) = bus.wait_connected(CONNECT_TIMEOUT).await {
        warn!("{}, still retrying in the background", e);
    }

    let reporter = HealthReporter::new(bus.clone(), module, interval);
    reporter.start().await;
    eprintln!(
        "Sending heartbeats for {} on {} every {:?} (Ctrl-C to stop)",
        module,
        reporter.topic(),
        interval
    );

    shutdown.wait().await;
    reporter.stop().await;
    bus.stop().await;
    Ok(())
}

/// Print the effective configuration and where it came from
pub fn show_config(config: &SaConfig, sources: &ConfigSources) -> Result<()> {
    println!("# Sources (later wins):");
    if sources.files.is_empty() {
        println!("#   (no config files)");
    }
    for file in &sources.files {
        println!("#   {}", file.display());
    }
    for var in &sources.env_overrides {
        println!("#   env {}", var);
    }
    println!();
    print!("{}", config.to_toml().context("Cannot render configuration")?);
    Ok(())
}
