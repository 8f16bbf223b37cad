use anyhow::{Context, Result};
use clap::Parser;
use mwha_bridge::{AmpConnection, Bridge, BridgeSettings, Config, MessageHandler, MqttPubSub};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing_subscriber::EnvFilter;

/// Bridge a multi-zone whole-home audio amp to MQTT
#[derive(Parser)]
#[command(name = "mwha2mqttd", version, about)]
struct Args {
    /// Path to the config file
    #[arg(short, long, default_value = "/etc/mwha2mqttd.toml")]
    config: PathBuf,

    /// Log filter, e.g. `info` or `mwha_bridge=debug` (overrides RUST_LOG)
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = match &args.log_level {
        Some(level) => EnvFilter::try_new(level).context("invalid log filter")?,
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = Config::load(&args.config)
        .with_context(|| format!("failed to load config {}", args.config.display()))?;
    let settings = BridgeSettings::from_config(&config)?;

    let amp = AmpConnection::connect(&config.serial)
        .await
        .with_context(|| format!("failed to open amp connection on {}", config.serial.port))?;
    let amp = Arc::new(amp);

    let (mqtt, eventloop) = MqttPubSub::new(&config.mqtt, &settings.topic_base)?;
    let bridge = Arc::new(Bridge::new(amp.clone(), Arc::new(mqtt.clone()), settings));

    let (stop_tx, _) = broadcast::channel(1);

    let handler: Arc<dyn MessageHandler> = bridge.clone();
    let mqtt_task = tokio::spawn(MqttPubSub::run(eventloop, handler, stop_tx.subscribe()));

    let signal_stop = stop_tx.clone();
    tokio::spawn(async move {
        wait_for_shutdown_signal().await;
        tracing::info!("Shutdown requested");
        let _ = signal_stop.send(());
    });

    let outcome = bridge.run(stop_tx.subscribe()).await;

    let _ = stop_tx.send(());
    if let Err(e) = mqtt.disconnect().await {
        tracing::debug!("MQTT disconnect failed: {}", e);
    }
    let _ = mqtt_task.await;

    amp.close().await;

    outcome.context("bridge stopped with an error")
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = term.recv() => {}
            }
        }
        Err(e) => {
            tracing::warn!("Failed to install SIGTERM handler: {}", e);
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
