use anyhow::Context;
use appsec_engine::config::EngineConfig;
use appsec_engine::engine::rules::{PassthroughCompiler, RuleCompiler};
use appsec_engine::supervisor::Supervisor;
use common_events::EventSink;
use std::path::Path;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string()))
        .init();

    rustls::crypto::aws_lc_rs::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("failed to install rustls crypto provider"))?;

    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "appsec.yaml".to_string());
    let config = EngineConfig::from_file(Path::new(&config_path))
        .with_context(|| format!("loading {config_path}"))?;

    let policy = config
        .policy_source()
        .context("no rule configuration referenced")?;
    // The rule compiler ships with the surrounding project; the default
    // binary wires the passthrough compiler.
    let rule_set = PassthroughCompiler
        .compile(&policy, &config.data_dir())
        .with_context(|| format!("compiling appsec policy {policy}"))?;

    let (events, mut event_rx) = EventSink::channel(256);
    tokio::spawn(async move {
        while let Some(event) = event_rx.recv().await {
            match serde_json::to_string(&event) {
                Ok(payload) => info!(event = %payload, "security event"),
                Err(err) => error!(%err, "failed to serialize security event"),
            }
        }
    });

    let shutdown = CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => info!("received interrupt, initiating shutdown"),
                Err(err) => error!(%err, "failed to listen for shutdown signal"),
            }
            shutdown.cancel();
        });
    }

    Supervisor::new(config, rule_set, events).run(shutdown).await
}
