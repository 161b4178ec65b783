use anyhow::{Context, Result};
use appliance_agent::command::{AgentSignal, OrderDispatcher};
use appliance_agent::config::AgentConfig;
use appliance_agent::host::ProcessRunner;
use appliance_agent::transport::LogReporter;
use appliance_shared::Order;
use std::sync::Arc;
use tokio::io::AsyncReadExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .init();

    let config = AgentConfig::from_env()?;
    info!("Appliance agent starting");
    info!("  State dir: {}", config.state_dir.display());
    info!("  Appliance id: {}", config.appliance_id.as_deref().unwrap_or("(unknown)"));

    let (signal_tx, signal_rx) = mpsc::unbounded_channel();
    let dispatcher = OrderDispatcher::new(
        &config,
        Arc::new(ProcessRunner),
        Arc::new(LogReporter),
        signal_tx,
    )?;
    let order_types = dispatcher.registry().order_types().await;
    info!("{} order types registered", order_types.len());

    tokio::spawn(handle_agent_signals(signal_rx));

    // First check-in after a restart confirms any pending rebuild
    if let Some(result) = dispatcher.complete_pending_rebuild().await {
        info!("Pending rebuild {} confirmed", result.order_id);
    }

    let orders = read_orders(std::env::args().nth(1)).await?;
    info!("Processing {} orders", orders.len());

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, finishing current order");
            trigger.cancel();
        }
    });

    let results = dispatcher.process_all(&orders, &cancel).await;
    println!("{}", serde_json::to_string_pretty(&results)?);

    // Returning drops the runtime, and with it any restart still waiting
    dispatcher.wait_for_restarts().await;

    Ok(())
}

/// Read a JSON array of orders from `path`, or stdin when absent
async fn read_orders(path: Option<String>) -> Result<Vec<Order>> {
    let raw = match &path {
        Some(path) => tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("cannot read orders from {path}"))?,
        None => {
            let mut raw = String::new();
            tokio::io::stdin()
                .read_to_string(&mut raw)
                .await
                .context("cannot read orders from stdin")?;
            raw
        }
    };
    serde_json::from_str(&raw).context("orders must be a JSON array")
}

/// Handle work the order handlers hand back to the main loop
async fn handle_agent_signals(mut signals: mpsc::UnboundedReceiver<AgentSignal>) {
    while let Some(signal) = signals.recv().await {
        match signal {
            AgentSignal::CheckinRequested => {
                info!("[MAIN] Check-in requested, deferring to next transport cycle");
            }
            AgentSignal::CredentialRefreshRequested => {
                info!("[MAIN] Credential refresh requested");
            }
            AgentSignal::DriftScanRequested | AgentSignal::RuleSyncRequested => {
                info!("[MAIN] {} requested, queued for compliance runner", signal);
            }
        }
    }
}
