//! Order dispatcher - authenticates, deduplicates and executes incoming orders
//!
//! Every order passes through the same pipeline: shape check, signature and
//! host scope, nonce, handler lookup, execution, completion report. Orders in
//! a batch run strictly one after another.

use super::handlers::{default_handlers, HandlerDeps};
use super::registry::{HandlerContext, HandlerRegistry};
use super::signal::AgentSignal;
use crate::config::AgentConfig;
use crate::host::{CommandRunner, RestartScheduler};
use crate::rebuild::RebuildOrchestrator;
use crate::security::{NonceStore, OrderVerifier};
use crate::transport::CompletionReporter;
use appliance_shared::{Order, OrderError, OrderResult, Params};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Executes orders delivered by the transport
pub struct OrderDispatcher {
    verifier: OrderVerifier,
    nonces: NonceStore,
    registry: HandlerRegistry,
    rebuild: Arc<RebuildOrchestrator>,
    restarts: Arc<RestartScheduler>,
    reporter: Arc<dyn CompletionReporter>,
}

impl OrderDispatcher {
    /// Build a dispatcher with the default handler set.
    ///
    /// `signals` receives work the handlers hand back to the agent's main loop.
    pub fn new(
        config: &AgentConfig,
        runner: Arc<dyn CommandRunner>,
        reporter: Arc<dyn CompletionReporter>,
        signals: mpsc::UnboundedSender<AgentSignal>,
    ) -> Result<Self, OrderError> {
        let verifier = OrderVerifier::from_config(config)?;
        let paths = config.paths();

        let restarts = Arc::new(RestartScheduler::new(
            runner.clone(),
            config.restart_command.clone(),
            config.restart_delay,
        ));
        let rebuild = Arc::new(RebuildOrchestrator::new(config, runner.clone(), restarts.clone()));

        let deps = HandlerDeps {
            paths: paths.clone(),
            runner,
            restarts: restarts.clone(),
            rebuild: rebuild.clone(),
            signals,
            download_timeout: config.download_timeout,
        };

        Ok(Self {
            verifier,
            nonces: NonceStore::open(paths.nonce_file()),
            registry: HandlerRegistry::new(default_handlers(&deps)),
            rebuild,
            restarts,
            reporter,
        })
    }

    /// Key and identity settings
    pub fn verifier(&self) -> &OrderVerifier {
        &self.verifier
    }

    /// Handler table, for late registration of overrides
    pub fn registry(&self) -> &HandlerRegistry {
        &self.registry
    }

    /// Process one order and report its completion.
    ///
    /// Malformed orders (no id or type) are dropped without a report and
    /// yield `None`.
    pub async fn process(&self, order: &Order, cancel: &CancellationToken) -> Option<OrderResult> {
        if !order.is_well_formed() {
            warn!(
                order_id = %order.order_id,
                order_type = %order.order_type,
                "Dropping malformed order"
            );
            return None;
        }

        info!(order_id = %order.order_id, order_type = %order.order_type, "Processing order");

        let result = match self.execute(order, cancel).await {
            Ok(result) => {
                info!(order_id = %order.order_id, "Order completed");
                OrderResult::completed(&order.order_id, result)
            }
            Err(e) => {
                if e.is_security_relevant() {
                    error!(
                        security = true,
                        order_id = %order.order_id,
                        order_type = %order.order_type,
                        "Order rejected: {}",
                        e
                    );
                } else {
                    warn!(
                        order_id = %order.order_id,
                        order_type = %order.order_type,
                        "Order failed: {}",
                        e
                    );
                }
                OrderResult::failed(&order.order_id, e.to_string())
            }
        };

        if let Err(e) = self
            .reporter
            .report(
                &result.order_id,
                result.success,
                result.result.as_ref(),
                result.error.as_deref(),
            )
            .await
        {
            warn!(order_id = %order.order_id, "Failed to report completion: {}", e);
        }

        Some(result)
    }

    async fn execute(&self, order: &Order, cancel: &CancellationToken) -> Result<Params, OrderError> {
        self.verifier.verify(order).await?;

        if let Some(nonce) = order.nonce.as_deref().filter(|n| !n.is_empty()) {
            self.nonces.check_and_record(nonce).await?;
        }

        let handler = self
            .registry
            .get(&order.order_type)
            .await
            .ok_or_else(|| OrderError::UnknownOrderType(order.order_type.clone()))?;

        let ctx = HandlerContext {
            order_id: order.order_id.clone(),
            order_type: order.order_type.clone(),
            cancel: cancel.child_token(),
        };
        let params = order.parameters.clone().unwrap_or_default();
        handler.handle(&ctx, &params).await
    }

    /// Process a batch in order, stopping before the next order once
    /// `cancel` fires. An order already started always runs to completion.
    pub async fn process_all(&self, orders: &[Order], cancel: &CancellationToken) -> Vec<OrderResult> {
        let mut results = Vec::with_capacity(orders.len());

        for (i, order) in orders.iter().enumerate() {
            if cancel.is_cancelled() {
                info!("Batch cancelled, {} orders not started", orders.len() - i);
                break;
            }
            if let Some(result) = self.process(order, cancel).await {
                results.push(result);
            }
        }

        results
    }

    /// Report a rebuild left pending by the previous process.
    ///
    /// Called on the first check-in after startup.
    pub async fn complete_pending_rebuild(&self) -> Option<OrderResult> {
        self.rebuild.complete_pending(self.reporter.as_ref()).await
    }

    /// Wait for restarts scheduled by handled orders to run.
    ///
    /// Call before shutting down the runtime.
    pub async fn wait_for_restarts(&self) {
        let outstanding = self.restarts.outstanding();
        if outstanding > 0 {
            info!("Waiting for {} scheduled restart(s)", outstanding);
        }
        self.restarts.wait().await;
    }
}
