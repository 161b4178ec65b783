//! Agent lifecycle orders

use super::{status, HandlerDeps, SignalHandler};
use crate::command::registry::{HandlerContext, HandlerResult, OrderHandler};
use crate::command::signal::AgentSignal;
use crate::host::RestartScheduler;
use appliance_shared::Params;
use async_trait::async_trait;
use serde_json::json;
use std::sync::Arc;

pub(super) fn handlers(deps: &HandlerDeps) -> Vec<(&'static str, Arc<dyn OrderHandler>)> {
    vec![
        (
            "force_checkin",
            SignalHandler::new(&deps.signals, AgentSignal::CheckinRequested, "checkin_requested"),
        ),
        (
            "restart_agent",
            Arc::new(RestartAgent {
                restarts: deps.restarts.clone(),
            }),
        ),
        (
            "refresh_credentials",
            SignalHandler::new(
                &deps.signals,
                AgentSignal::CredentialRefreshRequested,
                "refresh_requested",
            ),
        ),
    ]
}

/// Restart the agent service after a short delay, so this order's completion
/// is reported before the process goes away
struct RestartAgent {
    restarts: Arc<RestartScheduler>,
}

#[async_trait]
impl OrderHandler for RestartAgent {
    async fn handle(&self, ctx: &HandlerContext, _params: &Params) -> HandlerResult {
        self.restarts.schedule(&format!("order {}", ctx.order_id));

        let mut result = status("restart_scheduled");
        result.insert("restart_in_secs".into(), json!(self.restarts.delay().as_secs()));
        Ok(result)
    }
}
