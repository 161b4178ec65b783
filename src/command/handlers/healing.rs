//! Healing entry point
//!
//! The healing engine lives outside the order engine and registers its own
//! handler for [`HEALING_ORDER_TYPE`] at startup. Until it does, healing
//! orders fail with an explanation instead of silently succeeding.

use crate::command::registry::{HandlerContext, HandlerResult, OrderHandler};
use appliance_shared::{OrderError, Params};
use async_trait::async_trait;
use std::sync::Arc;

pub const HEALING_ORDER_TYPE: &str = "healing";

pub(super) fn handlers() -> Vec<(&'static str, Arc<dyn OrderHandler>)> {
    vec![(HEALING_ORDER_TYPE, Arc::new(HealingUnavailable))]
}

struct HealingUnavailable;

#[async_trait]
impl OrderHandler for HealingUnavailable {
    async fn handle(&self, _ctx: &HandlerContext, params: &Params) -> HandlerResult {
        let runbook = params
            .get("runbook_id")
            .and_then(|v| v.as_str())
            .unwrap_or("unspecified");
        Err(OrderError::handler(format!(
            "healing engine not attached to this agent, runbook {runbook} not executed"
        )))
    }
}
