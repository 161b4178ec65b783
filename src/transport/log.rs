//! Reporter that records completions in the agent log

use super::traits::CompletionReporter;
use anyhow::Result;
use appliance_shared::Params;
use async_trait::async_trait;
use tracing::info;

/// Writes each completion to the log instead of a network transport
#[derive(Debug, Default, Clone)]
pub struct LogReporter;

#[async_trait]
impl CompletionReporter for LogReporter {
    async fn report(
        &self,
        order_id: &str,
        success: bool,
        result: Option<&Params>,
        error: Option<&str>,
    ) -> Result<()> {
        let result = result
            .map(|r| serde_json::Value::Object(r.clone()).to_string())
            .unwrap_or_default();
        info!(
            order_id,
            success,
            error = error.unwrap_or(""),
            "Order completed {}",
            result
        );
        Ok(())
    }
}
