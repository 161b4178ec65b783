//! Outbound completion reporting

use anyhow::Result;
use appliance_shared::Params;
use async_trait::async_trait;

/// Delivers order outcomes to the control service.
///
/// Implementations own delivery and retries; the dispatcher logs a failed
/// report and moves on.
#[async_trait]
pub trait CompletionReporter: Send + Sync {
    async fn report(
        &self,
        order_id: &str,
        success: bool,
        result: Option<&Params>,
        error: Option<&str>,
    ) -> Result<()>;
}
