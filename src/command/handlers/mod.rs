//! Order handlers, grouped by category
//!
//! Handlers with OS-level side effects validate their parameters through
//! [`crate::security::allowlist`] before doing anything else.

mod compliance;
mod healing;
mod lifecycle;
mod sensors;
mod system;

pub use healing::HEALING_ORDER_TYPE;

use super::registry::{HandlerContext, HandlerResult, OrderHandler};
use super::signal::AgentSignal;
use crate::config::StatePaths;
use crate::host::{CommandRunner, RestartScheduler};
use crate::rebuild::RebuildOrchestrator;
use crate::security::ValidationError;
use appliance_shared::{OrderError, Params};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Collaborators the default handlers are built from
#[derive(Clone)]
pub struct HandlerDeps {
    pub paths: StatePaths,
    pub runner: Arc<dyn CommandRunner>,
    pub restarts: Arc<RestartScheduler>,
    pub rebuild: Arc<RebuildOrchestrator>,
    pub signals: mpsc::UnboundedSender<AgentSignal>,
    pub download_timeout: Duration,
}

/// The default handler set, keyed by order type
pub fn default_handlers(deps: &HandlerDeps) -> Vec<(&'static str, Arc<dyn OrderHandler>)> {
    let mut handlers = Vec::new();
    handlers.extend(lifecycle::handlers(deps));
    handlers.extend(compliance::handlers(deps));
    handlers.extend(system::handlers(deps));
    handlers.extend(sensors::handlers(deps));
    handlers.extend(healing::handlers());
    handlers
}

/// Result mapping carrying only a status
pub(crate) fn status(status: &str) -> Params {
    let mut result = Params::new();
    result.insert("status".into(), json!(status));
    result
}

/// A string parameter that may be absent
pub(crate) fn optional_str<'a>(params: &'a Params, key: &str) -> Result<Option<&'a str>, OrderError> {
    match params.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.as_str())),
        Some(_) => Err(OrderError::ValidationFailure(format!("{key} must be a string"))),
    }
}

/// A string parameter that must be present and non-empty
pub(crate) fn required_str<'a>(params: &'a Params, key: &'static str) -> Result<&'a str, OrderError> {
    optional_str(params, key)?
        .filter(|s| !s.is_empty())
        .ok_or_else(|| ValidationError::MissingParameter(key).into())
}

/// A non-negative integer parameter that may be absent
pub(crate) fn optional_u64(params: &Params, key: &str) -> Result<Option<u64>, OrderError> {
    match params.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(v) => v
            .as_u64()
            .map(Some)
            .ok_or_else(|| OrderError::ValidationFailure(format!("{key} must be a non-negative integer"))),
    }
}

/// Hands work to the agent's main loop and reports that it was queued
pub(crate) struct SignalHandler {
    signals: mpsc::UnboundedSender<AgentSignal>,
    signal: AgentSignal,
    status: &'static str,
}

impl SignalHandler {
    pub(crate) fn new(
        signals: &mpsc::UnboundedSender<AgentSignal>,
        signal: AgentSignal,
        status: &'static str,
    ) -> Arc<dyn OrderHandler> {
        Arc::new(Self {
            signals: signals.clone(),
            signal,
            status,
        })
    }
}

#[async_trait]
impl OrderHandler for SignalHandler {
    async fn handle(&self, _ctx: &HandlerContext, _params: &Params) -> HandlerResult {
        self.signals
            .send(self.signal)
            .map_err(|_| OrderError::handler(format!("{} unavailable: agent loop not running", self.signal)))?;
        Ok(status(self.status))
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::config::AgentConfig;
    use crate::host::testing::FakeRunner;
    use tempfile::TempDir;
    use tokio_util::sync::CancellationToken;

    pub struct Fixture {
        pub dir: TempDir,
        pub runner: Arc<FakeRunner>,
        pub deps: HandlerDeps,
        pub signals: mpsc::UnboundedReceiver<AgentSignal>,
    }

    pub fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let config = AgentConfig::with_state_dir(dir.path());
        let runner = FakeRunner::new();
        let restarts = Arc::new(RestartScheduler::new(
            runner.clone(),
            vec!["systemctl".into(), "restart".into(), "appliance-agent.service".into()],
            Duration::ZERO,
        ));
        let rebuild = Arc::new(RebuildOrchestrator::new(&config, runner.clone(), restarts.clone()));
        let (tx, rx) = mpsc::unbounded_channel();
        let deps = HandlerDeps {
            paths: config.paths(),
            runner: runner.clone(),
            restarts,
            rebuild,
            signals: tx,
            download_timeout: Duration::from_secs(5),
        };
        Fixture {
            dir,
            runner,
            deps,
            signals: rx,
        }
    }

    pub fn ctx(order_type: &str) -> HandlerContext {
        HandlerContext {
            order_id: "ord-1".into(),
            order_type: order_type.into(),
            cancel: CancellationToken::new(),
        }
    }

    pub fn params(value: serde_json::Value) -> Params {
        match value {
            serde_json::Value::Object(map) => map,
            _ => Params::new(),
        }
    }

    /// Run the default handler for `order_type`
    pub async fn run(fixture: &Fixture, order_type: &str, p: serde_json::Value) -> HandlerResult {
        let handler = default_handlers(&fixture.deps)
            .into_iter()
            .find(|(name, _)| *name == order_type)
            .map(|(_, h)| h)
            .unwrap_or_else(|| panic!("no default handler for {order_type}"));
        handler.handle(&ctx(order_type), &params(p)).await
    }
}

#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_default_set_covers_all_categories() {
        let f = fixture();
        let names: HashSet<&str> = default_handlers(&f.deps).into_iter().map(|(n, _)| n).collect();
        for expected in [
            "force_checkin",
            "restart_agent",
            "refresh_credentials",
            "run_drift",
            "sync_rules",
            "sync_promoted_rule",
            "nixos_rebuild",
            "update_agent",
            "update_iso",
            "view_logs",
            "diagnostic",
            "deploy_sensor",
            "remove_sensor",
            "sensor_status",
            "deploy_linux_sensor",
            "remove_linux_sensor",
            "linux_sensor_status",
            HEALING_ORDER_TYPE,
        ] {
            assert!(names.contains(expected), "missing {expected}");
        }
    }

    #[test]
    fn test_param_helpers() {
        let p = params(json!({"s": "x", "n": 5, "neg": -1, "empty": ""}));
        assert_eq!(optional_str(&p, "s").unwrap(), Some("x"));
        assert_eq!(optional_str(&p, "absent").unwrap(), None);
        assert!(optional_str(&p, "n").is_err());
        assert!(required_str(&p, "empty").is_err());
        assert_eq!(optional_u64(&p, "n").unwrap(), Some(5));
        assert!(optional_u64(&p, "neg").is_err());
    }

    #[tokio::test]
    async fn test_signal_handler_reports_closed_loop() {
        let mut f = fixture();
        f.signals.close();
        let err = run(&f, "force_checkin", json!({})).await.unwrap_err();
        assert!(matches!(err, OrderError::HandlerExecution(_)));
    }
}
