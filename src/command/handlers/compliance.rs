//! Compliance sync orders

use super::{required_str, status, HandlerDeps, SignalHandler};
use crate::command::registry::{HandlerContext, HandlerResult, OrderHandler};
use crate::command::signal::AgentSignal;
use crate::config::StatePaths;
use crate::host::io::write_if_missing;
use crate::security::allowlist::validate_promoted_rule;
use appliance_shared::{OrderError, Params};
use async_trait::async_trait;
use serde_json::json;
use std::sync::Arc;
use tracing::info;

pub(super) fn handlers(deps: &HandlerDeps) -> Vec<(&'static str, Arc<dyn OrderHandler>)> {
    vec![
        (
            "run_drift",
            SignalHandler::new(&deps.signals, AgentSignal::DriftScanRequested, "drift_scan_requested"),
        ),
        (
            "sync_rules",
            SignalHandler::new(&deps.signals, AgentSignal::RuleSyncRequested, "rule_sync_requested"),
        ),
        (
            "sync_promoted_rule",
            Arc::new(SyncPromotedRule {
                paths: deps.paths.clone(),
            }),
        ),
    ]
}

/// Deploy a rule promoted by the learning pipeline into the local rule set.
///
/// An existing rule file is never overwritten.
struct SyncPromotedRule {
    paths: StatePaths,
}

#[async_trait]
impl OrderHandler for SyncPromotedRule {
    async fn handle(&self, _ctx: &HandlerContext, params: &Params) -> HandlerResult {
        let rule_id = required_str(params, "rule_id")?;
        let rule_yaml = required_str(params, "rule_yaml")?;
        let rule = validate_promoted_rule(rule_id, rule_yaml)?;

        let path = self.paths.promoted_rule(&rule.id);
        let written = write_if_missing(&path, rule_yaml.as_bytes()).map_err(|e| {
            OrderError::handler(format!("cannot write rule {}: {}", path.display(), e))
        })?;

        let mut result = status(if written { "deployed" } else { "already_exists" });
        result.insert("rule_id".into(), json!(rule.id));
        result.insert("path".into(), json!(path.display().to_string()));
        if written {
            info!(rule_id = %rule.id, action = %rule.action, "Promoted rule deployed");
            result.insert("action".into(), json!(rule.action));
        }
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::*;
    use super::*;
    use serde_json::json;

    const RULE: &str = "id: L1-X\nname: Restart stuck spooler\naction: restart_service\nconditions:\n  - field: service.spooler.state\n    operator: equals\n    value: stopped\n";

    #[tokio::test]
    async fn test_promoted_rule_deployed_once() {
        let f = fixture();
        let result = run(&f, "sync_promoted_rule", json!({"rule_id": "L1-X", "rule_yaml": RULE}))
            .await
            .unwrap();
        assert_eq!(result["status"], "deployed");
        assert_eq!(result["rule_id"], "L1-X");

        let path = f.dir.path().join("rules/promoted/L1-X.yaml");
        assert_eq!(std::fs::read_to_string(&path).unwrap(), RULE);

        let changed = RULE.replace("restart_service", "alert");
        let again = run(&f, "sync_promoted_rule", json!({"rule_id": "L1-X", "rule_yaml": changed}))
            .await
            .unwrap();
        assert_eq!(again["status"], "already_exists");
        assert_eq!(std::fs::read_to_string(&path).unwrap(), RULE);
    }

    #[tokio::test]
    async fn test_invalid_rule_never_touches_disk() {
        let f = fixture();
        let bad = RULE.replace("restart_service", "rm_rf");
        let err = run(&f, "sync_promoted_rule", json!({"rule_id": "L1-X", "rule_yaml": bad}))
            .await
            .unwrap_err();
        assert!(matches!(err, OrderError::ValidationFailure(_)));
        assert!(!f.dir.path().join("rules").exists());

        let err = run(&f, "sync_promoted_rule", json!({"rule_id": "../etc", "rule_yaml": RULE}))
            .await
            .unwrap_err();
        assert!(matches!(err, OrderError::ValidationFailure(_)));
    }

    #[tokio::test]
    async fn test_missing_parameters() {
        let f = fixture();
        let err = run(&f, "sync_promoted_rule", json!({"rule_id": "L1-X"})).await.unwrap_err();
        assert!(matches!(err, OrderError::ValidationFailure(_)));
    }

    #[tokio::test]
    async fn test_drift_and_rule_sync_signal() {
        let mut f = fixture();
        run(&f, "run_drift", json!({})).await.unwrap();
        run(&f, "sync_rules", json!({})).await.unwrap();
        assert_eq!(f.signals.try_recv().unwrap(), AgentSignal::DriftScanRequested);
        assert_eq!(f.signals.try_recv().unwrap(), AgentSignal::RuleSyncRequested);
    }
}
