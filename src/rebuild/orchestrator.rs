//! Two-phase OS configuration update
//!
//! Phase one activates the new configuration with `nixos-rebuild test`, which
//! does not touch the boot default, then schedules a detached restart of the
//! agent. Phase two happens on the first check-in after that restart: the
//! pending order is reported successful and the verified marker is written.
//! Making the generation permanent (or rolling it back when the marker never
//! appears) is the external watchdog's job.

use super::markers::{InProgressMarker, RebuildMarkers};
use crate::config::AgentConfig;
use crate::host::{CommandRunner, RestartScheduler};
use crate::security::allowlist::validate_flake_ref;
use crate::transport::CompletionReporter;
use appliance_shared::state_machine::{RebuildEvent, RebuildPhase, RebuildStateMachine};
use appliance_shared::{limits, now_rfc3339, OrderError, OrderResult, Params};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

/// Drives a rebuild from test activation to post-restart verification
pub struct RebuildOrchestrator {
    markers: RebuildMarkers,
    runner: Arc<dyn CommandRunner>,
    restarts: Arc<RestartScheduler>,
    timeout: Duration,
    current_system_link: PathBuf,
    fsm: Mutex<RebuildStateMachine>,
}

impl RebuildOrchestrator {
    /// Create an orchestrator, resuming from any markers left by a previous run
    pub fn new(
        config: &AgentConfig,
        runner: Arc<dyn CommandRunner>,
        restarts: Arc<RestartScheduler>,
    ) -> Self {
        let markers = RebuildMarkers::new(config.paths());
        let pending = markers.pending_order_id();
        if let Some(order_id) = &pending {
            info!("Rebuild order {} is awaiting post-restart verification", order_id);
        }

        let mut fsm = RebuildStateMachine::resume(pending.is_some());
        if pending.is_none() {
            if let Some(marker) = markers.in_progress() {
                let current = current_system(&config.current_system_link);
                if marker.previous_system != "unknown"
                    && current.as_deref() == Some(marker.previous_system.as_str())
                {
                    warn!(
                        "Rebuild of {} was rolled back, running previous system {}",
                        marker.flake_ref, marker.previous_system
                    );
                    fsm = RebuildStateMachine::resume(true);
                    fsm.process_event(RebuildEvent::RollbackObserved);
                    if let Err(e) = markers.clear() {
                        warn!("Failed to clear rolled back rebuild marker: {}", e);
                    }
                }
            }
        }

        Self {
            markers,
            runner,
            restarts,
            timeout: config.rebuild_timeout,
            current_system_link: config.current_system_link.clone(),
            fsm: Mutex::new(fsm),
        }
    }

    pub async fn phase(&self) -> RebuildPhase {
        self.fsm.lock().await.phase()
    }

    pub fn markers(&self) -> &RebuildMarkers {
        &self.markers
    }

    /// Run phase one for `order_id`
    pub async fn start(&self, order_id: &str, params: &Params) -> Result<Params, OrderError> {
        let requested = match params.get("flake_ref") {
            None | Some(Value::Null) => "",
            Some(Value::String(s)) => s.as_str(),
            Some(_) => {
                return Err(OrderError::ValidationFailure(
                    "flake_ref must be a string".into(),
                ))
            }
        };
        let flake_ref = validate_flake_ref(requested)?;

        let mut fsm = self.fsm.lock().await;
        if let Some(pending) = self.markers.pending_order_id() {
            return Err(OrderError::handler(format!(
                "rebuild for order {pending} is still awaiting verification"
            )));
        }
        if !fsm.can_start() {
            return Err(OrderError::handler(format!(
                "rebuild cannot start while {:?}",
                fsm.phase()
            )));
        }

        let previous_system =
            current_system(&self.current_system_link).unwrap_or_else(|| "unknown".to_string());

        let marker = InProgressMarker {
            timestamp: now_rfc3339(),
            previous_system: previous_system.clone(),
            flake_ref: flake_ref.clone(),
        };
        self.markers
            .begin(order_id, &marker)
            .map_err(|e| OrderError::handler(format!("cannot record rebuild markers: {e}")))?;

        info!(
            "Rebuild {}: testing {} (previous system {})",
            order_id, flake_ref, previous_system
        );

        let argv: Vec<String> = vec![
            "nixos-rebuild".into(),
            "test".into(),
            "--flake".into(),
            flake_ref.clone(),
        ];

        let failure = match self.runner.run(&argv, Some(self.timeout)).await {
            Ok(out) if out.success => None,
            Ok(out) => Some(format!(
                "nixos-rebuild test exited with {}: {}",
                out.exit_code
                    .map(|c| c.to_string())
                    .unwrap_or_else(|| "signal".into()),
                out.tail(limits::OUTPUT_TAIL_CHARS)
            )),
            Err(e) => Some(format!("nixos-rebuild test failed: {e}")),
        };

        if let Some(message) = failure {
            fsm.process_event(RebuildEvent::TestFailed);
            if let Err(e) = self.markers.clear() {
                warn!("Failed to clear rebuild markers after failed test: {}", e);
            }
            return Err(OrderError::HandlerExecution(message));
        }

        fsm.process_event(RebuildEvent::TestSucceeded);
        // Detached: the order pipeline neither awaits nor cancels this restart
        self.restarts.schedule(&format!("rebuild order {order_id} activated"));

        let mut result = Params::new();
        result.insert("status".into(), json!("test_activated"));
        result.insert("flake_ref".into(), json!(flake_ref));
        result.insert("previous_system".into(), json!(previous_system));
        result.insert(
            "restart_in_secs".into(),
            json!(self.restarts.delay().as_secs()),
        );
        result.insert(
            "message".into(),
            json!("configuration activated without changing the boot default; it is persisted only after the post-restart check-in is verified"),
        );
        Ok(result)
    }

    /// Confirm a rebuild left pending by a previous process.
    ///
    /// Running and checking in again after the restart is the proof that the
    /// test configuration works. Returns the reported result, or `None` when
    /// there was nothing to confirm.
    pub async fn complete_pending(&self, reporter: &dyn CompletionReporter) -> Option<OrderResult> {
        let mut fsm = self.fsm.lock().await;
        let order_id = self.markers.pending_order_id()?;

        if fsm.awaiting_restart() {
            debug!("Rebuild {} activated by this process, waiting for restart", order_id);
            return None;
        }

        let marker = self.markers.in_progress();
        let verified_at = now_rfc3339();

        let mut result = Params::new();
        result.insert("status".into(), json!("verified"));
        result.insert("verified_at".into(), json!(verified_at));
        if let Some(marker) = &marker {
            result.insert("flake_ref".into(), json!(marker.flake_ref));
            result.insert("previous_system".into(), json!(marker.previous_system));
            result.insert("started_at".into(), json!(marker.timestamp));
        }

        if let Err(e) = reporter.report(&order_id, true, Some(&result), None).await {
            warn!("Failed to report verified rebuild {}: {}", order_id, e);
        }
        if let Err(e) = self.markers.mark_verified(&verified_at) {
            error!(
                "Failed to write rebuild verified marker, watchdog will roll back: {}",
                e
            );
        }
        if let Err(e) = self.markers.clear() {
            warn!("Failed to clear rebuild markers: {}", e);
        }
        fsm.process_event(RebuildEvent::CheckinConfirmed);

        info!("Rebuild {} verified after restart", order_id);
        Some(OrderResult::completed(order_id, result))
    }
}

/// Store path the current-system link points at
fn current_system(link: &Path) -> Option<String> {
    std::fs::read_link(link).ok().map(|p| p.display().to_string())
}
