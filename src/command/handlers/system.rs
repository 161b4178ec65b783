//! System management orders: OS rebuild, updates, logs and diagnostics

use super::{optional_str, optional_u64, required_str, status, HandlerDeps};
use crate::command::registry::{HandlerContext, HandlerResult, OrderHandler};
use crate::config::StatePaths;
use crate::host::io::remove_if_exists;
use crate::host::{CommandRunner, RestartScheduler};
use crate::rebuild::RebuildOrchestrator;
use crate::security::allowlist::{
    diagnostic_command, log_command, validate_download_url, validate_sha256, LOG_UNITS,
};
use appliance_shared::{limits, OrderError, Params};
use async_trait::async_trait;
use serde_json::json;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

pub(super) fn handlers(deps: &HandlerDeps) -> Vec<(&'static str, Arc<dyn OrderHandler>)> {
    vec![
        (
            "nixos_rebuild",
            Arc::new(NixosRebuild {
                rebuild: deps.rebuild.clone(),
            }),
        ),
        (
            "update_agent",
            Arc::new(Update {
                kind: UpdateKind::Agent,
                paths: deps.paths.clone(),
                runner: deps.runner.clone(),
                restarts: deps.restarts.clone(),
                timeout: deps.download_timeout,
            }),
        ),
        (
            "update_iso",
            Arc::new(Update {
                kind: UpdateKind::Image,
                paths: deps.paths.clone(),
                runner: deps.runner.clone(),
                restarts: deps.restarts.clone(),
                timeout: deps.download_timeout,
            }),
        ),
        (
            "view_logs",
            Arc::new(ViewLogs {
                runner: deps.runner.clone(),
            }),
        ),
        (
            "diagnostic",
            Arc::new(Diagnostic {
                runner: deps.runner.clone(),
            }),
        ),
    ]
}

struct NixosRebuild {
    rebuild: Arc<RebuildOrchestrator>,
}

#[async_trait]
impl OrderHandler for NixosRebuild {
    async fn handle(&self, ctx: &HandlerContext, params: &Params) -> HandlerResult {
        self.rebuild.start(&ctx.order_id, params).await
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum UpdateKind {
    Agent,
    Image,
}

impl UpdateKind {
    fn artifact(self) -> &'static str {
        match self {
            UpdateKind::Agent => "appliance-agent",
            UpdateKind::Image => "appliance.iso",
        }
    }
}

/// Download an agent binary or OS image into the updates directory
struct Update {
    kind: UpdateKind,
    paths: StatePaths,
    runner: Arc<dyn CommandRunner>,
    restarts: Arc<RestartScheduler>,
    timeout: Duration,
}

#[async_trait]
impl OrderHandler for Update {
    async fn handle(&self, ctx: &HandlerContext, params: &Params) -> HandlerResult {
        let url = validate_download_url(optional_str(params, "url")?.unwrap_or_default())?;
        let expected = optional_str(params, "sha256")?
            .map(validate_sha256)
            .transpose()?;

        let target = self.paths.update_artifact(self.kind.artifact());
        let partial = target.with_extension("partial");
        if let Some(dir) = target.parent() {
            std::fs::create_dir_all(dir)
                .map_err(|e| OrderError::handler(format!("cannot create {}: {}", dir.display(), e)))?;
        }

        let argv: Vec<String> = vec![
            "curl".into(),
            "--fail".into(),
            "--silent".into(),
            "--show-error".into(),
            "--location".into(),
            "--proto".into(),
            "=https".into(),
            "-o".into(),
            partial.display().to_string(),
            url.to_string(),
        ];

        info!(order_id = %ctx.order_id, "Downloading {} from {}", self.kind.artifact(), url);
        let out = self
            .runner
            .run(&argv, Some(self.timeout))
            .await
            .map_err(|e| OrderError::handler(format!("download failed: {e}")))?;
        if !out.success {
            discard(&partial);
            return Err(OrderError::handler(format!(
                "download failed (exit {:?}): {}",
                out.exit_code,
                out.tail(limits::OUTPUT_TAIL_CHARS)
            )));
        }

        let (digest, bytes) = match sha256_file(partial.clone()).await {
            Ok(v) => v,
            Err(e) => {
                discard(&partial);
                return Err(OrderError::handler(format!("cannot hash download: {e}")));
            }
        };
        if let Some(expected) = expected {
            if digest != expected {
                discard(&partial);
                return Err(OrderError::handler(format!(
                    "sha256 mismatch: expected {expected}, got {digest}"
                )));
            }
        }

        std::fs::rename(&partial, &target)
            .map_err(|e| OrderError::handler(format!("cannot stage {}: {}", target.display(), e)))?;

        let mut result = status("staged");
        result.insert("path".into(), json!(target.display().to_string()));
        result.insert("sha256".into(), json!(digest));
        result.insert("bytes".into(), json!(bytes));

        if self.kind == UpdateKind::Agent {
            self.restarts.schedule(&format!("agent update {}", ctx.order_id));
            result.insert("status".into(), json!("restart_scheduled"));
            result.insert("restart_in_secs".into(), json!(self.restarts.delay().as_secs()));
        }
        Ok(result)
    }
}

fn discard(path: &Path) {
    if let Err(e) = remove_if_exists(path) {
        warn!("Cannot remove partial download {}: {}", path.display(), e);
    }
}

async fn sha256_file(path: PathBuf) -> std::io::Result<(String, u64)> {
    tokio::task::spawn_blocking(move || {
        let mut file = std::fs::File::open(&path)?;
        let mut hasher = Sha256::new();
        let bytes = std::io::copy(&mut file, &mut hasher)?;
        Ok::<_, std::io::Error>((hex::encode(hasher.finalize()), bytes))
    })
    .await
    .map_err(std::io::Error::other)?
}

struct ViewLogs {
    runner: Arc<dyn CommandRunner>,
}

#[async_trait]
impl OrderHandler for ViewLogs {
    async fn handle(&self, _ctx: &HandlerContext, params: &Params) -> HandlerResult {
        let argv = log_command(optional_str(params, "unit")?, optional_u64(params, "lines")?)?;

        let out = self
            .runner
            .run(&argv, None)
            .await
            .map_err(|e| OrderError::handler(format!("log retrieval failed: {e}")))?;
        if !out.success {
            return Err(OrderError::handler(format!(
                "journalctl exited with {:?}: {}",
                out.exit_code,
                out.tail(limits::OUTPUT_TAIL_CHARS)
            )));
        }

        let mut result = Params::new();
        result.insert("unit".into(), json!(argv[2]));
        result.insert("lines".into(), json!(argv[4].parse::<u64>().unwrap_or_default()));
        result.insert("logs".into(), json!(out.output));
        result.insert("allowed_units".into(), json!(LOG_UNITS));
        Ok(result)
    }
}

/// Run one of the pre-baked diagnostic commands.
///
/// A non-zero exit is still a successful retrieval; the exit code travels
/// in the result.
struct Diagnostic {
    runner: Arc<dyn CommandRunner>,
}

#[async_trait]
impl OrderHandler for Diagnostic {
    async fn handle(&self, _ctx: &HandlerContext, params: &Params) -> HandlerResult {
        let name = required_str(params, "command")?;
        let argv = diagnostic_command(name)?;

        let out = self
            .runner
            .run(&argv, None)
            .await
            .map_err(|e| OrderError::handler(format!("diagnostic {name} failed: {e}")))?;

        let mut result = Params::new();
        result.insert("command".into(), json!(name));
        result.insert("exit_code".into(), json!(out.exit_code));
        result.insert("output".into(), json!(out.output));
        Ok(result)
    }
}
