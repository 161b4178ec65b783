//! Workstation sensor management
//!
//! The appliance keeps the record of which workstations should carry a
//! sensor. Pushing the sensor itself is the workstation agent's job; it
//! reconciles against `sensors/<platform>.json`.

use super::{optional_str, required_str, status, HandlerDeps};
use crate::command::registry::{HandlerContext, HandlerResult, OrderHandler};
use crate::config::StatePaths;
use crate::host::io::atomic_write;
use crate::security::allowlist::validate_hostname;
use appliance_shared::{now_rfc3339, OrderError, Params};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, warn};

pub(super) fn handlers(deps: &HandlerDeps) -> Vec<(&'static str, Arc<dyn OrderHandler>)> {
    let windows = Arc::new(SensorRegistry::new(&deps.paths, Platform::Windows));
    let linux = Arc::new(SensorRegistry::new(&deps.paths, Platform::Linux));

    vec![
        ("deploy_sensor", SensorHandler::new(&windows, SensorOp::Deploy)),
        ("remove_sensor", SensorHandler::new(&windows, SensorOp::Remove)),
        ("sensor_status", SensorHandler::new(&windows, SensorOp::Status)),
        ("deploy_linux_sensor", SensorHandler::new(&linux, SensorOp::Deploy)),
        ("remove_linux_sensor", SensorHandler::new(&linux, SensorOp::Remove)),
        ("linux_sensor_status", SensorHandler::new(&linux, SensorOp::Status)),
    ]
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Platform {
    Windows,
    Linux,
}

impl Platform {
    fn as_str(self) -> &'static str {
        match self {
            Platform::Windows => "windows",
            Platform::Linux => "linux",
        }
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct RegistryFile {
    #[serde(default)]
    hosts: BTreeMap<String, String>,
}

/// Deployment records for one platform
struct SensorRegistry {
    platform: Platform,
    path: PathBuf,
    lock: Mutex<()>,
}

impl SensorRegistry {
    fn new(paths: &StatePaths, platform: Platform) -> Self {
        Self {
            platform,
            path: paths.sensor_registry(platform.as_str()),
            lock: Mutex::new(()),
        }
    }

    fn load(&self) -> RegistryFile {
        let raw = match std::fs::read(&self.path) {
            Ok(raw) => raw,
            Err(_) => return RegistryFile::default(),
        };
        serde_json::from_slice(&raw).unwrap_or_else(|e| {
            warn!("Discarding corrupt sensor registry {}: {}", self.path.display(), e);
            RegistryFile::default()
        })
    }

    fn save(&self, file: &RegistryFile) -> Result<(), OrderError> {
        let encoded = serde_json::to_vec_pretty(file)
            .map_err(|e| OrderError::handler(format!("cannot encode sensor registry: {e}")))?;
        atomic_write(&self.path, &encoded).map_err(|e| {
            OrderError::handler(format!("cannot write {}: {}", self.path.display(), e))
        })
    }
}

#[derive(Debug, Clone, Copy)]
enum SensorOp {
    Deploy,
    Remove,
    Status,
}

struct SensorHandler {
    registry: Arc<SensorRegistry>,
    op: SensorOp,
}

impl SensorHandler {
    fn new(registry: &Arc<SensorRegistry>, op: SensorOp) -> Arc<dyn OrderHandler> {
        Arc::new(Self {
            registry: registry.clone(),
            op,
        })
    }
}

#[async_trait]
impl OrderHandler for SensorHandler {
    async fn handle(&self, ctx: &HandlerContext, params: &Params) -> HandlerResult {
        let platform = self.registry.platform.as_str();
        let _guard = self.registry.lock.lock().await;
        let mut file = self.registry.load();

        match self.op {
            SensorOp::Deploy => {
                let host = validate_hostname(required_str(params, "hostname")?)?;
                let deployed_at = now_rfc3339();
                let previous = file.hosts.insert(host.clone(), deployed_at.clone());
                self.registry.save(&file)?;
                info!(order_id = %ctx.order_id, "{} sensor recorded for {}", platform, host);

                let mut result = status(if previous.is_some() { "redeployed" } else { "deployed" });
                result.insert("hostname".into(), json!(host));
                result.insert("platform".into(), json!(platform));
                result.insert("deployed_at".into(), json!(deployed_at));
                Ok(result)
            }
            SensorOp::Remove => {
                let host = validate_hostname(required_str(params, "hostname")?)?;
                let removed = file.hosts.remove(&host).is_some();
                if removed {
                    self.registry.save(&file)?;
                    info!(order_id = %ctx.order_id, "{} sensor removed from {}", platform, host);
                }

                let mut result = status(if removed { "removed" } else { "not_deployed" });
                result.insert("hostname".into(), json!(host));
                result.insert("platform".into(), json!(platform));
                Ok(result)
            }
            SensorOp::Status => {
                let mut result = Params::new();
                result.insert("platform".into(), json!(platform));
                match optional_str(params, "hostname")? {
                    Some(host) => {
                        let host = validate_hostname(host)?;
                        let deployed_at = file.hosts.get(&host);
                        result.insert("deployed".into(), json!(deployed_at.is_some()));
                        result.insert("deployed_at".into(), json!(deployed_at));
                        result.insert("hostname".into(), json!(host));
                    }
                    None => {
                        result.insert("count".into(), json!(file.hosts.len()));
                        result.insert("hosts".into(), json!(file.hosts));
                    }
                }
                Ok(result)
            }
        }
    }
}
