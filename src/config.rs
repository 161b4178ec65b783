//! Agent configuration and state-directory layout

use anyhow::{Context, Result};
use appliance_shared::limits;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const NONCE_FILE: &str = "used_nonces.json";
pub const REBUILD_IN_PROGRESS_FILE: &str = ".rebuild-in-progress";
pub const PENDING_REBUILD_ORDER_FILE: &str = ".pending-rebuild-order";
pub const REBUILD_VERIFIED_FILE: &str = ".rebuild-verified";
pub const PROMOTED_RULES_DIR: &str = "rules/promoted";
pub const SENSORS_DIR: &str = "sensors";
pub const UPDATES_DIR: &str = "updates";

/// Configuration for the order execution engine
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// This appliance's identity, known after the first check-in
    pub appliance_id: Option<String>,
    /// Directory holding nonces, rebuild markers and promoted rules
    pub state_dir: PathBuf,
    /// Hex-encoded Ed25519 key of the control service
    pub server_public_key: Option<String>,
    /// Upper bound on the rebuild-test step
    pub rebuild_timeout: Duration,
    /// Delay before the detached restart after a test activation
    pub restart_delay: Duration,
    /// Command used to restart the agent service
    pub restart_command: Vec<String>,
    /// Symlink to the currently active system configuration
    pub current_system_link: PathBuf,
    /// Upper bound on artifact downloads
    pub download_timeout: Duration,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            appliance_id: None,
            state_dir: PathBuf::from("/var/lib/appliance-agent"),
            server_public_key: None,
            rebuild_timeout: limits::REBUILD_TIMEOUT,
            restart_delay: limits::RESTART_DELAY,
            restart_command: vec![
                "systemctl".into(),
                "restart".into(),
                "appliance-agent.service".into(),
            ],
            current_system_link: PathBuf::from("/run/current-system"),
            download_timeout: limits::DOWNLOAD_TIMEOUT,
        }
    }
}

impl AgentConfig {
    /// Defaults rooted at the given state directory
    pub fn with_state_dir(state_dir: impl Into<PathBuf>) -> Self {
        Self {
            state_dir: state_dir.into(),
            ..Default::default()
        }
    }

    /// Load defaults, then apply `APPLIANCE_*` environment overrides
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();

        if let Some(id) = lookup("APPLIANCE_ID").filter(|v| !v.is_empty()) {
            config.appliance_id = Some(id);
        }
        if let Some(dir) = lookup("APPLIANCE_STATE_DIR").filter(|v| !v.is_empty()) {
            config.state_dir = PathBuf::from(dir);
        }
        if let Some(key) = lookup("APPLIANCE_SERVER_PUBLIC_KEY").filter(|v| !v.is_empty()) {
            config.server_public_key = Some(key);
        }
        if let Some(secs) = lookup("APPLIANCE_REBUILD_TIMEOUT_SECS") {
            let secs: u64 = secs
                .parse()
                .with_context(|| format!("APPLIANCE_REBUILD_TIMEOUT_SECS is not a number: {secs}"))?;
            config.rebuild_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = lookup("APPLIANCE_RESTART_DELAY_SECS") {
            let secs: u64 = secs
                .parse()
                .with_context(|| format!("APPLIANCE_RESTART_DELAY_SECS is not a number: {secs}"))?;
            config.restart_delay = Duration::from_secs(secs);
        }

        Ok(config)
    }

    /// Paths inside the configured state directory
    pub fn paths(&self) -> StatePaths {
        StatePaths::new(&self.state_dir)
    }
}

/// Locations of every file the engine persists
#[derive(Debug, Clone)]
pub struct StatePaths {
    root: PathBuf,
}

impl StatePaths {
    pub fn new(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
        }
    }

    pub fn nonce_file(&self) -> PathBuf {
        self.root.join(NONCE_FILE)
    }

    pub fn rebuild_in_progress(&self) -> PathBuf {
        self.root.join(REBUILD_IN_PROGRESS_FILE)
    }

    pub fn pending_rebuild_order(&self) -> PathBuf {
        self.root.join(PENDING_REBUILD_ORDER_FILE)
    }

    pub fn rebuild_verified(&self) -> PathBuf {
        self.root.join(REBUILD_VERIFIED_FILE)
    }

    pub fn promoted_rule(&self, rule_id: &str) -> PathBuf {
        self.root.join(PROMOTED_RULES_DIR).join(format!("{rule_id}.yaml"))
    }

    pub fn sensor_registry(&self, platform: &str) -> PathBuf {
        self.root.join(SENSORS_DIR).join(format!("{platform}.json"))
    }

    pub fn update_artifact(&self, file_name: &str) -> PathBuf {
        self.root.join(UPDATES_DIR).join(file_name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            ("APPLIANCE_ID", "appliance-7"),
            ("APPLIANCE_STATE_DIR", "/tmp/agent"),
            ("APPLIANCE_REBUILD_TIMEOUT_SECS", "30"),
        ]
        .into_iter()
        .collect();

        let config = AgentConfig::from_lookup(|k| env.get(k).map(|v| v.to_string())).unwrap();
        assert_eq!(config.appliance_id.as_deref(), Some("appliance-7"));
        assert_eq!(config.state_dir, PathBuf::from("/tmp/agent"));
        assert_eq!(config.rebuild_timeout, Duration::from_secs(30));
        assert_eq!(config.restart_delay, limits::RESTART_DELAY);
        assert!(config.server_public_key.is_none());
    }

    #[test]
    fn test_bad_timeout_is_an_error() {
        let result = AgentConfig::from_lookup(|k| {
            (k == "APPLIANCE_REBUILD_TIMEOUT_SECS").then(|| "soon".to_string())
        });
        assert!(result.is_err());
    }

    #[test]
    fn test_state_paths() {
        let paths = AgentConfig::with_state_dir("/state").paths();
        assert_eq!(paths.nonce_file(), PathBuf::from("/state/used_nonces.json"));
        assert_eq!(
            paths.promoted_rule("L1-X"),
            PathBuf::from("/state/rules/promoted/L1-X.yaml")
        );
        assert_eq!(
            paths.pending_rebuild_order(),
            PathBuf::from("/state/.pending-rebuild-order")
        );
    }
}
