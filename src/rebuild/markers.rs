//! Durable rebuild markers
//!
//! The only state in the engine that outlives a process restart. Layout:
//! - `.rebuild-in-progress`: JSON `{timestamp, previous_system, flake_ref}`
//! - `.pending-rebuild-order`: plain-text order id
//! - `.rebuild-verified`: plain-text timestamp, read by the external watchdog

use crate::config::StatePaths;
use crate::host::io::{atomic_write, remove_if_exists};
use serde::{Deserialize, Serialize};
use std::io;
use tracing::warn;

/// Contents of `.rebuild-in-progress`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InProgressMarker {
    pub timestamp: String,
    pub previous_system: String,
    pub flake_ref: String,
}

/// Load/save routines for the rebuild marker files
#[derive(Debug, Clone)]
pub struct RebuildMarkers {
    paths: StatePaths,
}

impl RebuildMarkers {
    pub fn new(paths: StatePaths) -> Self {
        Self { paths }
    }

    /// Record that a rebuild for `order_id` has started.
    ///
    /// Either both markers are written or neither is left behind.
    pub fn begin(&self, order_id: &str, marker: &InProgressMarker) -> io::Result<()> {
        let encoded = serde_json::to_vec_pretty(marker)?;
        let in_progress = self.paths.rebuild_in_progress();
        atomic_write(&in_progress, &encoded)?;

        if let Err(e) = atomic_write(&self.paths.pending_rebuild_order(), order_id.as_bytes()) {
            if let Err(cleanup) = remove_if_exists(&in_progress) {
                warn!("Failed to remove {}: {}", in_progress.display(), cleanup);
            }
            return Err(e);
        }
        Ok(())
    }

    /// The in-progress marker, if present and readable
    pub fn in_progress(&self) -> Option<InProgressMarker> {
        let path = self.paths.rebuild_in_progress();
        let raw = std::fs::read(&path).ok()?;
        match serde_json::from_slice(&raw) {
            Ok(marker) => Some(marker),
            Err(e) => {
                warn!("Ignoring unreadable rebuild marker {}: {}", path.display(), e);
                None
            }
        }
    }

    /// Order id of a rebuild awaiting post-restart confirmation
    pub fn pending_order_id(&self) -> Option<String> {
        let raw = std::fs::read_to_string(self.paths.pending_rebuild_order()).ok()?;
        let order_id = raw.trim();
        (!order_id.is_empty()).then(|| order_id.to_string())
    }

    /// Write the marker the external watchdog looks for
    pub fn mark_verified(&self, timestamp: &str) -> io::Result<()> {
        atomic_write(&self.paths.rebuild_verified(), timestamp.as_bytes())
    }

    pub fn verified_at(&self) -> Option<String> {
        std::fs::read_to_string(self.paths.rebuild_verified())
            .ok()
            .map(|s| s.trim().to_string())
    }

    /// Remove the in-progress and pending markers
    pub fn clear(&self) -> io::Result<()> {
        remove_if_exists(&self.paths.rebuild_in_progress())?;
        remove_if_exists(&self.paths.pending_rebuild_order())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn marker() -> InProgressMarker {
        InProgressMarker {
            timestamp: "2026-01-01T00:00:00+00:00".into(),
            previous_system: "/nix/store/abc-nixos-system".into(),
            flake_ref: "github:fleet-appliance/appliance-os#appliance".into(),
        }
    }

    #[test]
    fn test_begin_and_load() {
        let dir = TempDir::new().unwrap();
        let markers = RebuildMarkers::new(StatePaths::new(dir.path()));
        assert!(markers.pending_order_id().is_none());
        assert!(markers.in_progress().is_none());

        markers.begin("ord-9", &marker()).unwrap();
        assert_eq!(markers.pending_order_id().as_deref(), Some("ord-9"));
        assert_eq!(markers.in_progress(), Some(marker()));

        let raw = std::fs::read_to_string(dir.path().join(".pending-rebuild-order")).unwrap();
        assert_eq!(raw, "ord-9");
    }

    #[test]
    fn test_clear_and_verify() {
        let dir = TempDir::new().unwrap();
        let markers = RebuildMarkers::new(StatePaths::new(dir.path()));
        markers.begin("ord-9", &marker()).unwrap();

        markers.mark_verified("2026-01-01T00:05:00+00:00").unwrap();
        markers.clear().unwrap();

        assert!(markers.pending_order_id().is_none());
        assert!(markers.in_progress().is_none());
        assert_eq!(markers.verified_at().as_deref(), Some("2026-01-01T00:05:00+00:00"));

        // clearing twice is fine
        markers.clear().unwrap();
    }

    #[test]
    fn test_begin_failure_leaves_no_marker() {
        let dir = TempDir::new().unwrap();
        let blocker = dir.path().join(".pending-rebuild-order");
        std::fs::create_dir(&blocker).unwrap();
        std::fs::write(blocker.join("occupied"), "x").unwrap();

        let markers = RebuildMarkers::new(StatePaths::new(dir.path()));
        assert!(markers.begin("ord-9", &marker()).is_err());
        assert!(!dir.path().join(".rebuild-in-progress").exists());
    }

    #[test]
    fn test_corrupt_in_progress_ignored() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join(".rebuild-in-progress"), "{not json").unwrap();
        std::fs::write(dir.path().join(".pending-rebuild-order"), "  \n").unwrap();

        let markers = RebuildMarkers::new(StatePaths::new(dir.path()));
        assert!(markers.in_progress().is_none());
        assert!(markers.pending_order_id().is_none());
    }
}
