//! Persistent replay protection
//!
//! Nonces are kept for [`limits::NONCE_RETENTION`] and written to a single
//! JSON file after every accepted order, so a restart never reopens the
//! replay window.

use crate::host::io::atomic_write;
use appliance_shared::{limits, now_secs, OrderError};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{info, warn};

#[derive(Debug, Default, Deserialize)]
struct NonceFile {
    #[serde(default)]
    nonces: HashMap<String, f64>,
}

#[derive(Serialize)]
struct NonceFileRef<'a> {
    nonces: &'a HashMap<String, f64>,
}

/// Records every nonce seen within the retention window
pub struct NonceStore {
    path: PathBuf,
    retention: Duration,
    seen: Mutex<HashMap<String, f64>>,
}

impl NonceStore {
    /// Open the store at `path`, loading and pruning any persisted table
    pub fn open(path: impl Into<PathBuf>) -> Self {
        Self::open_with_retention(path, limits::NONCE_RETENTION)
    }

    pub fn open_with_retention(path: impl Into<PathBuf>, retention: Duration) -> Self {
        let path = path.into();
        let mut seen = load(&path);
        let loaded = seen.len();
        let evicted = evict(&mut seen, now_secs(), retention);

        info!(
            "Nonce store {}: loaded {} nonces, evicted {} expired",
            path.display(),
            loaded - evicted,
            evicted
        );

        Self {
            path,
            retention,
            seen: Mutex::new(seen),
        }
    }

    /// Reject a replayed nonce, otherwise record it and persist the table
    pub async fn check_and_record(&self, nonce: &str) -> Result<(), OrderError> {
        self.check_and_record_at(nonce, now_secs()).await
    }

    async fn check_and_record_at(&self, nonce: &str, now: f64) -> Result<(), OrderError> {
        let mut seen = self.seen.lock().await;

        if seen.contains_key(nonce) {
            return Err(OrderError::NonceReplay(nonce.to_string()));
        }

        seen.insert(nonce.to_string(), now);
        evict(&mut seen, now, self.retention);

        let encoded = serde_json::to_vec(&NonceFileRef { nonces: &seen });
        let persisted = encoded
            .map_err(std::io::Error::from)
            .and_then(|bytes| atomic_write(&self.path, &bytes));
        if let Err(e) = persisted {
            warn!(
                "Failed to persist nonce table to {}: {} (replay protection is memory-only until next write)",
                self.path.display(),
                e
            );
        }

        Ok(())
    }

    /// Number of nonces currently on record
    pub async fn len(&self) -> usize {
        self.seen.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

fn load(path: &Path) -> HashMap<String, f64> {
    let raw = match std::fs::read(path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return HashMap::new(),
        Err(e) => {
            warn!("Cannot read nonce table {}: {}", path.display(), e);
            return HashMap::new();
        }
    };

    match serde_json::from_slice::<NonceFile>(&raw) {
        Ok(file) => file.nonces,
        Err(e) => {
            warn!("Discarding corrupt nonce table {}: {}", path.display(), e);
            HashMap::new()
        }
    }
}

/// Drop entries older than `retention`, returning how many were removed
fn evict(seen: &mut HashMap<String, f64>, now: f64, retention: Duration) -> usize {
    let cutoff = now - retention.as_secs_f64();
    let before = seen.len();
    seen.retain(|_, first_seen| *first_seen >= cutoff);
    before - seen.len()
}
