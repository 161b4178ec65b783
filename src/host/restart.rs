//! Detached delayed restart
//!
//! A scheduled restart runs on its own task, outside any batch cancellation
//! scope. Once scheduled it cannot be retracted by the order pipeline. The
//! scheduler keeps every task it spawns so the process can wait for them
//! before its runtime shuts down.

use super::runner::CommandRunner;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Schedules restarts of the agent service
pub struct RestartScheduler {
    runner: Arc<dyn CommandRunner>,
    command: Vec<String>,
    delay: Duration,
    scheduled: Mutex<Vec<JoinHandle<()>>>,
}

impl RestartScheduler {
    pub fn new(runner: Arc<dyn CommandRunner>, command: Vec<String>, delay: Duration) -> Self {
        Self {
            runner,
            command,
            delay,
            scheduled: Mutex::new(Vec::new()),
        }
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }

    /// Spawn the restart after the configured delay
    pub fn schedule(&self, reason: &str) {
        let runner = self.runner.clone();
        let command = self.command.clone();
        let delay = self.delay;
        let reason = reason.to_string();

        info!("Restart scheduled in {}s: {}", delay.as_secs(), reason);

        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            info!("Restarting agent: {}", reason);
            match runner.run(&command, None).await {
                Ok(out) if out.success => {}
                Ok(out) => warn!(
                    "Restart command exited with {:?}: {}",
                    out.exit_code,
                    out.tail(200)
                ),
                Err(e) => error!("Restart command failed: {}", e),
            }
        });

        let mut scheduled = self.lock_scheduled();
        scheduled.retain(|h| !h.is_finished());
        scheduled.push(handle);
    }

    /// Restarts scheduled but not yet run
    pub fn outstanding(&self) -> usize {
        self.lock_scheduled().iter().filter(|h| !h.is_finished()).count()
    }

    /// Wait for every scheduled restart to run.
    ///
    /// Must be awaited before the runtime shuts down, otherwise pending
    /// restarts are dropped with it.
    pub async fn wait(&self) {
        let scheduled = std::mem::take(&mut *self.lock_scheduled());
        for handle in scheduled {
            if let Err(e) = handle.await {
                error!("Restart task failed: {}", e);
            }
        }
    }

    fn lock_scheduled(&self) -> MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.scheduled.lock().unwrap_or_else(|e| e.into_inner())
    }
}
