//! Requests handed from order handlers to the agent's main loop

use std::fmt;

/// Work owned by subsystems outside the order engine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentSignal {
    /// Run a check-in with the control service now
    CheckinRequested,
    /// Re-fetch credentials from the control service
    CredentialRefreshRequested,
    /// Run a compliance drift scan
    DriftScanRequested,
    /// Pull the latest compliance rule bundle
    RuleSyncRequested,
}

impl fmt::Display for AgentSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AgentSignal::CheckinRequested => write!(f, "checkin"),
            AgentSignal::CredentialRefreshRequested => write!(f, "credential refresh"),
            AgentSignal::DriftScanRequested => write!(f, "drift scan"),
            AgentSignal::RuleSyncRequested => write!(f, "rule sync"),
        }
    }
}
