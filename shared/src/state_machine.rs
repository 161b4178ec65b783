//! Rebuild State Machine
//!
//! Defines the phases of a two-phase OS configuration update and the valid
//! transitions between them. The persisted marker files are the durable form
//! of this machine; the machine itself is rebuilt from them on every start.

/// Phases of a two-phase rebuild
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RebuildPhase {
    /// No rebuild underway
    Idle,
    /// New configuration activated in this process lifetime, restart pending
    TestActivated,
    /// Process restarted with a rebuild order still awaiting confirmation
    PendingVerification,
    /// Post-restart check-in observed, verified marker written
    Verified,
    /// External watchdog reverted the configuration
    RolledBack,
}

/// Events that can trigger phase transitions
#[derive(Debug, Clone, PartialEq)]
pub enum RebuildEvent {
    /// Rebuild-test step exited successfully
    TestSucceeded,
    /// Rebuild-test step failed or timed out
    TestFailed,
    /// Agent came back up after a test activation
    Restarted,
    /// Post-restart check-in confirmed the configuration
    CheckinConfirmed,
    /// Watchdog reverted to the previous generation
    RollbackObserved,
}

/// Result of a transition attempt
#[derive(Debug, Clone, PartialEq)]
pub enum TransitionResult {
    /// Transition was valid and the phase changed (or stayed put legitimately)
    Success(RebuildPhase),
    /// Transition was invalid from the current phase
    Invalid { from: RebuildPhase, event: RebuildEvent },
    /// The rebuild was abandoned before activation
    Aborted { reason: String },
}

/// Tracks where the appliance is in the rebuild cycle
#[derive(Debug)]
pub struct RebuildStateMachine {
    current_phase: RebuildPhase,
}

impl Default for RebuildStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl RebuildStateMachine {
    /// Create a new state machine in Idle phase
    pub fn new() -> Self {
        Self {
            current_phase: RebuildPhase::Idle,
        }
    }

    /// Rebuild the machine from what was found on disk at startup.
    ///
    /// A pending rebuild order that outlived the previous process means the
    /// agent restarted after a test activation.
    pub fn resume(pending_order: bool) -> Self {
        let mut fsm = Self::new();
        if pending_order {
            fsm.current_phase = RebuildPhase::TestActivated;
            fsm.process_event(RebuildEvent::Restarted);
        }
        fsm
    }

    /// Get current phase
    pub fn phase(&self) -> RebuildPhase {
        self.current_phase
    }

    /// Whether a new rebuild may begin from the current phase
    pub fn can_start(&self) -> bool {
        matches!(
            self.current_phase,
            RebuildPhase::Idle | RebuildPhase::Verified | RebuildPhase::RolledBack
        )
    }

    /// Whether a pending order may be confirmed by a check-in now.
    ///
    /// A check-in from the same process that activated the configuration
    /// proves nothing about surviving a restart.
    pub fn awaiting_restart(&self) -> bool {
        self.current_phase == RebuildPhase::TestActivated
    }

    /// Process an event and return the transition result
    pub fn process_event(&mut self, event: RebuildEvent) -> TransitionResult {
        if event == RebuildEvent::TestFailed && self.can_start() {
            self.current_phase = RebuildPhase::Idle;
            return TransitionResult::Aborted {
                reason: "rebuild test failed before activation".into(),
            };
        }

        match self.get_next_phase(&event) {
            Some(phase) => {
                self.current_phase = phase;
                TransitionResult::Success(phase)
            }
            None => TransitionResult::Invalid {
                from: self.current_phase,
                event,
            },
        }
    }

    /// Get the next phase for a given event, if the transition is valid
    fn get_next_phase(&self, event: &RebuildEvent) -> Option<RebuildPhase> {
        use RebuildEvent::*;
        use RebuildPhase::*;

        match (self.current_phase, event) {
            (Idle | Verified | RolledBack, TestSucceeded) => Some(TestActivated),

            (TestActivated, Restarted) => Some(PendingVerification),

            // A marker left by an earlier run can be confirmed from Idle too
            (PendingVerification | Idle, CheckinConfirmed) => Some(Verified),

            (TestActivated | PendingVerification, RollbackObserved) => Some(RolledBack),

            _ => None,
        }
    }
}
