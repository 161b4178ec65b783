//! On-appliance order execution engine
//!
//! Receives administrative orders from the control service, authenticates
//! them, rejects replays and out-of-scope orders, and runs each through an
//! allowlist-validated handler. OS rebuilds go through a two-phase protocol
//! that survives the agent restart between activation and confirmation.

pub mod command;
pub mod config;
pub mod host;
pub mod rebuild;
pub mod security;
pub mod transport;

pub use command::{AgentSignal, OrderDispatcher};
pub use config::AgentConfig;
