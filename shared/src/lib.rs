//! Appliance Shared Order Types
//!
//! This crate provides the order and result types exchanged between the
//! appliance agent and its transport collaborator, the error taxonomy every
//! rejection path maps onto, and the rebuild state machine.

pub mod error;
pub mod state_machine;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::time::{SystemTime, UNIX_EPOCH};

pub use error::OrderError;

/// String-keyed order parameters and handler results
pub type Params = Map<String, Value>;

/// Get current timestamp in fractional seconds since Unix epoch
pub fn now_secs() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

/// Current UTC time as an RFC 3339 string
pub fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339()
}

/// Operational limits for order execution
pub mod limits {
    use std::time::Duration;

    /// How long a nonce stays on record before it may be evicted
    pub const NONCE_RETENTION: Duration = Duration::from_secs(24 * 60 * 60);

    /// Upper bound on the rebuild-test step
    pub const REBUILD_TIMEOUT: Duration = Duration::from_secs(600);

    /// Delay before the detached restart fires after a test activation
    pub const RESTART_DELAY: Duration = Duration::from_secs(5);

    /// Upper bound on artifact downloads
    pub const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(300);

    /// Maximum characters of command output carried in a failure report
    pub const OUTPUT_TAIL_CHARS: usize = 2000;

    /// Maximum size of a promoted rule's YAML body
    pub const PROMOTED_RULE_MAX_BYTES: usize = 8 * 1024;

    /// Default and maximum journal lines for log retrieval
    pub const LOG_LINES_DEFAULT: u32 = 100;
    pub const LOG_LINES_MAX: u32 = 1000;
}

/// An administrative instruction delivered by the control service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    #[serde(default)]
    pub order_id: String,
    #[serde(default)]
    pub order_type: String,
    #[serde(default)]
    pub parameters: Option<Params>,
    #[serde(default)]
    pub nonce: Option<String>,
    #[serde(default)]
    pub signature: Option<String>,
    #[serde(default)]
    pub signed_payload: Option<String>,
}

impl Order {
    /// Create an unsigned order with the given parameters
    pub fn new(order_id: impl Into<String>, order_type: impl Into<String>, parameters: Params) -> Self {
        Self {
            order_id: order_id.into(),
            order_type: order_type.into(),
            parameters: Some(parameters),
            nonce: None,
            signature: None,
            signed_payload: None,
        }
    }

    /// Attach a replay-protection nonce
    pub fn with_nonce(mut self, nonce: impl Into<String>) -> Self {
        self.nonce = Some(nonce.into());
        self
    }

    /// Attach a signature and the payload it covers
    pub fn with_signature(mut self, signed_payload: impl Into<String>, signature: impl Into<String>) -> Self {
        self.signed_payload = Some(signed_payload.into());
        self.signature = Some(signature.into());
        self
    }

    /// Orders without an id or type cannot be attributed or dispatched
    pub fn is_well_formed(&self) -> bool {
        !self.order_id.is_empty() && !self.order_type.is_empty()
    }
}

/// Outcome of processing one order
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderResult {
    pub order_id: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Params>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl OrderResult {
    /// Create a result for a successfully executed order
    pub fn completed(order_id: impl Into<String>, result: Params) -> Self {
        Self {
            order_id: order_id.into(),
            success: true,
            result: Some(result),
            error: None,
        }
    }

    /// Create a result for a rejected or failed order
    pub fn failed(order_id: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            order_id: order_id.into(),
            success: false,
            result: None,
            error: Some(error.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_order_deserialize_minimal() {
        let order: Order =
            serde_json::from_str(r#"{"order_id":"ord-1","order_type":"force_checkin"}"#).unwrap();
        assert_eq!(order.order_id, "ord-1");
        assert!(order.parameters.is_none());
        assert!(order.nonce.is_none());
        assert!(order.is_well_formed());
    }

    #[test]
    fn test_order_malformed() {
        let order = Order::new("", "force_checkin", Params::new());
        assert!(!order.is_well_formed());
        let order = Order::new("ord-1", "", Params::new());
        assert!(!order.is_well_formed());

        let order: Order = serde_json::from_str(r#"{"order_type":"force_checkin"}"#).unwrap();
        assert!(!order.is_well_formed());
    }

    #[test]
    fn test_result_serialization_skips_empty_fields() {
        let result = OrderResult::failed("ord-1", "boom");
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["success"], false);
        assert_eq!(json["error"], "boom");
        assert!(json.get("result").is_none());
    }
}
