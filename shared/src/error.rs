//! Order rejection and failure taxonomy
//!
//! Every variant except [`OrderError::MalformedOrder`] ends in a completion
//! report carrying `success = false` and the variant's display text.

use thiserror::Error;

/// Errors raised while authenticating, admitting or executing an order
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum OrderError {
    #[error("malformed order: {0}")]
    MalformedOrder(String),

    #[error("invalid server public key: {0}")]
    InvalidKey(String),

    #[error("signature verification failed: {0}")]
    SignatureInvalid(String),

    #[error("unsigned order rejected: signature required")]
    UnsignedOrderRejected,

    #[error("order targets appliance {target}, this appliance is {local}")]
    HostScopeMismatch { target: String, local: String },

    #[error("order expired at {0}")]
    OrderExpired(String),

    #[error("nonce replay detected: {0}")]
    NonceReplay(String),

    #[error("unknown order type: {0}")]
    UnknownOrderType(String),

    #[error("validation failed: {0}")]
    ValidationFailure(String),

    #[error("{0}")]
    HandlerExecution(String),
}

impl OrderError {
    /// Rejections that should stand out in forensic review of the logs
    pub fn is_security_relevant(&self) -> bool {
        matches!(
            self,
            OrderError::SignatureInvalid(_)
                | OrderError::UnsignedOrderRejected
                | OrderError::HostScopeMismatch { .. }
                | OrderError::OrderExpired(_)
                | OrderError::NonceReplay(_)
                | OrderError::ValidationFailure(_)
        )
    }

    /// Shorthand for a handler failure with a formatted message
    pub fn handler(message: impl Into<String>) -> Self {
        OrderError::HandlerExecution(message.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_type_message() {
        let err = OrderError::UnknownOrderType("teleport".into());
        assert_eq!(err.to_string(), "unknown order type: teleport");
        assert!(!err.is_security_relevant());
    }

    #[test]
    fn test_security_relevance() {
        assert!(OrderError::UnsignedOrderRejected.is_security_relevant());
        assert!(OrderError::NonceReplay("n-1".into()).is_security_relevant());
        assert!(OrderError::ValidationFailure("bad url".into()).is_security_relevant());
        assert!(!OrderError::handler("exit status 1").is_security_relevant());
    }
}
