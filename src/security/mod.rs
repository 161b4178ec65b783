//! Security Module
//!
//! Everything an order must get past before a handler runs: signature and
//! host-scope verification, replay protection, and parameter allowlists.

pub mod allowlist;
mod nonce;
mod verifier;

pub use allowlist::ValidationError;
pub use nonce::NonceStore;
pub use verifier::OrderVerifier;

#[cfg(test)]
pub(crate) use verifier::testing;
