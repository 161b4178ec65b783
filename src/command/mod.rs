//! Order execution
//!
//! This module handles:
//! - Authenticating and deduplicating incoming orders
//! - Dispatching to the registered handler for each order type
//! - Reporting every outcome to the completion reporter

mod dispatcher;
pub mod handlers;
mod registry;
mod signal;

pub use dispatcher::OrderDispatcher;
pub use handlers::{default_handlers, HandlerDeps, HEALING_ORDER_TYPE};
pub use registry::{handler_fn, FnHandler, HandlerContext, HandlerRegistry, HandlerResult, OrderHandler};
pub use signal::AgentSignal;
