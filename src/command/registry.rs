//! Order-type to handler table

use appliance_shared::{OrderError, Params};
use async_trait::async_trait;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::info;

pub type HandlerResult = Result<Params, OrderError>;

/// Context passed to order handlers
#[derive(Debug, Clone)]
pub struct HandlerContext {
    pub order_id: String,
    pub order_type: String,
    /// Scope of the batch this order runs in. Handlers may observe it; the
    /// dispatcher never uses it to abort an order in flight.
    pub cancel: CancellationToken,
}

/// An executable capability for one order type
#[async_trait]
pub trait OrderHandler: Send + Sync {
    async fn handle(&self, ctx: &HandlerContext, params: &Params) -> HandlerResult;
}

/// Adapter turning an async closure into a handler
pub struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> OrderHandler for FnHandler<F>
where
    F: Fn(HandlerContext, Params) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    async fn handle(&self, ctx: &HandlerContext, params: &Params) -> HandlerResult {
        (self.0)(ctx.clone(), params.clone()).await
    }
}

/// Wrap an async closure so it can be registered as a handler
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn OrderHandler>
where
    F: Fn(HandlerContext, Params) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    Arc::new(FnHandler(f))
}

/// Handlers by order type. Owned per dispatcher, never global.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: RwLock<HashMap<String, Arc<dyn OrderHandler>>>,
}

impl HandlerRegistry {
    /// Create a registry pre-populated with `handlers`
    pub fn new<I, K>(handlers: I) -> Self
    where
        I: IntoIterator<Item = (K, Arc<dyn OrderHandler>)>,
        K: Into<String>,
    {
        Self {
            handlers: RwLock::new(
                handlers
                    .into_iter()
                    .map(|(order_type, handler)| (order_type.into(), handler))
                    .collect(),
            ),
        }
    }

    /// Register `handler` for `order_type`, replacing any existing one.
    ///
    /// Returns true if a handler was replaced.
    pub async fn register(&self, order_type: impl Into<String>, handler: Arc<dyn OrderHandler>) -> bool {
        let order_type = order_type.into();
        let replaced = self
            .handlers
            .write()
            .await
            .insert(order_type.clone(), handler)
            .is_some();
        info!(
            "Handler for {} {}",
            order_type,
            if replaced { "replaced" } else { "registered" }
        );
        replaced
    }

    pub async fn get(&self, order_type: &str) -> Option<Arc<dyn OrderHandler>> {
        self.handlers.read().await.get(order_type).cloned()
    }

    /// Registered order types, sorted
    pub async fn order_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.handlers.read().await.keys().cloned().collect();
        types.sort();
        types
    }
}
