//! Request handlers and method tables.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value;

use crate::endpoint::Endpoint;

/// Answers one named request method.
///
/// A failure is sent back to the caller as a reject response carrying the
/// error's message.
#[async_trait]
pub trait RequestHandler: Send + Sync + 'static {
    /// Handle a request received on `endpoint`.
    async fn handle(&self, endpoint: Arc<Endpoint>, data: Value) -> anyhow::Result<Value>;
}

#[async_trait]
impl<F, Fut> RequestHandler for F
where
    F: Fn(Arc<Endpoint>, Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
{
    async fn handle(&self, endpoint: Arc<Endpoint>, data: Value) -> anyhow::Result<Value> {
        self(endpoint, data).await
    }
}

/// Name to handler map, cheap to clone and safe to share between connections.
#[derive(Clone, Default)]
pub struct MethodTable {
    methods: Arc<RwLock<HashMap<String, Arc<dyn RequestHandler>>>>,
}

impl MethodTable {
    /// Create an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register or replace the handler for `name`.
    pub fn insert(&self, name: impl Into<String>, handler: Arc<dyn RequestHandler>) {
        self.methods.write().insert(name.into(), handler);
    }

    /// Remove the handler for `name`, returning whether one existed.
    pub fn remove(&self, name: &str) -> bool {
        self.methods.write().remove(name).is_some()
    }

    /// Look up the handler for `name`.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<dyn RequestHandler>> {
        self.methods.read().get(name).cloned()
    }
}

impl fmt::Debug for MethodTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let methods = self.methods.read();
        f.debug_set().entries(methods.keys()).finish()
    }
}
