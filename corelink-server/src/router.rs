//! Operator routing and middleware chains.
//!
//! Route patterns are developer-chosen strings; the wire carries their
//! CRC32-IEEE. Values at or below 1024 are reserved for the framework
//! (0 is heartbeat) and cannot be bound. Two distinct patterns can hash
//! to the same operator; the router never resolves such a collision, it
//! only reports it.

use crate::context::Context;
use crate::error::ServerError;
use corelink_protocol::{operator_code, OPERATOR_RESERVED_MAX};
use std::collections::HashMap;
use std::sync::Arc;

/// A request handler. Panics are caught per-task by the dispatcher.
pub type Handler = Arc<dyn Fn(&mut Context) + Send + Sync>;

/// A packet transform stage run before the handler.
///
/// Middleware receive the context by value and may wrap or enrich it, or
/// short-circuit by replying themselves.
pub trait Middleware: Send + Sync {
    fn handle(&self, ctx: Context) -> Context;

    /// Middleware that end the request early return true: later middleware
    /// still run, the handler is skipped.
    fn terminate(&self) -> bool {
        false
    }
}

/// Operator → handler map with per-operator and global middleware chains.
///
/// The router is immutable once the server starts serving.
#[derive(Default)]
pub struct Router {
    handlers: HashMap<u32, Handler>,
    patterns: HashMap<u32, String>,
    route_middleware: HashMap<u32, Vec<Arc<dyn Middleware>>>,
    middleware: Vec<Arc<dyn Middleware>>,
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    /// Binds a handler to a route pattern.
    pub fn bind<F>(&mut self, pattern: &str, handler: F) -> Result<(), ServerError>
    where
        F: Fn(&mut Context) + Send + Sync + 'static,
    {
        self.bind_with(pattern, handler, Vec::new())
    }

    /// Binds a handler together with per-operator middleware.
    pub fn bind_with<F>(
        &mut self,
        pattern: &str,
        handler: F,
        middleware: Vec<Arc<dyn Middleware>>,
    ) -> Result<(), ServerError>
    where
        F: Fn(&mut Context) + Send + Sync + 'static,
    {
        let operator = operator_code(pattern);
        if operator <= OPERATOR_RESERVED_MAX {
            return Err(ServerError::ReservedOperator {
                pattern: pattern.to_string(),
                operator,
            });
        }

        if let Some(existing) = self.patterns.get(&operator) {
            if existing != pattern {
                tracing::warn!(
                    "crc32 collision: {:?} and {:?} both hash to operator {}",
                    existing,
                    pattern,
                    operator,
                );
            }
            return Err(ServerError::OperatorBound(pattern.to_string()));
        }

        self.handlers.insert(operator, Arc::new(handler));
        self.patterns.insert(operator, pattern.to_string());
        if !middleware.is_empty() {
            self.route_middleware.insert(operator, middleware);
        }
        Ok(())
    }

    /// Appends middleware to the global chain, run for every request after
    /// the per-operator chain.
    pub fn use_middleware<M>(&mut self, middleware: M)
    where
        M: Middleware + 'static,
    {
        self.middleware.push(Arc::new(middleware));
    }

    pub(crate) fn handler(&self, operator: u32) -> Option<Handler> {
        self.handlers.get(&operator).cloned()
    }

    pub(crate) fn route_middleware(&self, operator: u32) -> &[Arc<dyn Middleware>] {
        self.route_middleware
            .get(&operator)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub(crate) fn global_middleware(&self) -> &[Arc<dyn Middleware>] {
        &self.middleware
    }

    /// Returns the pattern bound at an operator, if any.
    pub fn pattern(&self, operator: u32) -> Option<&str> {
        self.patterns.get(&operator).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bind_and_lookup() {
        let mut router = Router::new();
        router.bind("echo", |_ctx| {}).unwrap();

        let operator = operator_code("echo");
        assert!(router.handler(operator).is_some());
        assert_eq!(router.pattern(operator), Some("echo"));
        assert_eq!(router.len(), 1);
    }

    #[test]
    fn test_double_bind_rejected() {
        let mut router = Router::new();
        router.bind("echo", |_ctx| {}).unwrap();

        let err = router.bind("echo", |_ctx| {}).unwrap_err();
        assert!(matches!(err, ServerError::OperatorBound(_)));
        assert_eq!(router.len(), 1);
    }

    #[test]
    fn test_reserved_operator_rejected() {
        // "ganap" hashes into the reserved range (crc32("ganap") = 470).
        let pattern = "ganap";
        assert!(operator_code(pattern) <= OPERATOR_RESERVED_MAX);

        let mut router = Router::new();
        let err = router.bind(pattern, |_ctx| {}).unwrap_err();
        assert!(matches!(err, ServerError::ReservedOperator { .. }));
        assert!(router.is_empty());
    }

    #[test]
    fn test_middleware_registration_order() {
        struct Tag;
        impl Middleware for Tag {
            fn handle(&self, ctx: Context) -> Context {
                ctx
            }
        }

        let mut router = Router::new();
        router.use_middleware(Tag);
        router.use_middleware(Tag);
        assert_eq!(router.global_middleware().len(), 2);

        router
            .bind_with("scoped", |_ctx| {}, vec![Arc::new(Tag)])
            .unwrap();
        assert_eq!(router.route_middleware(operator_code("scoped")).len(), 1);
        assert!(router.route_middleware(operator_code("other")).is_empty());
    }
}
