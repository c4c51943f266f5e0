//! Handler registry — maps a message `type` to the async function serving it.
//!
//! Collaborators (storage, clipboard, notifications, ...) register handlers
//! before the router opens. The router shares the registry across listener
//! rotations, so a registered type is never lost.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use frames::ConnectionName;
use futures::future::BoxFuture;
use serde_json::Value;

/// Failure reported by a handler. Sent back as the RESPONSE error string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlerError {
    message: String,
}

impl HandlerError {
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self { message: message.into() }
    }

    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }
}

impl fmt::Display for HandlerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl<E: std::error::Error> From<E> for HandlerError {
    fn from(err: E) -> Self {
        Self::new(err.to_string())
    }
}

pub type HandlerResult = Result<Value, HandlerError>;

/// What a handler knows about the caller.
#[derive(Clone, Debug)]
pub struct HandlerContext {
    pub connection: ConnectionName,
}

pub type Handler = Arc<dyn Fn(Value, HandlerContext) -> BoxFuture<'static, HandlerResult> + Send + Sync>;

#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Handler>,
}

impl HandlerRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for messages of type `kind`, replacing any previous one.
    pub fn register<F, Fut>(&mut self, kind: impl Into<String>, handler: F) -> &mut Self
    where
        F: Fn(Value, HandlerContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        let handler: Handler =
            Arc::new(move |value: Value, ctx: HandlerContext| -> BoxFuture<'static, HandlerResult> {
                Box::pin(handler(value, ctx))
            });
        self.handlers.insert(kind.into(), handler);
        self
    }

    #[must_use]
    pub fn get(&self, kind: &str) -> Option<Handler> {
        self.handlers.get(kind).cloned()
    }

    #[must_use]
    pub fn contains(&self, kind: &str) -> bool {
        self.handlers.contains_key(kind)
    }

    /// Registered types, sorted.
    #[must_use]
    pub fn kinds(&self) -> Vec<&str> {
        let mut kinds: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        kinds.sort_unstable();
        kinds
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerRegistry").field("kinds", &self.kinds()).finish()
    }
}
