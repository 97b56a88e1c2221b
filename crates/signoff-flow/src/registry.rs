//! Process-local registry of named task handlers.
//!
//! The executor resolves `task_handler` names here when it runs a task
//! step. Registration happens at startup; an unregistered name is a
//! permanent step failure.
//!
//! ## Handler contract
//!
//! Handlers MUST be deterministic and idempotent within the scope of one
//! workflow advancement: under crash recovery, a step whose outcome was
//! not yet persisted may be re-executed. Handlers performing external
//! side effects should derive an idempotency key from their input and
//! check for prior completion before acting.
//!
//! A handler may register a companion *compensation* handler, invoked in
//! reverse step order over previously completed task steps when a later
//! approval is rejected. Compensation failures are logged, never fatal.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde_json::Value as JsonValue;

use crate::error::{Error, Result};

/// A synchronous unit of machine work: JSON in, JSON out.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    /// Runs the task. A returned error is a permanent step failure; the
    /// retry budget lives at the workflow level, not here.
    async fn run(&self, input: &JsonValue) -> Result<JsonValue>;
}

impl std::fmt::Debug for dyn TaskHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("dyn TaskHandler")
    }
}

/// Undoes the externally visible effect of a completed task step.
#[async_trait]
pub trait CompensationHandler: Send + Sync {
    /// Compensates using the original step output.
    async fn compensate(&self, output: &JsonValue) -> Result<()>;
}

/// Wraps an async closure as a [`TaskHandler`].
///
/// ## Example
///
/// ```rust
/// use signoff_flow::registry::{task_fn, TaskRegistry};
///
/// let mut registry = TaskRegistry::new();
/// registry.register("echo", task_fn(|input| async move {
///     Ok(serde_json::json!({"echo": input}))
/// }));
/// ```
pub fn task_fn<F, Fut>(f: F) -> Arc<dyn TaskHandler>
where
    F: Fn(JsonValue) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<JsonValue>> + Send + 'static,
{
    struct FnHandler<G>(G);

    #[async_trait]
    impl<G> TaskHandler for FnHandler<G>
    where
        G: Fn(JsonValue) -> BoxFuture<'static, Result<JsonValue>> + Send + Sync,
    {
        async fn run(&self, input: &JsonValue) -> Result<JsonValue> {
            (self.0)(input.clone()).await
        }
    }

    Arc::new(FnHandler(
        move |input| -> BoxFuture<'static, Result<JsonValue>> { Box::pin(f(input)) },
    ))
}

struct Registration {
    handler: Arc<dyn TaskHandler>,
    compensation: Option<Arc<dyn CompensationHandler>>,
}

/// Map from handler name to implementation.
#[derive(Default)]
pub struct TaskRegistry {
    handlers: HashMap<String, Registration>,
}

impl TaskRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a handler under a name. Re-registering a name replaces
    /// the previous handler.
    pub fn register(&mut self, name: impl Into<String>, handler: Arc<dyn TaskHandler>) {
        self.handlers.insert(
            name.into(),
            Registration {
                handler,
                compensation: None,
            },
        );
    }

    /// Registers a handler together with its compensation handler.
    pub fn register_with_compensation(
        &mut self,
        name: impl Into<String>,
        handler: Arc<dyn TaskHandler>,
        compensation: Arc<dyn CompensationHandler>,
    ) {
        self.handlers.insert(
            name.into(),
            Registration {
                handler,
                compensation: Some(compensation),
            },
        );
    }

    /// Resolves a handler by name.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnknownHandler`] for unregistered names.
    pub fn resolve(&self, name: &str) -> Result<Arc<dyn TaskHandler>> {
        self.handlers
            .get(name)
            .map(|reg| Arc::clone(&reg.handler))
            .ok_or_else(|| Error::UnknownHandler {
                handler: name.to_string(),
            })
    }

    /// Resolves a compensation handler by name, if one was registered.
    #[must_use]
    pub fn compensation(&self, name: &str) -> Option<Arc<dyn CompensationHandler>> {
        self.handlers
            .get(name)
            .and_then(|reg| reg.compensation.as_ref().map(Arc::clone))
    }

    /// Returns the registered handler names.
    #[must_use]
    pub fn names(&self) -> Vec<&str> {
        self.handlers.keys().map(String::as_str).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn echo(input: JsonValue) -> Result<JsonValue> {
        Ok(serde_json::json!({"echo": input}))
    }

    #[tokio::test]
    async fn registered_handler_resolves_and_runs() -> Result<()> {
        let mut registry = TaskRegistry::new();
        registry.register("echo", task_fn(echo));

        let handler = registry.resolve("echo")?;
        let output = handler.run(&serde_json::json!({"x": 1})).await?;
        assert_eq!(output["echo"]["x"], 1);
        Ok(())
    }

    #[test]
    fn unknown_handler_is_an_error() {
        let registry = TaskRegistry::new();
        let err = registry.resolve("missing").expect_err("must fail");
        assert!(matches!(err, Error::UnknownHandler { .. }));
    }

    #[test]
    fn compensation_is_optional() {
        let mut registry = TaskRegistry::new();
        registry.register("plain", task_fn(echo));
        assert!(registry.compensation("plain").is_none());
        assert!(registry.compensation("missing").is_none());
    }
}
