//! The task registry: the mapping from task names to handlers.
//!
//! The registry is assembled once at start up with a [`RegistryBuilder`] and is immutable from
//! then on. Cloning a [`Registry`] is cheap, every worker (and every handler process) gets its
//! own snapshot of the same table.
use std::{fmt::Display, future::Future, sync::Arc};

use async_trait::async_trait;
use fxhash::FxHashMap;

use crate::task::Arguments;

/// The error returned from a failing handler.
///
/// Any [`std::error::Error`] converts into it, so `?` can be used freely inside handlers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlerError(String);

impl HandlerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }

    pub fn message(&self) -> &str {
        &self.0
    }
}

impl Display for HandlerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl<E> From<E> for HandlerError
where
    E: std::error::Error,
{
    fn from(value: E) -> Self {
        Self(value.to_string())
    }
}

/// A unit of executable work, looked up by name when a task runs.
#[async_trait]
pub trait Handler: Send + Sync + 'static {
    async fn handle(&self, arguments: Arguments) -> Result<(), HandlerError>;
}

/// Adapts an async closure into a [`Handler`], see [`RegistryBuilder::register_fn`].
pub struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> Handler for FnHandler<F>
where
    F: Fn(Arguments) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send,
{
    async fn handle(&self, arguments: Arguments) -> Result<(), HandlerError> {
        (self.0)(arguments).await
    }
}

/// An immutable snapshot of the registered handlers.
#[derive(Clone, Default)]
pub struct Registry {
    handlers: Arc<FxHashMap<String, Arc<dyn Handler>>>,
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_set().entries(self.handlers.keys()).finish()
    }
}

impl Registry {
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::default()
    }

    /// Resolves a task name, `None` when nothing is registered under it.
    pub fn get(&self, name: &str) -> Option<Arc<dyn Handler>> {
        self.handlers.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.handlers.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

#[derive(Default)]
pub struct RegistryBuilder {
    handlers: FxHashMap<String, Arc<dyn Handler>>,
}

impl RegistryBuilder {
    /// Registers `handler` under `name`, replacing any previous registration.
    pub fn register(mut self, name: impl Into<String>, handler: impl Handler) -> Self {
        let name = name.into();
        if self.handlers.insert(name.clone(), Arc::new(handler)).is_some() {
            tracing::warn!("Handler {name} registered more than once, keeping the last one");
        }
        self
    }

    /// Registers an async function or closure as a handler.
    ///
    /// ```
    /// # use retask::prelude::*;
    /// let registry = Registry::builder()
    ///     .register_fn("add", |arguments: Arguments| async move {
    ///         let sum: i64 = arguments.args.iter().filter_map(|v| v.as_i64()).sum();
    ///         tracing::info!("sum is {sum}");
    ///         Ok(())
    ///     })
    ///     .build();
    ///
    /// assert!(registry.contains("add"));
    /// ```
    pub fn register_fn<F, Fut>(self, name: impl Into<String>, handler: F) -> Self
    where
        F: Fn(Arguments) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), HandlerError>> + Send,
    {
        self.register(name, FnHandler(handler))
    }

    pub fn build(self) -> Registry {
        Registry {
            handlers: Arc::new(self.handlers),
        }
    }
}
