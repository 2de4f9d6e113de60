//! The handler contract and adapters that normalize plain functions to it.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;

use crate::protocol::Event;

/// A callable that consumes one event.
///
/// Handlers may suspend; synchronous callables are adapted via
/// [`handler_fn`] without paying for a spawned task.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, event: &Event) -> anyhow::Result<()>;
}

/// Adapter for synchronous closures, the fast path.
struct FnHandler<F>(F);

#[async_trait]
impl<F> EventHandler for FnHandler<F>
where
    F: Fn(&Event) -> anyhow::Result<()> + Send + Sync,
{
    async fn handle(&self, event: &Event) -> anyhow::Result<()> {
        (self.0)(event)
    }
}

/// Wraps a synchronous closure as a handler.
pub fn handler_fn<F>(f: F) -> Arc<dyn EventHandler>
where
    F: Fn(&Event) -> anyhow::Result<()> + Send + Sync + 'static,
{
    Arc::new(FnHandler(f))
}

type BoxedHandlerFuture = Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>>;

/// Adapter for closures returning a boxed future.
struct AsyncFnHandler<F>(F);

#[async_trait]
impl<F> EventHandler for AsyncFnHandler<F>
where
    F: Fn(Event) -> BoxedHandlerFuture + Send + Sync,
{
    async fn handle(&self, event: &Event) -> anyhow::Result<()> {
        (self.0)(event.clone()).await
    }
}

/// Wraps an async closure as a handler. The closure receives an owned clone
/// of the event so the returned future is `'static`.
pub fn async_handler_fn<F>(f: F) -> Arc<dyn EventHandler>
where
    F: Fn(Event) -> BoxedHandlerFuture + Send + Sync + 'static,
{
    Arc::new(AsyncFnHandler(f))
}
