//! Closure Handler
//!
//! Adapts an async closure into an event handler.

use std::future::Future;

use async_trait::async_trait;

use crate::domain::Event;
use crate::messaging::EventHandler;

/// Handler backed by a closure, see [`handler_fn`]
pub struct FnHandler<F> {
    f: F,
}

/// Build a handler from an async closure taking the event by value.
///
/// ```ignore
/// let handler = handler_fn(|event: Event| async move {
///     tracing::info!(event_id = %event.id(), "got it");
///     anyhow::Ok(())
/// });
/// ```
pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(Event) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<()>> + Send,
{
    FnHandler { f }
}

#[async_trait]
impl<F, Fut> EventHandler for FnHandler<F>
where
    F: Fn(Event) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<()>> + Send,
{
    async fn handle(&self, event: &Event) -> anyhow::Result<()> {
        (self.f)(event.clone()).await
    }
}
