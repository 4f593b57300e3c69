//! Event handlers
//!
//! The contract between the messaging core and application code: one
//! operation, invoked once per delivered message. Returning `Err` marks the
//! delivery as failed and sends it down the retry / dead-letter path.

use std::sync::Arc;

use async_trait::async_trait;

use crate::domain::Event;

/// Handles events of one subscription
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, event: &Event) -> anyhow::Result<()>;
}

#[async_trait]
impl<H: EventHandler + ?Sized> EventHandler for Arc<H> {
    async fn handle(&self, event: &Event) -> anyhow::Result<()> {
        (**self).handle(event).await
    }
}
