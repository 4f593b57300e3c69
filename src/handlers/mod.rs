//! Event Handlers module
//!
//! Reusable [`EventHandler`](crate::messaging::EventHandler) implementations.
//! Application handlers live next to the use cases that own them; the ones
//! here are generic or cover the ledger's own compensating actions.

mod compensation_handler;
mod fn_handler;
mod logging_handler;

pub use compensation_handler::MovementCompensationHandler;
pub use fn_handler::{handler_fn, FnHandler};
pub use logging_handler::LoggingHandler;
