//! Domain module
//!
//! The event envelope, event-type rules and the ledger event catalogue.

pub mod event;
pub mod event_type;
pub mod events;

pub use event::{Event, EVENT_SCHEMA_VERSION};
pub use event_type::{is_pattern, topic_matches, validate_event_type};
pub use events::{
    AccountBalanceUpdated, AccountCreated, LedgerEntryCreated, LedgerPayload, MovementCancelled,
    MovementCreated, MovementKind,
};
