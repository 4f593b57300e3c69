//! Ledger Events
//!
//! Event types published by the ledger use cases and their payloads.
//! Use cases publish these after their own persistence step has committed.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::Event;
use crate::error::MessagingResult;

pub const ACCOUNT_CREATED: &str = "account.created";
pub const ACCOUNT_BALANCE_UPDATED: &str = "account.balance_updated";
pub const MOVEMENT_CREATED: &str = "movement.created";
pub const MOVEMENT_CANCELLED: &str = "movement.cancelled";
pub const LEDGER_ENTRY_CREATED: &str = "ledger_entry.created";

/// Every concrete event type the ledger publishes
pub const ALL_EVENT_TYPES: [&str; 5] = [
    ACCOUNT_CREATED,
    ACCOUNT_BALANCE_UPDATED,
    MOVEMENT_CREATED,
    MOVEMENT_CANCELLED,
    LEDGER_ENTRY_CREATED,
];

/// Direction of a movement relative to the account
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MovementKind {
    Credit,
    Debit,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountCreated {
    pub account_id: Uuid,
    pub owner_id: Uuid,
    pub currency: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountBalanceUpdated {
    pub account_id: Uuid,
    pub previous_balance: Decimal,
    pub new_balance: Decimal,
    pub movement_id: Uuid,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MovementCreated {
    pub movement_id: Uuid,
    pub account_id: Uuid,
    pub kind: MovementKind,
    pub amount: Decimal,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MovementCancelled {
    pub movement_id: Uuid,
    pub account_id: Uuid,
    pub reason: String,
    pub cancelled_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LedgerEntryCreated {
    pub entry_id: Uuid,
    pub movement_id: Uuid,
    pub debit_account_id: Uuid,
    pub credit_account_id: Uuid,
    pub amount: Decimal,
}

/// Payloads that know which event type they travel under
pub trait LedgerPayload: Serialize + Sized {
    const EVENT_TYPE: &'static str;

    /// Wrap the payload in an event envelope
    fn into_event(&self) -> MessagingResult<Event> {
        Event::from_payload(Self::EVENT_TYPE, self)
    }
}

impl LedgerPayload for AccountCreated {
    const EVENT_TYPE: &'static str = ACCOUNT_CREATED;
}

impl LedgerPayload for AccountBalanceUpdated {
    const EVENT_TYPE: &'static str = ACCOUNT_BALANCE_UPDATED;
}

impl LedgerPayload for MovementCreated {
    const EVENT_TYPE: &'static str = MOVEMENT_CREATED;
}

impl LedgerPayload for MovementCancelled {
    const EVENT_TYPE: &'static str = MOVEMENT_CANCELLED;
}

impl LedgerPayload for LedgerEntryCreated {
    const EVENT_TYPE: &'static str = LEDGER_ENTRY_CREATED;
}
