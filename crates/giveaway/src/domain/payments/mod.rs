mod pipeline;
mod store;
mod watcher;

use crate::infra::db::{parse_optional_datetime, parse_required_datetime};
pub use pipeline::*;
use serde::{Deserialize, Serialize};
use sqlx::{sqlite::SqliteRow, FromRow, Row};
use std::fmt;
pub use store::*;
use time::OffsetDateTime;
pub use watcher::*;

use super::Ticket;

/// Local payment state, driven by the external processor's two-phase
/// protocol. Transitions are one-directional:
/// created -> approved -> completed, or created/approved -> cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentState {
    Created,
    Approved,
    Completed,
    Cancelled,
}

impl PaymentState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, PaymentState::Completed | PaymentState::Cancelled)
    }

    fn parse(value: &str) -> Option<Self> {
        match value {
            "created" => Some(PaymentState::Created),
            "approved" => Some(PaymentState::Approved),
            "completed" => Some(PaymentState::Completed),
            "cancelled" => Some(PaymentState::Cancelled),
            _ => None,
        }
    }
}

impl fmt::Display for PaymentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PaymentState::Created => write!(f, "created"),
            PaymentState::Approved => write!(f, "approved"),
            PaymentState::Completed => write!(f, "completed"),
            PaymentState::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Purchase intent from an authenticated payer. `payment_id` is the
/// processor-issued identifier and the idempotency key for everything that
/// follows.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreatePayment {
    pub payment_id: String,
    pub competition_slug: String,
    pub quantity: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Payment {
    pub payment_id: String,
    pub competition_slug: String,
    pub payer_id: String,
    pub quantity: u32,
    pub amount_minor: i64,
    pub state: PaymentState,
    pub txid: Option<String>,
    pub cancel_reason: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub approved_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub completed_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub cancelled_at: Option<OffsetDateTime>,
}

impl FromRow<'_, SqliteRow> for Payment {
    fn from_row(row: &SqliteRow) -> Result<Self, sqlx::Error> {
        let state_str: String = row.get("state");
        let state = PaymentState::parse(&state_str).ok_or_else(|| sqlx::Error::ColumnDecode {
            index: "state".to_string(),
            source: format!("unknown payment state: {}", state_str).into(),
        })?;

        Ok(Payment {
            payment_id: row.get("payment_id"),
            competition_slug: row.get("competition_slug"),
            payer_id: row.get("payer_id"),
            quantity: row.try_get::<i64, _>("quantity")? as u32,
            amount_minor: row.try_get("amount_minor")?,
            state,
            txid: row.get("txid"),
            cancel_reason: row.get("cancel_reason"),
            created_at: parse_required_datetime(row, "created_at")?,
            approved_at: parse_optional_datetime(row, "approved_at")?,
            completed_at: parse_optional_datetime(row, "completed_at")?,
            cancelled_at: parse_optional_datetime(row, "cancelled_at")?,
        })
    }
}

/// A settled purchase: the completed payment plus the single ticket record
/// issued for it. Retried completions return the same receipt.
#[derive(Debug, Clone, Serialize)]
pub struct SettlementReceipt {
    pub payment: Payment,
    pub ticket: Ticket,
}
