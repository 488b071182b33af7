mod store;

use crate::infra::db::parse_required_datetime;
use serde::{Deserialize, Serialize};
use sqlx::{sqlite::SqliteRow, FromRow, Row};
use std::fmt;
pub use store::*;
use time::OffsetDateTime;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompetitionStatus {
    Active,
    Ended,
    Cancelled,
}

impl fmt::Display for CompetitionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CompetitionStatus::Active => write!(f, "active"),
            CompetitionStatus::Ended => write!(f, "ended"),
            CompetitionStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl CompetitionStatus {
    fn parse(value: &str) -> Option<Self> {
        match value {
            "active" => Some(CompetitionStatus::Active),
            "ended" => Some(CompetitionStatus::Ended),
            "cancelled" => Some(CompetitionStatus::Cancelled),
            _ => None,
        }
    }
}

/// Where an issued ticket came from. `Purchase` is the only source that
/// carries a payment id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TicketSource {
    Purchase,
    Gift,
    Grant,
    Earned,
    Carryover,
}

impl fmt::Display for TicketSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TicketSource::Purchase => write!(f, "purchase"),
            TicketSource::Gift => write!(f, "gift"),
            TicketSource::Grant => write!(f, "grant"),
            TicketSource::Earned => write!(f, "earned"),
            TicketSource::Carryover => write!(f, "carryover"),
        }
    }
}

impl TicketSource {
    fn parse(value: &str) -> Option<Self> {
        match value {
            "purchase" => Some(TicketSource::Purchase),
            "gift" => Some(TicketSource::Gift),
            "grant" => Some(TicketSource::Grant),
            "earned" => Some(TicketSource::Earned),
            "carryover" => Some(TicketSource::Carryover),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateCompetition {
    pub slug: String,
    pub title: String,
    pub total_tickets: u32,
    pub entry_fee_minor: i64,
    #[serde(with = "time::serde::rfc3339")]
    pub starts_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub ends_at: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Competition {
    pub slug: String,
    pub title: String,
    pub total_tickets: u32,
    pub tickets_sold: u32,
    pub entry_fee_minor: i64,
    pub status: CompetitionStatus,
    #[serde(with = "time::serde::rfc3339")]
    pub starts_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub ends_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

impl Competition {
    pub fn remaining(&self) -> u32 {
        self.total_tickets.saturating_sub(self.tickets_sold)
    }

    pub fn is_sold_out(&self) -> bool {
        self.tickets_sold >= self.total_tickets
    }

    /// A competition takes entries only while marked active and inside its
    /// sale window with capacity left.
    pub fn is_open_at(&self, now: OffsetDateTime) -> bool {
        self.status == CompetitionStatus::Active
            && now >= self.starts_at
            && now <= self.ends_at
            && !self.is_sold_out()
    }
}

impl FromRow<'_, SqliteRow> for Competition {
    fn from_row(row: &SqliteRow) -> Result<Self, sqlx::Error> {
        let status_str: String = row.get("status");
        let status =
            CompetitionStatus::parse(&status_str).ok_or_else(|| sqlx::Error::ColumnDecode {
                index: "status".to_string(),
                source: format!("unknown competition status: {}", status_str).into(),
            })?;

        Ok(Competition {
            slug: row.get("slug"),
            title: row.get("title"),
            total_tickets: row.try_get::<i64, _>("total_tickets")? as u32,
            tickets_sold: row.try_get::<i64, _>("tickets_sold")? as u32,
            entry_fee_minor: row.try_get("entry_fee_minor")?,
            status,
            starts_at: parse_required_datetime(row, "starts_at")?,
            ends_at: parse_required_datetime(row, "ends_at")?,
            created_at: parse_required_datetime(row, "created_at")?,
        })
    }
}

/// A successful allocation of a contiguous ticket-number block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Reservation {
    pub first_number: u32,
    pub quantity: u32,
    pub new_tickets_sold: u32,
}

impl Reservation {
    /// The allocated block, inclusive of both ends. Allocation caps the sum
    /// at the competition's total, so the last number always fits in u32.
    pub fn numbers(&self) -> Vec<u32> {
        (0..self.quantity).map(|i| self.first_number + i).collect()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ticket {
    pub id: Uuid,
    pub competition_slug: String,
    pub owner_id: String,
    pub first_number: u32,
    pub quantity: u32,
    pub source: TicketSource,
    pub payment_id: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub issued_at: OffsetDateTime,
}

impl Ticket {
    pub fn numbers(&self) -> Vec<u32> {
        (0..self.quantity).map(|i| self.first_number + i).collect()
    }
}

impl FromRow<'_, SqliteRow> for Ticket {
    fn from_row(row: &SqliteRow) -> Result<Self, sqlx::Error> {
        let source_str: String = row.get("source");
        let source = TicketSource::parse(&source_str).ok_or_else(|| sqlx::Error::ColumnDecode {
            index: "source".to_string(),
            source: format!("unknown ticket source: {}", source_str).into(),
        })?;

        Ok(Ticket {
            id: Uuid::parse_str(&row.get::<String, _>("id")).map_err(|e| {
                sqlx::Error::ColumnDecode {
                    index: "id".to_string(),
                    source: Box::new(e),
                }
            })?,
            competition_slug: row.get("competition_slug"),
            owner_id: row.get("owner_id"),
            first_number: row.try_get::<i64, _>("first_number")? as u32,
            quantity: row.try_get::<i64, _>("quantity")? as u32,
            source,
            payment_id: row.get("payment_id"),
            issued_at: parse_required_datetime(row, "issued_at")?,
        })
    }
}
