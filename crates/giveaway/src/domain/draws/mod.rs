mod engine;
mod store;

use crate::infra::db::{parse_optional_datetime, parse_required_datetime};
pub use engine::*;
use serde::{Deserialize, Serialize};
use sqlx::{sqlite::SqliteRow, FromRow, Row};
use std::fmt;
pub use store::*;
use time::OffsetDateTime;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DrawStatus {
    Pending,
    Won,
    Missed,
}

impl DrawStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, DrawStatus::Won | DrawStatus::Missed)
    }

    fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(DrawStatus::Pending),
            "won" => Some(DrawStatus::Won),
            "missed" => Some(DrawStatus::Missed),
            _ => None,
        }
    }
}

impl fmt::Display for DrawStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DrawStatus::Pending => write!(f, "pending"),
            DrawStatus::Won => write!(f, "won"),
            DrawStatus::Missed => write!(f, "missed"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DrawTicketStatus {
    Active,
    Used,
    Carried,
}

impl DrawTicketStatus {
    /// Carried tickets still count toward the week they were carried into.
    pub fn is_eligible(&self) -> bool {
        matches!(self, DrawTicketStatus::Active | DrawTicketStatus::Carried)
    }

    fn parse(value: &str) -> Option<Self> {
        match value {
            "active" => Some(DrawTicketStatus::Active),
            "used" => Some(DrawTicketStatus::Used),
            "carried" => Some(DrawTicketStatus::Carried),
            _ => None,
        }
    }
}

impl fmt::Display for DrawTicketStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DrawTicketStatus::Active => write!(f, "active"),
            DrawTicketStatus::Used => write!(f, "used"),
            DrawTicketStatus::Carried => write!(f, "carried"),
        }
    }
}

/// One weekly draw. A row with `draw_at = NULL` is a rollover skeleton: it
/// holds a prize pool carried from a missed week but has not been drawn,
/// has no winner, and cannot be claimed against.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DrawCycle {
    pub week: String,
    pub code: String,
    pub prize_pool_minor: i64,
    #[serde(with = "time::serde::rfc3339")]
    pub week_start: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub code_expires_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub draw_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub claim_expires_at: Option<OffsetDateTime>,
    pub status: DrawStatus,
    pub winner_id: Option<String>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub claimed_at: Option<OffsetDateTime>,
    pub rollover_from_week: Option<String>,
}

impl DrawCycle {
    pub fn is_drawn(&self) -> bool {
        self.draw_at.is_some()
    }

    pub fn claim_window_open_at(&self, now: OffsetDateTime) -> bool {
        matches!(self.claim_expires_at, Some(expires) if now <= expires)
    }
}

impl FromRow<'_, SqliteRow> for DrawCycle {
    fn from_row(row: &SqliteRow) -> Result<Self, sqlx::Error> {
        let status_str: String = row.get("status");
        let status = DrawStatus::parse(&status_str).ok_or_else(|| sqlx::Error::ColumnDecode {
            index: "status".to_string(),
            source: format!("unknown draw status: {}", status_str).into(),
        })?;

        Ok(DrawCycle {
            week: row.get("week"),
            code: row.get("code"),
            prize_pool_minor: row.try_get("prize_pool_minor")?,
            week_start: parse_required_datetime(row, "week_start")?,
            code_expires_at: parse_optional_datetime(row, "code_expires_at")?,
            draw_at: parse_optional_datetime(row, "draw_at")?,
            claim_expires_at: parse_optional_datetime(row, "claim_expires_at")?,
            status,
            winner_id: row.get("winner_id"),
            claimed_at: parse_optional_datetime(row, "claimed_at")?,
            rollover_from_week: row.get("rollover_from_week"),
        })
    }
}

/// Weekly-draw eligibility, distinct from a competition ticket. One row is
/// one chance in that week's uniform draw.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DrawTicket {
    pub id: Uuid,
    pub user_id: String,
    pub draw_week: String,
    pub status: DrawTicketStatus,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

impl FromRow<'_, SqliteRow> for DrawTicket {
    fn from_row(row: &SqliteRow) -> Result<Self, sqlx::Error> {
        let status_str: String = row.get("status");
        let status =
            DrawTicketStatus::parse(&status_str).ok_or_else(|| sqlx::Error::ColumnDecode {
                index: "status".to_string(),
                source: format!("unknown draw ticket status: {}", status_str).into(),
            })?;

        Ok(DrawTicket {
            id: Uuid::parse_str(&row.get::<String, _>("id")).map_err(|e| {
                sqlx::Error::ColumnDecode {
                    index: "id".to_string(),
                    source: Box::new(e),
                }
            })?,
            user_id: row.get("user_id"),
            draw_week: row.get("draw_week"),
            status,
            created_at: parse_required_datetime(row, "created_at")?,
        })
    }
}

/// Ghost-loss record written when a winner misses the claim window or
/// submits the wrong code.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DrawLoss {
    pub id: Uuid,
    pub week: String,
    pub winner_id: String,
    pub prize_pool_minor: i64,
    pub reason: String,
    #[serde(with = "time::serde::rfc3339")]
    pub missed_at: OffsetDateTime,
}

impl FromRow<'_, SqliteRow> for DrawLoss {
    fn from_row(row: &SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(DrawLoss {
            id: Uuid::parse_str(&row.get::<String, _>("id")).map_err(|e| {
                sqlx::Error::ColumnDecode {
                    index: "id".to_string(),
                    source: Box::new(e),
                }
            })?,
            week: row.get("week"),
            winner_id: row.get("winner_id"),
            prize_pool_minor: row.try_get("prize_pool_minor")?,
            reason: row.get("reason"),
            missed_at: parse_required_datetime(row, "missed_at")?,
        })
    }
}

/// What the scheduler trigger got back.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum CycleOutcome {
    Drawn { cycle: DrawCycle },
    NoEligibleTickets { week: String },
}

/// What a claim attempt resolved to. `Missed` is a normal outcome the
/// caller branches on, not an error.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ClaimOutcome {
    Won { cycle: DrawCycle },
    Missed { cycle: DrawCycle },
}
