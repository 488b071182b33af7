use log::{debug, info};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::{
    domain::Error,
    infra::db::{format_datetime, DBConnection},
};

use super::{DrawCycle, DrawLoss, DrawTicket, DrawTicketStatus};

/// Everything `commit_cycle` writes in one transaction: the prior week's
/// retirement, the carried tickets, and the drawn cycle row itself.
#[derive(Debug, Clone)]
pub struct CyclePlan {
    pub week: String,
    pub prior_week: Option<String>,
    pub winner_id: String,
    pub code: String,
    pub base_prize_pool_minor: i64,
    pub week_start: OffsetDateTime,
    pub draw_at: OffsetDateTime,
    pub code_expires_at: OffsetDateTime,
    pub claim_expires_at: OffsetDateTime,
    pub carried: Vec<DrawTicket>,
}

/// Whether a cycle commit actually drew, or found the week already drawn
/// (a replayed scheduler trigger).
#[derive(Debug)]
pub enum CycleCommit {
    Committed(DrawCycle),
    AlreadyDrawn(DrawCycle),
}

#[derive(Debug, Clone)]
pub struct DrawStore {
    db_connection: DBConnection,
}

impl DrawStore {
    pub fn new(db_connection: DBConnection) -> Self {
        Self { db_connection }
    }

    /// Award draw eligibility tickets to a user for a week.
    pub async fn add_entries(
        &self,
        user_id: &str,
        week: &str,
        quantity: u32,
    ) -> Result<Vec<DrawTicket>, Error> {
        if quantity < 1 {
            return Err(Error::BadRequest("quantity must be at least 1".into()));
        }

        let now = OffsetDateTime::now_utc();
        let tickets: Vec<DrawTicket> = (0..quantity)
            .map(|_| DrawTicket {
                id: Uuid::now_v7(),
                user_id: user_id.to_string(),
                draw_week: week.to_string(),
                status: DrawTicketStatus::Active,
                created_at: now,
            })
            .collect();

        let rows = tickets.clone();
        self.db_connection
            .execute_write(move |pool| async move {
                let mut tx = pool.begin().await?;
                for ticket in &rows {
                    sqlx::query(
                        "INSERT INTO draw_tickets (id, user_id, draw_week, status, created_at)
                        VALUES (?, ?, ?, ?, ?)",
                    )
                    .bind(ticket.id.to_string())
                    .bind(&ticket.user_id)
                    .bind(&ticket.draw_week)
                    .bind(ticket.status.to_string())
                    .bind(format_datetime(ticket.created_at)?)
                    .execute(&mut *tx)
                    .await?;
                }
                tx.commit().await?;
                Ok(())
            })
            .await?;

        debug!("awarded {} draw entries to {} for {}", quantity, user_id, week);
        Ok(tickets)
    }

    pub async fn get_cycle(&self, week: &str) -> Result<Option<DrawCycle>, Error> {
        let cycle = sqlx::query_as::<_, DrawCycle>("SELECT * FROM draw_cycles WHERE week = ?")
            .bind(week)
            .fetch_optional(self.db_connection.read())
            .await?;
        Ok(cycle)
    }

    /// Tickets still counting toward a week's draw (active or carried in).
    pub async fn get_eligible_tickets(&self, week: &str) -> Result<Vec<DrawTicket>, Error> {
        let tickets = sqlx::query_as::<_, DrawTicket>(
            "SELECT * FROM draw_tickets
            WHERE draw_week = ? AND status IN ('active', 'carried')
            ORDER BY created_at, id",
        )
        .bind(week)
        .fetch_all(self.db_connection.read())
        .await?;
        Ok(tickets)
    }

    pub async fn get_losses(&self, week: &str) -> Result<Vec<DrawLoss>, Error> {
        let losses = sqlx::query_as::<_, DrawLoss>(
            "SELECT * FROM draw_losses WHERE week = ? ORDER BY missed_at",
        )
        .bind(week)
        .fetch_all(self.db_connection.read())
        .await?;
        Ok(losses)
    }

    /// Apply a prepared draw in one transaction: retire the prior week's
    /// eligible tickets, insert the carried ones, and upsert the cycle row.
    /// A skeleton row's rolled-over prize pool is merged into the drawn
    /// cycle. If the week has already been drawn the transaction rolls back
    /// untouched and the existing cycle is returned.
    pub async fn commit_cycle(&self, plan: CyclePlan) -> Result<CycleCommit, Error> {
        let week = plan.week.clone();

        let committed = self
            .db_connection
            .execute_write(move |pool| async move {
                let mut tx = pool.begin().await?;

                let existing: Option<DrawCycle> =
                    sqlx::query_as::<_, DrawCycle>("SELECT * FROM draw_cycles WHERE week = ?")
                        .bind(&plan.week)
                        .fetch_optional(&mut *tx)
                        .await?;
                if let Some(cycle) = existing {
                    if cycle.is_drawn() {
                        tx.rollback().await?;
                        return Ok(CycleCommit::AlreadyDrawn(cycle));
                    }
                }

                if let Some(prior_week) = &plan.prior_week {
                    sqlx::query(
                        "UPDATE draw_tickets
                        SET status = 'used'
                        WHERE draw_week = ? AND status IN ('active', 'carried')",
                    )
                    .bind(prior_week)
                    .execute(&mut *tx)
                    .await?;
                }

                for ticket in &plan.carried {
                    sqlx::query(
                        "INSERT INTO draw_tickets (id, user_id, draw_week, status, created_at)
                        VALUES (?, ?, ?, ?, ?)",
                    )
                    .bind(ticket.id.to_string())
                    .bind(&ticket.user_id)
                    .bind(&ticket.draw_week)
                    .bind(ticket.status.to_string())
                    .bind(format_datetime(ticket.created_at)?)
                    .execute(&mut *tx)
                    .await?;
                }

                sqlx::query(
                    "INSERT INTO draw_cycles (
                        week,
                        code,
                        prize_pool_minor,
                        week_start,
                        code_expires_at,
                        draw_at,
                        claim_expires_at,
                        status,
                        winner_id
                    ) VALUES (?, ?, ?, ?, ?, ?, ?, 'pending', ?)
                    ON CONFLICT (week) DO UPDATE SET
                        code = excluded.code,
                        prize_pool_minor = draw_cycles.prize_pool_minor
                            + excluded.prize_pool_minor,
                        code_expires_at = excluded.code_expires_at,
                        draw_at = excluded.draw_at,
                        claim_expires_at = excluded.claim_expires_at,
                        winner_id = excluded.winner_id
                    WHERE draw_cycles.draw_at IS NULL",
                )
                .bind(&plan.week)
                .bind(&plan.code)
                .bind(plan.base_prize_pool_minor)
                .bind(format_datetime(plan.week_start)?)
                .bind(format_datetime(plan.code_expires_at)?)
                .bind(format_datetime(plan.draw_at)?)
                .bind(format_datetime(plan.claim_expires_at)?)
                .bind(&plan.winner_id)
                .execute(&mut *tx)
                .await?;

                let cycle =
                    sqlx::query_as::<_, DrawCycle>("SELECT * FROM draw_cycles WHERE week = ?")
                        .bind(&plan.week)
                        .fetch_one(&mut *tx)
                        .await?;

                tx.commit().await?;
                Ok(CycleCommit::Committed(cycle))
            })
            .await?;

        if let CycleCommit::Committed(cycle) = &committed {
            info!(
                "drew week {}: winner {:?}, pool {} minor units",
                week, cycle.winner_id, cycle.prize_pool_minor
            );
        }
        Ok(committed)
    }

    /// Conditional `pending -> won`. Returns false when another claim
    /// resolved the cycle first.
    pub async fn mark_won(&self, week: &str, now: OffsetDateTime) -> Result<bool, Error> {
        let week_owned = week.to_string();
        let claimed_at = format_datetime(now).map_err(Error::DbError)?;

        let won = self
            .db_connection
            .execute_write(move |pool| async move {
                let result = sqlx::query(
                    "UPDATE draw_cycles
                    SET status = 'won', claimed_at = ?
                    WHERE week = ? AND status = 'pending'",
                )
                .bind(claimed_at)
                .bind(&week_owned)
                .execute(&pool)
                .await?;
                Ok(result.rows_affected() > 0)
            })
            .await?;
        Ok(won)
    }

    /// Conditional `pending -> missed`, plus the ghost-loss row and the
    /// prize rollover into the next week's (possibly skeleton) cycle, all
    /// in one transaction. Returns false if the cycle was already resolved.
    pub async fn mark_missed(
        &self,
        cycle: &DrawCycle,
        reason: &str,
        next_week: &str,
        next_week_start: OffsetDateTime,
        now: OffsetDateTime,
    ) -> Result<bool, Error> {
        let week = cycle.week.clone();
        let winner_id = cycle.winner_id.clone().unwrap_or_default();
        let prize_pool_minor = cycle.prize_pool_minor;
        let reason_owned = reason.to_string();
        let next_week_owned = next_week.to_string();
        let loss_id = Uuid::now_v7();

        let missed = self
            .db_connection
            .execute_write(move |pool| async move {
                let mut tx = pool.begin().await?;

                let result = sqlx::query(
                    "UPDATE draw_cycles
                    SET status = 'missed'
                    WHERE week = ? AND status = 'pending'",
                )
                .bind(&week)
                .execute(&mut *tx)
                .await?;
                if result.rows_affected() == 0 {
                    tx.rollback().await?;
                    return Ok(false);
                }

                sqlx::query(
                    "INSERT INTO draw_losses (
                        id, week, winner_id, prize_pool_minor, reason, missed_at
                    ) VALUES (?, ?, ?, ?, ?, ?)",
                )
                .bind(loss_id.to_string())
                .bind(&week)
                .bind(&winner_id)
                .bind(prize_pool_minor)
                .bind(&reason_owned)
                .bind(format_datetime(now)?)
                .execute(&mut *tx)
                .await?;

                sqlx::query(
                    "INSERT INTO draw_cycles (
                        week, prize_pool_minor, week_start, status, rollover_from_week
                    ) VALUES (?, ?, ?, 'pending', ?)
                    ON CONFLICT (week) DO UPDATE SET
                        prize_pool_minor = draw_cycles.prize_pool_minor
                            + excluded.prize_pool_minor,
                        rollover_from_week = excluded.rollover_from_week",
                )
                .bind(&next_week_owned)
                .bind(prize_pool_minor)
                .bind(format_datetime(next_week_start)?)
                .bind(&week)
                .execute(&mut *tx)
                .await?;

                tx.commit().await?;
                Ok(true)
            })
            .await?;

        if missed {
            info!(
                "week {} missed by {:?}: rolled {} minor units into {}",
                cycle.week, cycle.winner_id, cycle.prize_pool_minor, next_week
            );
        }
        Ok(missed)
    }
}
