use log::{debug, info};
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

use crate::{
    domain::{
        competitions::{insert_ticket_in_tx, reserve_in_tx, ReserveAttempt},
        Error, Ticket, TicketSource,
    },
    infra::db::{format_datetime, DBConnection},
};

use super::{Payment, PaymentState};

/// Outcome of one settlement transaction attempt. Mirrors `ReserveAttempt`
/// but adds the payment-side terminal cases.
#[derive(Debug)]
enum SettleAttempt {
    Settled(Ticket),
    AlreadySettled(Ticket),
    Conflict,
    WrongState(PaymentState),
    PaymentMissing,
    CompetitionMissing,
    NotOpen(String),
    Capacity {
        slug: String,
        requested: u32,
        remaining: u32,
    },
}

#[derive(Debug, Clone)]
pub struct PaymentStore {
    db_connection: DBConnection,
    max_cas_attempts: u32,
}

impl PaymentStore {
    pub fn new(db_connection: DBConnection, max_cas_attempts: u32) -> Self {
        Self {
            db_connection,
            max_cas_attempts: max_cas_attempts.max(1),
        }
    }

    /// Insert a new payment row in `created` state. Idempotent on
    /// `payment_id`: a replayed create returns the existing row untouched.
    pub async fn create_payment(&self, payment: Payment) -> Result<Payment, Error> {
        let row = payment.clone();
        let inserted = self
            .db_connection
            .execute_write(move |pool| async move {
                let result = sqlx::query(
                    "INSERT INTO payments (
                        payment_id,
                        competition_slug,
                        payer_id,
                        quantity,
                        amount_minor,
                        state,
                        created_at
                    ) VALUES (?, ?, ?, ?, ?, ?, ?)
                    ON CONFLICT (payment_id) DO NOTHING",
                )
                .bind(&row.payment_id)
                .bind(&row.competition_slug)
                .bind(&row.payer_id)
                .bind(row.quantity as i64)
                .bind(row.amount_minor)
                .bind(row.state.to_string())
                .bind(format_datetime(row.created_at)?)
                .execute(&pool)
                .await?;
                Ok(result.rows_affected() > 0)
            })
            .await?;

        if inserted {
            info!(
                "created payment {} for {} x{}",
                payment.payment_id, payment.competition_slug, payment.quantity
            );
            Ok(payment)
        } else {
            debug!("payment {} already exists, replaying", payment.payment_id);
            self.get_payment(&payment.payment_id).await
        }
    }

    pub async fn get_payment(&self, payment_id: &str) -> Result<Payment, Error> {
        sqlx::query_as::<_, Payment>("SELECT * FROM payments WHERE payment_id = ?")
            .bind(payment_id)
            .fetch_optional(self.db_connection.read())
            .await?
            .ok_or_else(|| Error::NotFound(format!("payment {}", payment_id)))
    }

    /// Move `created -> approved`. Returns the stored payment whether or not
    /// this call made the transition, so concurrent approvals converge.
    pub async fn mark_approved(&self, payment_id: &str) -> Result<Payment, Error> {
        let id = payment_id.to_string();
        let approved_at = format_datetime(OffsetDateTime::now_utc()).map_err(Error::DbError)?;

        self.db_connection
            .execute_write(move |pool| async move {
                sqlx::query(
                    "UPDATE payments
                    SET state = 'approved', approved_at = ?
                    WHERE payment_id = ? AND state = 'created'",
                )
                .bind(approved_at)
                .bind(&id)
                .execute(&pool)
                .await?;
                Ok(())
            })
            .await?;

        self.get_payment(payment_id).await
    }

    /// Move a non-completed payment to `cancelled`. No-op if it already
    /// settled or cancelled.
    pub async fn mark_cancelled(&self, payment_id: &str, reason: &str) -> Result<Payment, Error> {
        let id = payment_id.to_string();
        let reason_owned = reason.to_string();
        let cancelled_at = format_datetime(OffsetDateTime::now_utc()).map_err(Error::DbError)?;

        let cancelled = self
            .db_connection
            .execute_write(move |pool| async move {
                let result = sqlx::query(
                    "UPDATE payments
                    SET state = 'cancelled', cancel_reason = ?, cancelled_at = ?
                    WHERE payment_id = ? AND state IN ('created', 'approved')",
                )
                .bind(&reason_owned)
                .bind(cancelled_at)
                .bind(&id)
                .execute(&pool)
                .await?;
                Ok(result.rows_affected() > 0)
            })
            .await?;

        if cancelled {
            info!("cancelled payment {}: {}", payment_id, reason);
        }
        self.get_payment(payment_id).await
    }

    /// Settle an approved payment: allocate the ticket block, write the
    /// ticket row, and flip the payment to `completed`, all in one
    /// transaction. A replayed call finds the completed row and returns the
    /// original ticket, so at most one ticket record ever exists per
    /// payment. The unique index on `tickets.payment_id` backs that up at
    /// the storage layer.
    pub async fn settle_and_issue(&self, payment_id: &str, txid: &str) -> Result<Ticket, Error> {
        for attempt in 1..=self.max_cas_attempts {
            let id = payment_id.to_string();
            let txid_owned = txid.to_string();
            let now = OffsetDateTime::now_utc();

            let outcome = self
                .db_connection
                .execute_write(move |pool| async move {
                    let mut tx = pool.begin().await?;

                    let payment: Option<Payment> =
                        sqlx::query_as::<_, Payment>("SELECT * FROM payments WHERE payment_id = ?")
                            .bind(&id)
                            .fetch_optional(&mut *tx)
                            .await?;

                    let Some(payment) = payment else {
                        tx.rollback().await?;
                        return Ok(SettleAttempt::PaymentMissing);
                    };

                    match payment.state {
                        PaymentState::Approved => {}
                        PaymentState::Completed => {
                            let ticket = sqlx::query_as::<_, Ticket>(
                                "SELECT * FROM tickets WHERE payment_id = ?",
                            )
                            .bind(&id)
                            .fetch_one(&mut *tx)
                            .await?;
                            tx.rollback().await?;
                            return Ok(SettleAttempt::AlreadySettled(ticket));
                        }
                        other => {
                            tx.rollback().await?;
                            return Ok(SettleAttempt::WrongState(other));
                        }
                    }

                    let reserved =
                        reserve_in_tx(&mut *tx, &payment.competition_slug, payment.quantity, now)
                            .await?;
                    let reservation = match reserved {
                        ReserveAttempt::Allocated(reservation) => reservation,
                        ReserveAttempt::Conflict => {
                            tx.rollback().await?;
                            return Ok(SettleAttempt::Conflict);
                        }
                        ReserveAttempt::NotFound => {
                            tx.rollback().await?;
                            return Ok(SettleAttempt::CompetitionMissing);
                        }
                        ReserveAttempt::NotOpen => {
                            tx.rollback().await?;
                            return Ok(SettleAttempt::NotOpen(payment.competition_slug));
                        }
                        ReserveAttempt::Capacity { remaining } => {
                            tx.rollback().await?;
                            return Ok(SettleAttempt::Capacity {
                                slug: payment.competition_slug,
                                requested: payment.quantity,
                                remaining,
                            });
                        }
                    };

                    let ticket = Ticket {
                        id: Uuid::now_v7(),
                        competition_slug: payment.competition_slug.clone(),
                        owner_id: payment.payer_id.clone(),
                        first_number: reservation.first_number,
                        quantity: reservation.quantity,
                        source: TicketSource::Purchase,
                        payment_id: Some(id.clone()),
                        issued_at: now,
                    };
                    insert_ticket_in_tx(&mut *tx, &ticket).await?;

                    sqlx::query(
                        "UPDATE payments
                        SET state = 'completed', txid = ?, completed_at = ?
                        WHERE payment_id = ? AND state = 'approved'",
                    )
                    .bind(&txid_owned)
                    .bind(format_datetime(now)?)
                    .bind(&id)
                    .execute(&mut *tx)
                    .await?;

                    tx.commit().await?;
                    Ok(SettleAttempt::Settled(ticket))
                })
                .await?;

            match outcome {
                SettleAttempt::Settled(ticket) => {
                    info!(
                        "settled payment {} as tickets {:?}",
                        payment_id,
                        ticket.numbers()
                    );
                    return Ok(ticket);
                }
                SettleAttempt::AlreadySettled(ticket) => {
                    debug!("payment {} already settled, replaying", payment_id);
                    return Ok(ticket);
                }
                SettleAttempt::Conflict => {
                    debug!(
                        "settlement conflict on {} (attempt {}/{})",
                        payment_id, attempt, self.max_cas_attempts
                    );
                    continue;
                }
                SettleAttempt::WrongState(state) => {
                    return Err(Error::InvalidState(format!(
                        "payment {} is {}, expected approved",
                        payment_id, state
                    )))
                }
                SettleAttempt::PaymentMissing => {
                    return Err(Error::NotFound(format!("payment {}", payment_id)))
                }
                SettleAttempt::CompetitionMissing => {
                    return Err(Error::NotFound(format!(
                        "competition for payment {}",
                        payment_id
                    )))
                }
                SettleAttempt::NotOpen(slug) => return Err(Error::CompetitionNotActive(slug)),
                SettleAttempt::Capacity {
                    slug,
                    requested,
                    remaining,
                } => return Err(Error::CapacityExceeded(slug, requested, remaining)),
            }
        }

        Err(Error::ConflictRetryExhausted)
    }

    /// Payments stuck in `approved` longer than `stuck_after`. The
    /// settlement watcher re-drives these against the processor.
    pub async fn get_stuck_approved(&self, stuck_after: Duration) -> Result<Vec<Payment>, Error> {
        let cutoff = format_datetime(OffsetDateTime::now_utc() - stuck_after)
            .map_err(Error::DbError)?;

        let payments = sqlx::query_as::<_, Payment>(
            "SELECT * FROM payments
            WHERE state = 'approved' AND approved_at < ?
            ORDER BY approved_at",
        )
        .bind(cutoff)
        .fetch_all(self.db_connection.read())
        .await?;
        Ok(payments)
    }
}
