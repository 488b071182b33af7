use log::{debug, info};
use sqlx::SqliteConnection;
use std::sync::Arc;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::{
    domain::{Error, GiveawayHooks},
    infra::db::{format_datetime, DBConnection},
};

use super::{Competition, CompetitionStatus, CreateCompetition, Reservation, Ticket, TicketSource};

/// One optimistic attempt against the sold counter. `Conflict` means another
/// writer moved the counter between our read and our conditional update.
#[derive(Debug)]
pub(crate) enum ReserveAttempt {
    Allocated(Reservation),
    Conflict,
    NotFound,
    NotOpen,
    Capacity { remaining: u32 },
}

/// Atomic read-check-increment of a competition's sold counter. The update
/// is keyed on the observed value, so a lost update can never oversell; the
/// caller retries on `Conflict`.
pub(crate) async fn reserve_in_tx(
    conn: &mut SqliteConnection,
    slug: &str,
    quantity: u32,
    now: OffsetDateTime,
) -> Result<ReserveAttempt, sqlx::Error> {
    let row: Option<Competition> =
        sqlx::query_as::<_, Competition>("SELECT * FROM competitions WHERE slug = ?")
            .bind(slug)
            .fetch_optional(&mut *conn)
            .await?;

    let Some(competition) = row else {
        return Ok(ReserveAttempt::NotFound);
    };

    if competition.status != CompetitionStatus::Active
        || now < competition.starts_at
        || now > competition.ends_at
    {
        return Ok(ReserveAttempt::NotOpen);
    }

    // checked_add so an absurd quantity reads as over-capacity instead of
    // wrapping past the counter.
    let observed = competition.tickets_sold;
    let wanted = observed.checked_add(quantity);
    let Some(wanted) = wanted.filter(|w| *w <= competition.total_tickets) else {
        return Ok(ReserveAttempt::Capacity {
            remaining: competition.remaining(),
        });
    };

    let result = sqlx::query(
        "UPDATE competitions
        SET tickets_sold = ?
        WHERE slug = ? AND tickets_sold = ?",
    )
    .bind(wanted as i64)
    .bind(slug)
    .bind(observed as i64)
    .execute(&mut *conn)
    .await?;

    if result.rows_affected() == 0 {
        return Ok(ReserveAttempt::Conflict);
    }

    Ok(ReserveAttempt::Allocated(Reservation {
        first_number: observed + 1,
        quantity,
        new_tickets_sold: wanted,
    }))
}

pub(crate) async fn insert_ticket_in_tx(
    conn: &mut SqliteConnection,
    ticket: &Ticket,
) -> Result<(), sqlx::Error> {
    let issued_at = format_datetime(ticket.issued_at)?;

    sqlx::query(
        "INSERT INTO tickets (
            id,
            competition_slug,
            owner_id,
            first_number,
            quantity,
            source,
            payment_id,
            issued_at
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(ticket.id.to_string())
    .bind(&ticket.competition_slug)
    .bind(&ticket.owner_id)
    .bind(ticket.first_number as i64)
    .bind(ticket.quantity as i64)
    .bind(ticket.source.to_string())
    .bind(&ticket.payment_id)
    .bind(issued_at)
    .execute(&mut *conn)
    .await?;

    Ok(())
}

#[derive(Clone)]
pub struct CompetitionStore {
    db_connection: DBConnection,
    max_cas_attempts: u32,
    hooks: Arc<dyn GiveawayHooks>,
}

impl CompetitionStore {
    pub fn new(
        db_connection: DBConnection,
        max_cas_attempts: u32,
        hooks: Arc<dyn GiveawayHooks>,
    ) -> Self {
        Self {
            db_connection,
            max_cas_attempts: max_cas_attempts.max(1),
            hooks,
        }
    }

    pub async fn ping(&self) -> Result<(), sqlx::Error> {
        self.db_connection.ping().await
    }

    pub async fn create_competition(
        &self,
        create: CreateCompetition,
    ) -> Result<Competition, Error> {
        if create.ends_at <= create.starts_at {
            return Err(Error::BadRequest(
                "competition must end after it starts".into(),
            ));
        }

        let competition = Competition {
            slug: create.slug,
            title: create.title,
            total_tickets: create.total_tickets,
            tickets_sold: 0,
            entry_fee_minor: create.entry_fee_minor,
            status: CompetitionStatus::Active,
            starts_at: create.starts_at,
            ends_at: create.ends_at,
            created_at: OffsetDateTime::now_utc(),
        };

        let row = competition.clone();
        self.db_connection
            .execute_write(move |pool| async move {
                sqlx::query(
                    "INSERT INTO competitions (
                        slug,
                        title,
                        total_tickets,
                        tickets_sold,
                        entry_fee_minor,
                        status,
                        starts_at,
                        ends_at,
                        created_at
                    ) VALUES (?, ?, ?, 0, ?, ?, ?, ?, ?)",
                )
                .bind(&row.slug)
                .bind(&row.title)
                .bind(row.total_tickets as i64)
                .bind(row.entry_fee_minor)
                .bind(row.status.to_string())
                .bind(format_datetime(row.starts_at)?)
                .bind(format_datetime(row.ends_at)?)
                .bind(format_datetime(row.created_at)?)
                .execute(&pool)
                .await?;
                Ok(())
            })
            .await?;

        info!(
            "created competition {} with {} tickets",
            competition.slug, competition.total_tickets
        );
        Ok(competition)
    }

    pub async fn get_competition(&self, slug: &str) -> Result<Competition, Error> {
        sqlx::query_as::<_, Competition>("SELECT * FROM competitions WHERE slug = ?")
            .bind(slug)
            .fetch_optional(self.db_connection.read())
            .await?
            .ok_or_else(|| Error::NotFound(format!("competition {}", slug)))
    }

    pub async fn get_competitions(&self) -> Result<Vec<Competition>, Error> {
        let competitions =
            sqlx::query_as::<_, Competition>("SELECT * FROM competitions ORDER BY created_at DESC")
                .fetch_all(self.db_connection.read())
                .await?;
        Ok(competitions)
    }

    /// Mark competitions ended once their sale window passed or they sold
    /// out. Safe to call from any sweep; the guard keeps it one-directional.
    pub async fn close_expired_competitions(&self) -> Result<u64, Error> {
        let now = format_datetime(OffsetDateTime::now_utc()).map_err(Error::DbError)?;

        let closed = self
            .db_connection
            .execute_write(move |pool| async move {
                let result = sqlx::query(
                    "UPDATE competitions
                    SET status = 'ended'
                    WHERE status = 'active'
                      AND (ends_at < ? OR tickets_sold >= total_tickets)",
                )
                .bind(now)
                .execute(&pool)
                .await?;
                Ok(result.rows_affected())
            })
            .await?;

        if closed > 0 {
            info!("closed {} expired competitions", closed);
        }
        Ok(closed)
    }

    /// Reserve a contiguous block of ticket numbers. Never partially
    /// allocates: the caller either gets the whole block or an error.
    pub async fn reserve(&self, slug: &str, quantity: u32) -> Result<Reservation, Error> {
        if quantity < 1 {
            return Err(Error::BadRequest("quantity must be at least 1".into()));
        }

        for attempt in 1..=self.max_cas_attempts {
            let slug_owned = slug.to_string();
            let now = OffsetDateTime::now_utc();

            let outcome = self
                .db_connection
                .execute_write(move |pool| async move {
                    let mut tx = pool.begin().await?;
                    let outcome = reserve_in_tx(&mut *tx, &slug_owned, quantity, now).await?;
                    match outcome {
                        ReserveAttempt::Allocated(_) => tx.commit().await?,
                        _ => tx.rollback().await?,
                    }
                    Ok(outcome)
                })
                .await?;

            match outcome {
                ReserveAttempt::Allocated(reservation) => {
                    debug!(
                        "reserved tickets {}..={} for {}",
                        reservation.first_number,
                        reservation.new_tickets_sold,
                        slug
                    );
                    return Ok(reservation);
                }
                ReserveAttempt::Conflict => {
                    debug!(
                        "reservation conflict on {} (attempt {}/{})",
                        slug, attempt, self.max_cas_attempts
                    );
                    continue;
                }
                ReserveAttempt::NotFound => {
                    return Err(Error::NotFound(format!("competition {}", slug)))
                }
                ReserveAttempt::NotOpen => {
                    return Err(Error::CompetitionNotActive(slug.to_string()))
                }
                ReserveAttempt::Capacity { remaining } => {
                    return Err(Error::CapacityExceeded(slug.to_string(), quantity, remaining))
                }
            }
        }

        Err(Error::ConflictRetryExhausted)
    }

    /// Reserve and issue in one transaction, for tickets granted outside the
    /// payment flow (grant, gift, earned, carryover). Purchase tickets go
    /// through the settlement pipeline instead, which ties the same
    /// allocation to the payment row.
    pub async fn issue_ticket(
        &self,
        slug: &str,
        owner_id: &str,
        quantity: u32,
        source: TicketSource,
    ) -> Result<Ticket, Error> {
        if quantity < 1 {
            return Err(Error::BadRequest("quantity must be at least 1".into()));
        }
        if source == TicketSource::Purchase {
            return Err(Error::BadRequest(
                "purchase tickets are issued by payment settlement".into(),
            ));
        }

        for _attempt in 1..=self.max_cas_attempts {
            let slug_owned = slug.to_string();
            let owner_owned = owner_id.to_string();
            let now = OffsetDateTime::now_utc();

            let outcome = self
                .db_connection
                .execute_write(move |pool| async move {
                    let mut tx = pool.begin().await?;
                    let outcome = reserve_in_tx(&mut *tx, &slug_owned, quantity, now).await?;

                    let ReserveAttempt::Allocated(reservation) = outcome else {
                        tx.rollback().await?;
                        return Ok(Err(outcome));
                    };

                    let ticket = Ticket {
                        id: Uuid::now_v7(),
                        competition_slug: slug_owned,
                        owner_id: owner_owned,
                        first_number: reservation.first_number,
                        quantity: reservation.quantity,
                        source,
                        payment_id: None,
                        issued_at: now,
                    };
                    insert_ticket_in_tx(&mut *tx, &ticket).await?;
                    tx.commit().await?;
                    Ok(Ok(ticket))
                })
                .await?;

            match outcome {
                Ok(ticket) => {
                    info!(
                        "issued {} ticket {:?} to {} in {}",
                        source,
                        ticket.numbers(),
                        ticket.owner_id,
                        slug
                    );
                    self.hooks.ticket_granted(&ticket).await;
                    return Ok(ticket);
                }
                Err(ReserveAttempt::Conflict) => continue,
                Err(ReserveAttempt::NotFound) => {
                    return Err(Error::NotFound(format!("competition {}", slug)))
                }
                Err(ReserveAttempt::NotOpen) => {
                    return Err(Error::CompetitionNotActive(slug.to_string()))
                }
                Err(ReserveAttempt::Capacity { remaining }) => {
                    return Err(Error::CapacityExceeded(slug.to_string(), quantity, remaining))
                }
                Err(ReserveAttempt::Allocated(_)) => continue,
            }
        }

        Err(Error::ConflictRetryExhausted)
    }

    pub async fn get_user_tickets(&self, slug: &str, owner_id: &str) -> Result<Vec<Ticket>, Error> {
        let tickets = sqlx::query_as::<_, Ticket>(
            "SELECT * FROM tickets
            WHERE competition_slug = ? AND owner_id = ?
            ORDER BY first_number",
        )
        .bind(slug)
        .bind(owner_id)
        .fetch_all(self.db_connection.read())
        .await?;
        Ok(tickets)
    }

    pub async fn get_ticket_by_payment(&self, payment_id: &str) -> Result<Option<Ticket>, Error> {
        let ticket = sqlx::query_as::<_, Ticket>("SELECT * FROM tickets WHERE payment_id = ?")
            .bind(payment_id)
            .fetch_optional(self.db_connection.read())
            .await?;
        Ok(ticket)
    }
}
