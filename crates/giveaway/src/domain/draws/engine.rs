use itertools::Itertools;
use log::{info, warn};
use rand::{seq::IndexedRandom, RngCore, SeedableRng};
use rand_chacha::ChaCha20Rng;
use std::sync::Arc;
use time::{Date, Duration, OffsetDateTime, Weekday};
use uuid::Uuid;

use crate::{
    config::DrawSettings,
    domain::{Error, GiveawayHooks},
};

use super::{
    ClaimOutcome, CycleCommit, CycleOutcome, CyclePlan, DrawCycle, DrawStatus, DrawStore,
    DrawTicket, DrawTicketStatus,
};

/// Weekly draw/claim/rollover state machine. The scheduler calls
/// `run_cycle`; claims come in over the API. All the contended writes go
/// through conditional updates in `DrawStore`, so replayed triggers and
/// racing claims both converge instead of double-resolving.
#[derive(Clone)]
pub struct DrawEngine {
    store: DrawStore,
    hooks: Arc<dyn GiveawayHooks>,
    settings: DrawSettings,
}

impl DrawEngine {
    pub fn new(store: DrawStore, hooks: Arc<dyn GiveawayHooks>, settings: DrawSettings) -> Self {
        Self {
            store,
            hooks,
            settings,
        }
    }

    pub fn store(&self) -> &DrawStore {
        &self.store
    }

    /// Run the draw for `week` (e.g. `2026-W35`). Retires the prior week's
    /// eligibility, carries a configured fraction of each user's unused
    /// tickets forward, and uniformly draws one winner from the eligible
    /// set. Replaying the trigger for an already-drawn week returns the
    /// existing cycle untouched.
    pub async fn run_cycle(&self, week: &str) -> Result<CycleOutcome, Error> {
        let (year, week_number) = parse_week(week)?;
        let week_start = week_start(year, week_number)?;
        let prior_week = shift_week(year, week_number, -1)?;

        if let Some(existing) = self.store.get_cycle(week).await? {
            if existing.is_drawn() {
                info!("week {} already drawn, replaying", week);
                return Ok(CycleOutcome::Drawn { cycle: existing });
            }
        }

        let now = OffsetDateTime::now_utc();
        let prior_eligible = self.store.get_eligible_tickets(&prior_week).await?;
        let carried = self.plan_carryover(&prior_eligible, week, now);

        let mut pool = self.store.get_eligible_tickets(week).await?;
        pool.extend(carried.iter().cloned());
        if pool.is_empty() {
            info!("no eligible draw tickets for week {}, skipping", week);
            return Ok(CycleOutcome::NoEligibleTickets {
                week: week.to_string(),
            });
        }

        let mut rng = ChaCha20Rng::from_os_rng();
        let winner = pool
            .choose(&mut rng)
            .map(|ticket| ticket.user_id.clone())
            .ok_or_else(|| Error::InvalidState("empty draw pool".into()))?;
        let code = generate_code(&mut rng);

        let plan = CyclePlan {
            week: week.to_string(),
            prior_week: Some(prior_week),
            winner_id: winner.clone(),
            code,
            base_prize_pool_minor: self.settings.base_prize_pool_minor,
            week_start,
            draw_at: now,
            code_expires_at: now + Duration::seconds(self.settings.code_ttl_secs as i64),
            claim_expires_at: now + Duration::seconds(self.settings.claim_window_secs as i64),
            carried,
        };

        match self.store.commit_cycle(plan).await? {
            CycleCommit::Committed(cycle) => {
                self.hooks
                    .winner_selected(&cycle.week, &winner, cycle.prize_pool_minor)
                    .await;
                Ok(CycleOutcome::Drawn { cycle })
            }
            CycleCommit::AlreadyDrawn(cycle) => {
                info!("lost the draw race for week {}, replaying", week);
                Ok(CycleOutcome::Drawn { cycle })
            }
        }
    }

    /// Resolve a claim attempt. Wrong code or an expired window is a
    /// `Missed` outcome that rolls the prize into the next week; only the
    /// selected winner may resolve the cycle either way.
    pub async fn claim(
        &self,
        user_id: &str,
        submitted_code: &str,
        week: &str,
    ) -> Result<ClaimOutcome, Error> {
        let cycle = self
            .store
            .get_cycle(week)
            .await?
            .filter(DrawCycle::is_drawn)
            .ok_or_else(|| Error::NotFound(format!("draw for week {}", week)))?;

        if cycle.status != DrawStatus::Pending {
            return Err(Error::AlreadyResolved(week.to_string()));
        }
        if cycle.winner_id.as_deref() != Some(user_id) {
            return Err(Error::NotWinner(week.to_string()));
        }

        let now = OffsetDateTime::now_utc();
        let expired = !cycle.claim_window_open_at(now);
        if expired || submitted_code != cycle.code {
            let reason = if expired {
                "claim window expired"
            } else {
                "wrong code"
            };
            return self.miss(cycle, reason, now).await;
        }

        if !self.store.mark_won(week, now).await? {
            return Err(Error::AlreadyResolved(week.to_string()));
        }
        let cycle = self.reload(week).await?;
        info!("week {} claimed by {}", week, user_id);
        Ok(ClaimOutcome::Won { cycle })
    }

    /// Passive expiry check, callable from a sweep: a pending cycle whose
    /// window has lapsed is missed exactly as a wrong-code claim would be.
    pub async fn expire_if_lapsed(&self, week: &str) -> Result<Option<ClaimOutcome>, Error> {
        let Some(cycle) = self.store.get_cycle(week).await?.filter(DrawCycle::is_drawn) else {
            return Ok(None);
        };
        let now = OffsetDateTime::now_utc();
        if cycle.status != DrawStatus::Pending || cycle.claim_window_open_at(now) {
            return Ok(None);
        }
        self.miss(cycle, "claim window expired", now).await.map(Some)
    }

    async fn miss(
        &self,
        cycle: DrawCycle,
        reason: &str,
        now: OffsetDateTime,
    ) -> Result<ClaimOutcome, Error> {
        let (year, week_number) = parse_week(&cycle.week)?;
        let next_week = shift_week(year, week_number, 1)?;
        let (next_year, next_number) = parse_week(&next_week)?;
        let next_week_start = week_start(next_year, next_number)?;

        if !self
            .store
            .mark_missed(&cycle, reason, &next_week, next_week_start, now)
            .await?
        {
            return Err(Error::AlreadyResolved(cycle.week));
        }

        self.hooks
            .prize_rolled_over(&cycle.week, &next_week, cycle.prize_pool_minor)
            .await;
        warn!("week {} missed: {}", cycle.week, reason);

        let cycle = self.reload(&cycle.week).await?;
        Ok(ClaimOutcome::Missed { cycle })
    }

    async fn reload(&self, week: &str) -> Result<DrawCycle, Error> {
        self.store
            .get_cycle(week)
            .await?
            .ok_or_else(|| Error::NotFound(format!("draw for week {}", week)))
    }

    /// Per user, floor(ratio x unused-count) tickets carry into `week`.
    fn plan_carryover(
        &self,
        prior_eligible: &[DrawTicket],
        week: &str,
        now: OffsetDateTime,
    ) -> Vec<DrawTicket> {
        prior_eligible
            .iter()
            .map(|ticket| ticket.user_id.clone())
            .counts()
            .into_iter()
            .sorted()
            .flat_map(|(user_id, count)| {
                let carried = carryover_count(count, self.settings.carryover_ratio);
                (0..carried)
                    .map(|_| DrawTicket {
                        id: Uuid::now_v7(),
                        user_id: user_id.clone(),
                        draw_week: week.to_string(),
                        status: DrawTicketStatus::Carried,
                        created_at: now,
                    })
                    .collect::<Vec<_>>()
            })
            .collect()
    }
}

fn carryover_count(unused: usize, ratio: f64) -> usize {
    (unused as f64 * ratio).floor() as usize
}

fn generate_code(rng: &mut ChaCha20Rng) -> String {
    let mut bytes = [0u8; 16];
    rng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Parse a `YYYY-Wnn` ISO week identifier.
fn parse_week(week: &str) -> Result<(i32, u8), Error> {
    let invalid = || Error::BadRequest(format!("invalid week identifier: {}", week));

    let (year_part, week_part) = week.split_once("-W").ok_or_else(invalid)?;
    let year: i32 = year_part.parse().map_err(|_| invalid())?;
    let number: u8 = week_part.parse().map_err(|_| invalid())?;

    // Round-trip through a date so week 53 is only accepted in years that
    // have one.
    Date::from_iso_week_date(year, number, Weekday::Monday).map_err(|_| invalid())?;
    Ok((year, number))
}

fn week_start(year: i32, week: u8) -> Result<OffsetDateTime, Error> {
    let date = Date::from_iso_week_date(year, week, Weekday::Monday)
        .map_err(|e| Error::BadRequest(format!("invalid week: {}", e)))?;
    Ok(date.midnight().assume_utc())
}

fn shift_week(year: i32, week: u8, offset: i64) -> Result<String, Error> {
    let date = Date::from_iso_week_date(year, week, Weekday::Monday)
        .map_err(|e| Error::BadRequest(format!("invalid week: {}", e)))?;
    let shifted = date
        .checked_add(Duration::weeks(offset))
        .ok_or_else(|| Error::BadRequest("week out of range".into()))?;
    let (shifted_year, shifted_week, _) = shifted.to_iso_week_date();
    Ok(format_week(shifted_year, shifted_week))
}

fn format_week(year: i32, week: u8) -> String {
    format!("{:04}-W{:02}", year, week)
}
