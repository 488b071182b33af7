use async_trait::async_trait;
use log::info;

use super::Ticket;

/// Notification points fired after a state change has committed. Failures
/// here must never unwind the change itself, so implementations return
/// nothing and handle their own errors.
#[async_trait]
pub trait GiveawayHooks: Send + Sync {
    async fn ticket_granted(&self, ticket: &Ticket);
    async fn winner_selected(&self, week: &str, winner_id: &str, prize_pool_minor: i64);
    async fn prize_rolled_over(&self, from_week: &str, to_week: &str, amount_minor: i64);
}

/// Default hook sink that just records the events in the log.
#[derive(Debug, Clone, Default)]
pub struct LoggingHooks;

#[async_trait]
impl GiveawayHooks for LoggingHooks {
    async fn ticket_granted(&self, ticket: &Ticket) {
        info!(
            "hook: {} ticket {:?} granted to {} in {}",
            ticket.source,
            ticket.numbers(),
            ticket.owner_id,
            ticket.competition_slug
        );
    }

    async fn winner_selected(&self, week: &str, winner_id: &str, prize_pool_minor: i64) {
        info!(
            "hook: {} won week {} ({} minor units)",
            winner_id, week, prize_pool_minor
        );
    }

    async fn prize_rolled_over(&self, from_week: &str, to_week: &str, amount_minor: i64) {
        info!(
            "hook: rolled {} minor units from week {} into week {}",
            amount_minor, from_week, to_week
        );
    }
}
