use log::{error, info, warn};
use std::sync::Arc;
use time::OffsetDateTime;

use crate::{
    domain::{CompetitionStore, Error, GiveawayHooks},
    infra::pi::{PaymentProcessor, ProcessorError},
};

use super::{CreatePayment, Payment, PaymentState, PaymentStore, SettlementReceipt};

/// Drives the two-phase settlement protocol against the external processor
/// while keeping the local ledger the source of truth for ticket issuance.
/// Every entry point is idempotent on the payment id.
#[derive(Clone)]
pub struct SettlementPipeline {
    payments: PaymentStore,
    competitions: CompetitionStore,
    processor: Arc<dyn PaymentProcessor>,
    hooks: Arc<dyn GiveawayHooks>,
}

impl SettlementPipeline {
    pub fn new(
        payments: PaymentStore,
        competitions: CompetitionStore,
        processor: Arc<dyn PaymentProcessor>,
        hooks: Arc<dyn GiveawayHooks>,
    ) -> Self {
        Self {
            payments,
            competitions,
            processor,
            hooks,
        }
    }

    pub fn payments(&self) -> &PaymentStore {
        &self.payments
    }

    /// Record a purchase intent. The competition must be accepting entries
    /// and the amount is always derived server-side from the stored entry
    /// fee, never trusted from the caller.
    pub async fn create(&self, payer_id: &str, create: CreatePayment) -> Result<Payment, Error> {
        if create.quantity < 1 {
            return Err(Error::BadRequest("quantity must be at least 1".into()));
        }
        if create.payment_id.trim().is_empty() {
            return Err(Error::BadRequest("payment_id must not be empty".into()));
        }

        let competition = self
            .competitions
            .get_competition(&create.competition_slug)
            .await?;
        if !competition.is_open_at(OffsetDateTime::now_utc()) {
            return Err(Error::CompetitionNotActive(competition.slug));
        }
        let remaining = competition.remaining();
        if create.quantity > remaining {
            return Err(Error::CapacityExceeded(
                competition.slug,
                create.quantity,
                remaining,
            ));
        }

        let payment = Payment {
            payment_id: create.payment_id,
            competition_slug: create.competition_slug,
            payer_id: payer_id.to_string(),
            quantity: create.quantity,
            amount_minor: competition.entry_fee_minor * create.quantity as i64,
            state: PaymentState::Created,
            txid: None,
            cancel_reason: None,
            created_at: OffsetDateTime::now_utc(),
            approved_at: None,
            completed_at: None,
            cancelled_at: None,
        };

        let stored = self.payments.create_payment(payment).await?;
        if stored.payer_id != payer_id {
            return Err(Error::BadRequest(format!(
                "payment {} belongs to another payer",
                stored.payment_id
            )));
        }
        Ok(stored)
    }

    /// Phase one: acknowledge the payment upstream and mark it approved
    /// locally. Replays and concurrent calls converge on the stored state;
    /// an upstream refusal cancels the payment so no ticket can ever be
    /// issued for it.
    pub async fn approve(&self, payment_id: &str) -> Result<Payment, Error> {
        let payment = self.payments.get_payment(payment_id).await?;
        match payment.state {
            PaymentState::Created => {}
            PaymentState::Approved | PaymentState::Completed => return Ok(payment),
            PaymentState::Cancelled => {
                return Err(Error::InvalidState(format!(
                    "payment {} was cancelled",
                    payment_id
                )))
            }
        }

        match self.processor.approve(payment_id).await {
            Ok(()) => self.payments.mark_approved(payment_id).await,
            Err(ProcessorError::Rejected(reason)) => {
                warn!("processor rejected approval of {}: {}", payment_id, reason);
                self.payments
                    .mark_cancelled(payment_id, &format!("processor rejected: {}", reason))
                    .await?;
                Err(Error::Upstream(ProcessorError::Rejected(reason)))
            }
            // Transient upstream failure leaves the payment in `created`;
            // the caller or the watcher retries.
            Err(err) => Err(Error::Upstream(err)),
        }
    }

    /// Phase two: confirm the on-chain transaction upstream, then settle
    /// locally. Ticket allocation, ticket insert, and the completed flip
    /// happen in one ledger transaction, so a crash between the upstream
    /// call and the local write leaves the payment approved and re-drivable
    /// rather than half-settled.
    pub async fn complete(&self, payment_id: &str, txid: &str) -> Result<SettlementReceipt, Error> {
        let payment = self.payments.get_payment(payment_id).await?;
        match payment.state {
            PaymentState::Approved => {}
            PaymentState::Completed => {
                // Replay: hand back the original receipt.
                let ticket = self
                    .competitions
                    .get_ticket_by_payment(payment_id)
                    .await?
                    .ok_or_else(|| {
                        error!("completed payment {} has no ticket", payment_id);
                        Error::InvalidState(format!(
                            "payment {} completed without a ticket",
                            payment_id
                        ))
                    })?;
                return Ok(SettlementReceipt { payment, ticket });
            }
            PaymentState::Created => {
                return Err(Error::InvalidState(format!(
                    "payment {} has not been approved",
                    payment_id
                )))
            }
            PaymentState::Cancelled => {
                return Err(Error::InvalidState(format!(
                    "payment {} was cancelled",
                    payment_id
                )))
            }
        }
        if txid.trim().is_empty() {
            return Err(Error::BadRequest("txid must not be empty".into()));
        }

        match self.processor.complete(payment_id, txid).await {
            Ok(()) => {}
            Err(ProcessorError::Rejected(reason)) => {
                warn!("processor rejected completion of {}: {}", payment_id, reason);
                self.payments
                    .mark_cancelled(payment_id, &format!("processor rejected: {}", reason))
                    .await?;
                return Err(Error::Upstream(ProcessorError::Rejected(reason)));
            }
            Err(err) => return Err(Error::Upstream(err)),
        }

        let ticket = self.payments.settle_and_issue(payment_id, txid).await?;
        let payment = self.payments.get_payment(payment_id).await?;

        self.hooks.ticket_granted(&ticket).await;
        info!(
            "payment {} settled: tickets {:?} for {}",
            payment_id,
            ticket.numbers(),
            ticket.owner_id
        );
        Ok(SettlementReceipt { payment, ticket })
    }

    /// Abort a payment that has not settled. Completed payments are never
    /// cancelled; repeating a cancel is a no-op.
    pub async fn cancel(&self, payment_id: &str, reason: &str) -> Result<Payment, Error> {
        let payment = self.payments.get_payment(payment_id).await?;
        if payment.state.is_terminal() {
            return Ok(payment);
        }

        match self.processor.cancel(payment_id).await {
            Ok(()) => {}
            Err(ProcessorError::Rejected(reason)) => {
                // The processor no longer knows the payment; cancel locally
                // anyway so it cannot settle later.
                warn!(
                    "processor rejected cancel of {} ({}), cancelling locally",
                    payment_id, reason
                );
            }
            Err(err) => return Err(Error::Upstream(err)),
        }

        self.payments.mark_cancelled(payment_id, reason).await
    }

    /// Re-drive one stuck approved payment from the watcher: ask the
    /// processor what actually happened and converge the ledger on it.
    pub async fn reconcile(&self, payment_id: &str) -> Result<(), Error> {
        let payment = self.payments.get_payment(payment_id).await?;
        if payment.state != PaymentState::Approved {
            return Ok(());
        }

        let upstream = self.processor.lookup(payment_id).await?;
        if upstream.status.cancelled {
            self.payments
                .mark_cancelled(payment_id, "cancelled upstream")
                .await?;
            return Ok(());
        }
        if upstream.status.transaction_verified {
            let Some(transaction) = upstream.transaction else {
                warn!(
                    "payment {} verified upstream but carries no transaction, leaving approved",
                    payment_id
                );
                return Ok(());
            };
            let receipt = self.complete(payment_id, &transaction.txid).await?;
            info!(
                "reconciled stuck payment {} as tickets {:?}",
                payment_id,
                receipt.ticket.numbers()
            );
        }
        Ok(())
    }
}
