use async_trait::async_trait;
use log::{debug, info};
use std::{
    collections::HashMap,
    sync::{Arc, RwLock},
};

use super::pi::{
    PaymentProcessor, ProcessorError, ProcessorPayment, ProcessorPaymentStatus,
    ProcessorTransaction,
};

/// A mock Pi payment processor for E2E testing.
///
/// Simulates the upstream approve/complete/cancel lifecycle without a real
/// processor. Payments must be seeded with `register_payment` first; calls
/// against unknown payment ids are rejected, the way the real processor
/// rejects ids it never issued.
#[derive(Clone, Default)]
pub struct MockPiProcessor {
    payments: Arc<RwLock<HashMap<String, MockPayment>>>,
    unavailable: Arc<RwLock<bool>>,
}

#[derive(Debug, Clone)]
struct MockPayment {
    amount: f64,
    approved: bool,
    completed: bool,
    cancelled: bool,
    txid: Option<String>,
}

impl MockPiProcessor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a payment as if a payer had initiated it on the Pi platform.
    pub fn register_payment(&self, payment_id: &str, amount: f64) {
        let mut payments = self.payments.write().expect("mock lock poisoned");
        payments.insert(
            payment_id.to_string(),
            MockPayment {
                amount,
                approved: false,
                completed: false,
                cancelled: false,
                txid: None,
            },
        );
        debug!("mock processor registered payment {}", payment_id);
    }

    /// Record a payer-submitted on-chain transaction, as if the blockchain
    /// had verified it. Lets tests drive the stuck-payment recovery path.
    pub fn submit_transaction(&self, payment_id: &str, txid: &str) {
        let mut payments = self.payments.write().expect("mock lock poisoned");
        if let Some(payment) = payments.get_mut(payment_id) {
            payment.txid = Some(txid.to_string());
        }
    }

    /// Flip the processor into an outage; all calls return `Unavailable`.
    pub fn set_unavailable(&self, unavailable: bool) {
        *self.unavailable.write().expect("mock lock poisoned") = unavailable;
    }

    pub fn was_approved(&self, payment_id: &str) -> bool {
        self.payments
            .read()
            .expect("mock lock poisoned")
            .get(payment_id)
            .map(|p| p.approved)
            .unwrap_or(false)
    }

    fn check_available(&self) -> Result<(), ProcessorError> {
        if *self.unavailable.read().expect("mock lock poisoned") {
            return Err(ProcessorError::Unavailable("mock outage".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl PaymentProcessor for MockPiProcessor {
    async fn lookup(&self, payment_id: &str) -> Result<ProcessorPayment, ProcessorError> {
        self.check_available()?;
        let payments = self.payments.read().expect("mock lock poisoned");
        let payment = payments
            .get(payment_id)
            .ok_or_else(|| ProcessorError::Rejected(format!("unknown payment {}", payment_id)))?;

        Ok(ProcessorPayment {
            identifier: payment_id.to_string(),
            amount: payment.amount,
            status: ProcessorPaymentStatus {
                developer_approved: payment.approved,
                transaction_verified: payment.txid.is_some(),
                developer_completed: payment.completed,
                cancelled: payment.cancelled,
            },
            transaction: payment.txid.clone().map(|txid| ProcessorTransaction {
                txid,
                verified: true,
            }),
        })
    }

    async fn approve(&self, payment_id: &str) -> Result<(), ProcessorError> {
        self.check_available()?;
        let mut payments = self.payments.write().expect("mock lock poisoned");
        let payment = payments
            .get_mut(payment_id)
            .ok_or_else(|| ProcessorError::Rejected(format!("unknown payment {}", payment_id)))?;

        if payment.cancelled {
            return Err(ProcessorError::Rejected(format!(
                "payment {} already cancelled",
                payment_id
            )));
        }
        payment.approved = true;
        info!("mock processor approved payment {}", payment_id);
        Ok(())
    }

    async fn complete(&self, payment_id: &str, txid: &str) -> Result<(), ProcessorError> {
        self.check_available()?;
        let mut payments = self.payments.write().expect("mock lock poisoned");
        let payment = payments
            .get_mut(payment_id)
            .ok_or_else(|| ProcessorError::Rejected(format!("unknown payment {}", payment_id)))?;

        if !payment.approved {
            return Err(ProcessorError::Rejected(format!(
                "payment {} was never approved",
                payment_id
            )));
        }
        if payment.cancelled {
            return Err(ProcessorError::Rejected(format!(
                "payment {} already cancelled",
                payment_id
            )));
        }
        payment.completed = true;
        payment.txid = Some(txid.to_string());
        info!("mock processor completed payment {}", payment_id);
        Ok(())
    }

    async fn cancel(&self, payment_id: &str) -> Result<(), ProcessorError> {
        self.check_available()?;
        let mut payments = self.payments.write().expect("mock lock poisoned");
        let payment = payments
            .get_mut(payment_id)
            .ok_or_else(|| ProcessorError::Rejected(format!("unknown payment {}", payment_id)))?;

        // Cancelling an already-completed payment is a processor-side no-op
        if !payment.completed {
            payment.cancelled = true;
        }
        info!("mock processor cancelled payment {}", payment_id);
        Ok(())
    }
}
