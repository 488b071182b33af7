use giveaway::{
    CreatePayment, Error, PaymentState, ProcessorError, SettlementWatcher, TicketSource,
};
use mockall::predicate::eq;
use std::time::Duration as StdDuration;
use tokio_util::sync::CancellationToken;

use crate::helpers::{
    create_open_competition, spawn_services, spawn_services_with_processor, MockProcessor,
};

fn create_request(payment_id: &str, slug: &str, quantity: u32) -> CreatePayment {
    CreatePayment {
        payment_id: payment_id.to_string(),
        competition_slug: slug.to_string(),
        quantity,
    }
}

#[tokio::test]
async fn duplicated_complete_issues_exactly_one_ticket() {
    let app = spawn_services("duplicated_complete").await;
    create_open_competition(&app.competitions, "weekly", 10, 100).await;

    app.processor.register_payment("pay-1", 2.0);
    let payment = app
        .settlement
        .create("payer-1", create_request("pay-1", "weekly", 2))
        .await
        .unwrap();
    assert_eq!(payment.state, PaymentState::Created);
    assert_eq!(payment.amount_minor, 200);

    app.settlement.approve("pay-1").await.unwrap();

    // Webhook redelivery: the same completion lands twice.
    let first = app.settlement.complete("pay-1", "tx-abc").await.unwrap();
    let second = app.settlement.complete("pay-1", "tx-abc").await.unwrap();

    assert_eq!(first.ticket.id, second.ticket.id);
    assert_eq!(first.ticket.numbers(), vec![1, 2]);
    assert_eq!(second.ticket.numbers(), vec![1, 2]);
    assert_eq!(second.payment.state, PaymentState::Completed);
    assert_eq!(second.payment.txid.as_deref(), Some("tx-abc"));

    let tickets = app
        .competitions
        .get_user_tickets("weekly", "payer-1")
        .await
        .unwrap();
    assert_eq!(tickets.len(), 1);
    assert_eq!(tickets[0].source, TicketSource::Purchase);
    assert_eq!(tickets[0].payment_id.as_deref(), Some("pay-1"));

    let competition = app.competitions.get_competition("weekly").await.unwrap();
    assert_eq!(competition.tickets_sold, 2);
}

#[tokio::test]
async fn concurrent_completes_converge_on_one_ticket() {
    let app = spawn_services("concurrent_completes").await;
    create_open_competition(&app.competitions, "weekly", 10, 100).await;

    app.processor.register_payment("pay-9", 1.0);
    app.settlement
        .create("payer-9", create_request("pay-9", "weekly", 1))
        .await
        .unwrap();
    app.settlement.approve("pay-9").await.unwrap();

    let (a, b) = tokio::join!(
        app.settlement.complete("pay-9", "tx-1"),
        app.settlement.complete("pay-9", "tx-1"),
    );
    let a = a.unwrap();
    let b = b.unwrap();
    assert_eq!(a.ticket.id, b.ticket.id);

    let competition = app.competitions.get_competition("weekly").await.unwrap();
    assert_eq!(competition.tickets_sold, 1);
}

#[tokio::test]
async fn create_is_idempotent_and_amount_is_server_derived() {
    let app = spawn_services("create_idempotent").await;
    create_open_competition(&app.competitions, "weekly", 10, 250).await;

    app.processor.register_payment("pay-2", 3.0);
    let first = app
        .settlement
        .create("payer-2", create_request("pay-2", "weekly", 3))
        .await
        .unwrap();
    let replay = app
        .settlement
        .create("payer-2", create_request("pay-2", "weekly", 3))
        .await
        .unwrap();

    assert_eq!(first.amount_minor, 750);
    assert_eq!(replay.created_at, first.created_at);

    // Someone else replaying the same payment id gets rejected.
    let stolen = app
        .settlement
        .create("payer-3", create_request("pay-2", "weekly", 3))
        .await;
    assert!(matches!(stolen, Err(Error::BadRequest(_))));
}

#[tokio::test]
async fn cancel_is_idempotent_and_never_touches_a_settled_payment() {
    let app = spawn_services("cancel_idempotent").await;
    create_open_competition(&app.competitions, "weekly", 10, 100).await;

    app.processor.register_payment("pay-3", 1.0);
    app.settlement
        .create("payer-3", create_request("pay-3", "weekly", 1))
        .await
        .unwrap();
    app.settlement.approve("pay-3").await.unwrap();
    app.settlement.complete("pay-3", "tx-1").await.unwrap();

    // Cancelling a settled payment is a no-op.
    let cancelled = app.settlement.cancel("pay-3", "late regret").await.unwrap();
    assert_eq!(cancelled.state, PaymentState::Completed);

    let ticket = app
        .competitions
        .get_ticket_by_payment("pay-3")
        .await
        .unwrap();
    assert!(ticket.is_some());

    // An unsettled payment cancels once, then replays quietly.
    app.processor.register_payment("pay-4", 1.0);
    app.settlement
        .create("payer-4", create_request("pay-4", "weekly", 1))
        .await
        .unwrap();
    let once = app.settlement.cancel("pay-4", "user abort").await.unwrap();
    assert_eq!(once.state, PaymentState::Cancelled);
    assert_eq!(once.cancel_reason.as_deref(), Some("user abort"));
    let twice = app.settlement.cancel("pay-4", "again").await.unwrap();
    assert_eq!(twice.cancel_reason.as_deref(), Some("user abort"));
}

#[tokio::test]
async fn create_rejects_quantities_beyond_remaining_capacity() {
    let app = spawn_services("create_over_capacity").await;
    create_open_competition(&app.competitions, "weekly", 3, 100).await;

    app.processor.register_payment("pay-over", 5.0);
    let result = app
        .settlement
        .create("payer-o", create_request("pay-over", "weekly", 5))
        .await;
    assert!(matches!(result, Err(Error::CapacityExceeded(_, 5, 3))));
}

#[tokio::test]
async fn completing_an_unapproved_payment_is_invalid() {
    let app = spawn_services("complete_unapproved").await;
    create_open_competition(&app.competitions, "weekly", 10, 100).await;

    app.processor.register_payment("pay-5", 1.0);
    app.settlement
        .create("payer-5", create_request("pay-5", "weekly", 1))
        .await
        .unwrap();

    let result = app.settlement.complete("pay-5", "tx-1").await;
    assert!(matches!(result, Err(Error::InvalidState(_))));
}

#[tokio::test]
async fn processor_outage_leaves_payment_approved_and_re_drivable() {
    let app = spawn_services("processor_outage").await;
    create_open_competition(&app.competitions, "weekly", 10, 100).await;

    app.processor.register_payment("pay-6", 1.0);
    app.settlement
        .create("payer-6", create_request("pay-6", "weekly", 1))
        .await
        .unwrap();
    app.settlement.approve("pay-6").await.unwrap();

    app.processor.set_unavailable(true);
    let result = app.settlement.complete("pay-6", "tx-1").await;
    assert!(matches!(
        result,
        Err(Error::Upstream(ProcessorError::Unavailable(_)))
    ));

    // Nothing was issued and the payment is still re-drivable.
    let payment = app.payments.get_payment("pay-6").await.unwrap();
    assert_eq!(payment.state, PaymentState::Approved);
    let ticket = app
        .competitions
        .get_ticket_by_payment("pay-6")
        .await
        .unwrap();
    assert!(ticket.is_none());

    app.processor.set_unavailable(false);
    let receipt = app.settlement.complete("pay-6", "tx-1").await.unwrap();
    assert_eq!(receipt.ticket.numbers(), vec![1]);
}

#[tokio::test]
async fn upstream_rejection_on_approve_cancels_the_payment() {
    let app = spawn_services("approve_rejected").await;
    create_open_competition(&app.competitions, "weekly", 10, 100).await;

    // Never registered with the processor, so approval is refused.
    app.settlement
        .create("payer-7", create_request("pay-7", "weekly", 1))
        .await
        .unwrap();

    let result = app.settlement.approve("pay-7").await;
    assert!(matches!(
        result,
        Err(Error::Upstream(ProcessorError::Rejected(_)))
    ));

    let payment = app.payments.get_payment("pay-7").await.unwrap();
    assert_eq!(payment.state, PaymentState::Cancelled);

    // A rejected-then-cancelled payment can never settle.
    let completed = app.settlement.complete("pay-7", "tx-1").await;
    assert!(matches!(completed, Err(Error::InvalidState(_))));
}

#[tokio::test]
async fn upstream_rejection_on_complete_cancels_the_payment() {
    let mut processor = MockProcessor::new();
    processor
        .expect_approve()
        .with(eq("pay-8"))
        .returning(|_| Ok(()));
    processor
        .expect_complete()
        .with(eq("pay-8"), eq("tx-1"))
        .returning(|_, _| Err(ProcessorError::Rejected("tx not found on chain".into())));
    processor.expect_cancel().returning(|_| Ok(()));

    let app = spawn_services_with_processor("complete_rejected", processor).await;
    create_open_competition(&app.competitions, "weekly", 10, 100).await;

    app.settlement
        .create("payer-8", create_request("pay-8", "weekly", 1))
        .await
        .unwrap();
    app.settlement.approve("pay-8").await.unwrap();

    let result = app.settlement.complete("pay-8", "tx-1").await;
    assert!(matches!(
        result,
        Err(Error::Upstream(ProcessorError::Rejected(_)))
    ));

    let payment = app.payments.get_payment("pay-8").await.unwrap();
    assert_eq!(payment.state, PaymentState::Cancelled);
    let ticket = app
        .competitions
        .get_ticket_by_payment("pay-8")
        .await
        .unwrap();
    assert!(ticket.is_none());
}

#[tokio::test]
async fn watcher_reconciles_a_stuck_approved_payment() {
    let app = spawn_services("watcher_reconciles").await;
    create_open_competition(&app.competitions, "weekly", 10, 100).await;

    app.processor.register_payment("pay-stuck", 1.0);
    app.settlement
        .create("payer-s", create_request("pay-stuck", "weekly", 1))
        .await
        .unwrap();
    app.settlement.approve("pay-stuck").await.unwrap();

    // The payer submitted on-chain but our completion callback never
    // arrived. The watcher finds the verified transaction upstream.
    app.processor.submit_transaction("pay-stuck", "tx-chain");

    let watcher = SettlementWatcher::new(
        app.settlement.clone(),
        CancellationToken::new(),
        StdDuration::from_secs(60),
        time::Duration::seconds(0),
        2,
    );
    watcher.sweep_stuck_payments().await.unwrap();

    let payment = app.payments.get_payment("pay-stuck").await.unwrap();
    assert_eq!(payment.state, PaymentState::Completed);
    assert_eq!(payment.txid.as_deref(), Some("tx-chain"));
    let ticket = app
        .competitions
        .get_ticket_by_payment("pay-stuck")
        .await
        .unwrap();
    assert_eq!(ticket.unwrap().numbers(), vec![1]);
}

#[tokio::test]
async fn watcher_cancels_a_payment_cancelled_upstream() {
    let mut processor = MockProcessor::new();
    processor.expect_approve().returning(|_| Ok(()));
    processor.expect_lookup().returning(|id| {
        Ok(giveaway::ProcessorPayment {
            identifier: id.to_string(),
            amount: 1.0,
            status: giveaway::ProcessorPaymentStatus {
                developer_approved: true,
                transaction_verified: false,
                developer_completed: false,
                cancelled: true,
            },
            transaction: None,
        })
    });

    let app = spawn_services_with_processor("watcher_cancels", processor).await;
    create_open_competition(&app.competitions, "weekly", 10, 100).await;

    app.settlement
        .create("payer-c", create_request("pay-c", "weekly", 1))
        .await
        .unwrap();
    app.settlement.approve("pay-c").await.unwrap();

    app.settlement.reconcile("pay-c").await.unwrap();

    let payment = app.payments.get_payment("pay-c").await.unwrap();
    assert_eq!(payment.state, PaymentState::Cancelled);
}
