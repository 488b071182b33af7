use giveaway::{CompetitionStore, Error, TicketSource};
use std::collections::HashSet;
use std::sync::Arc;

use crate::helpers::{
    competition_store, create_open_competition, setup_ledger, spawn_services, RecordingHooks,
    TEST_CAS_ATTEMPTS,
};

#[tokio::test]
async fn concurrent_reservations_never_oversell() {
    let db = setup_ledger("concurrent_reservations_never_oversell").await;
    let store = competition_store(db);
    create_open_competition(&store, "weekly-mega", 10, 100).await;

    let mut handles = Vec::new();
    for _ in 0..20 {
        let store = store.clone();
        handles.push(tokio::spawn(async move {
            store.reserve("weekly-mega", 1).await
        }));
    }

    let mut allocated = Vec::new();
    let mut rejected = 0;
    for handle in handles {
        match handle.await.expect("task panicked") {
            Ok(reservation) => allocated.push(reservation),
            Err(Error::CapacityExceeded(..)) => rejected += 1,
            Err(other) => panic!("unexpected reservation error: {:?}", other),
        }
    }

    assert_eq!(allocated.len(), 10);
    assert_eq!(rejected, 10);

    // Every successful allocation got a distinct number and together they
    // cover the whole range exactly once.
    let numbers: HashSet<u32> = allocated.iter().flat_map(|r| r.numbers()).collect();
    assert_eq!(numbers, (1..=10).collect::<HashSet<u32>>());

    let competition = store.get_competition("weekly-mega").await.unwrap();
    assert_eq!(competition.tickets_sold, 10);
    assert!(competition.is_sold_out());
}

#[tokio::test]
async fn boundary_block_reservation_is_all_or_nothing() {
    let db = setup_ledger("boundary_block_reservation").await;
    let store = competition_store(db);
    create_open_competition(&store, "pi-day", 10, 250).await;

    // Sell the first eight
    let first = store.reserve("pi-day", 8).await.unwrap();
    assert_eq!(first.first_number, 1);
    assert_eq!(first.new_tickets_sold, 8);

    // Two racing block reservations for the last two tickets: exactly one
    // wins and it gets the contiguous 9,10 block, the other sees sold-out.
    let (a, b) = tokio::join!(store.reserve("pi-day", 2), store.reserve("pi-day", 2));

    let (winner, loser) = match (a, b) {
        (Ok(r), Err(e)) | (Err(e), Ok(r)) => (r, e),
        other => panic!("expected one winner and one loser, got {:?}", other),
    };
    assert_eq!(winner.numbers(), vec![9, 10]);
    assert!(matches!(loser, Error::CapacityExceeded(_, 2, 0)));

    let competition = store.get_competition("pi-day").await.unwrap();
    assert_eq!(competition.tickets_sold, 10);
}

#[tokio::test]
async fn grants_are_numbered_and_capacity_checked() {
    let app = spawn_services("grants_are_numbered").await;
    create_open_competition(&app.competitions, "gifted", 3, 100).await;

    let grant = app
        .competitions
        .issue_ticket("gifted", "user-a", 2, TicketSource::Grant)
        .await
        .unwrap();
    assert_eq!(grant.numbers(), vec![1, 2]);
    assert!(grant.payment_id.is_none());

    let gift = app
        .competitions
        .issue_ticket("gifted", "user-b", 1, TicketSource::Gift)
        .await
        .unwrap();
    assert_eq!(gift.numbers(), vec![3]);

    // Sold out now; the same capacity rule applies to grants.
    let over = app
        .competitions
        .issue_ticket("gifted", "user-c", 1, TicketSource::Earned)
        .await;
    assert!(matches!(over, Err(Error::CapacityExceeded(_, 1, 0))));

    let tickets = app
        .competitions
        .get_user_tickets("gifted", "user-a")
        .await
        .unwrap();
    assert_eq!(tickets.len(), 1);
    assert_eq!(tickets[0].source, TicketSource::Grant);
}

#[tokio::test]
async fn absurd_quantity_is_rejected_not_wrapped() {
    let db = setup_ledger("absurd_quantity_rejected").await;
    let store = competition_store(db);
    create_open_competition(&store, "overflow", 10, 100).await;

    store.reserve("overflow", 1).await.unwrap();

    // A quantity that would wrap the sold counter reads as over-capacity,
    // never as a passed check.
    let result = store.reserve("overflow", u32::MAX).await;
    assert!(matches!(
        result,
        Err(Error::CapacityExceeded(_, u32::MAX, 9))
    ));

    let competition = store.get_competition("overflow").await.unwrap();
    assert_eq!(competition.tickets_sold, 1);
}

#[tokio::test]
async fn grants_fire_the_ticket_granted_hook() {
    let db = setup_ledger("grants_fire_hook").await;
    let hooks = RecordingHooks::default();
    let store = CompetitionStore::new(db, TEST_CAS_ATTEMPTS, Arc::new(hooks.clone()));
    create_open_competition(&store, "hooked", 5, 100).await;

    let ticket = store
        .issue_ticket("hooked", "user-a", 2, TicketSource::Grant)
        .await
        .unwrap();

    let granted = hooks.granted.lock().unwrap();
    assert_eq!(granted.len(), 1);
    assert_eq!(granted[0].id, ticket.id);
    assert_eq!(granted[0].numbers(), vec![1, 2]);
}

#[tokio::test]
async fn purchase_source_must_go_through_settlement() {
    let app = spawn_services("purchase_source_rejected").await;
    create_open_competition(&app.competitions, "strict", 5, 100).await;

    let result = app
        .competitions
        .issue_ticket("strict", "user-a", 1, TicketSource::Purchase)
        .await;
    assert!(matches!(result, Err(Error::BadRequest(_))));
}

#[tokio::test]
async fn closed_window_rejects_reservations() {
    use giveaway::CreateCompetition;
    use time::{Duration, OffsetDateTime};

    let db = setup_ledger("closed_window_rejects").await;
    let store = competition_store(db);

    let now = OffsetDateTime::now_utc();
    store
        .create_competition(CreateCompetition {
            slug: "expired".to_string(),
            title: "Expired".to_string(),
            total_tickets: 10,
            entry_fee_minor: 100,
            starts_at: now - Duration::hours(3),
            ends_at: now - Duration::hours(1),
        })
        .await
        .unwrap();

    let result = store.reserve("expired", 1).await;
    assert!(matches!(result, Err(Error::CompetitionNotActive(_))));

    let closed = store.close_expired_competitions().await.unwrap();
    assert_eq!(closed, 1);
}

#[tokio::test]
async fn unknown_competition_is_not_found() {
    let db = setup_ledger("unknown_competition").await;
    let store = competition_store(db);

    let result = store.reserve("missing", 1).await;
    assert!(matches!(result, Err(Error::NotFound(_))));
}
