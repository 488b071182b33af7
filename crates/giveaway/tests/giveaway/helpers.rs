use async_trait::async_trait;
use giveaway::{
    Competition, CompetitionStore, CreateCompetition, DBConnection, DatabasePoolConfig,
    DrawEngine, DrawSettings, DrawStore, GiveawayHooks, LoggingHooks, MockPiProcessor,
    PaymentProcessor, PaymentStore, ProcessorError, ProcessorPayment, SettlementPipeline, Ticket,
};
use mockall::mock;
use std::sync::{Arc, Mutex, Once};
use time::{Duration, OffsetDateTime};

static INIT_LOGGER: Once = Once::new();

pub fn init_logger() {
    INIT_LOGGER.call_once(|| {
        let _ = env_logger::builder().is_test(true).try_init();
    });
}

mock! {
    #[derive(Send, Sync)]
    pub Processor { }

    #[async_trait]
    impl PaymentProcessor for Processor {
        async fn lookup(&self, payment_id: &str) -> Result<ProcessorPayment, ProcessorError>;
        async fn approve(&self, payment_id: &str) -> Result<(), ProcessorError>;
        async fn complete(&self, payment_id: &str, txid: &str) -> Result<(), ProcessorError>;
        async fn cancel(&self, payment_id: &str) -> Result<(), ProcessorError>;
    }
}

// Plenty of CAS headroom so contention tests never exhaust retries
pub const TEST_CAS_ATTEMPTS: u32 = 64;

/// Hook sink that records every granted ticket for assertions.
#[derive(Clone, Default)]
pub struct RecordingHooks {
    pub granted: Arc<Mutex<Vec<Ticket>>>,
}

#[async_trait]
impl GiveawayHooks for RecordingHooks {
    async fn ticket_granted(&self, ticket: &Ticket) {
        self.granted.lock().unwrap().push(ticket.clone());
    }

    async fn winner_selected(&self, _week: &str, _winner_id: &str, _prize_pool_minor: i64) {}

    async fn prize_rolled_over(&self, _from_week: &str, _to_week: &str, _amount_minor: i64) {}
}

pub fn competition_store(db: DBConnection) -> CompetitionStore {
    CompetitionStore::new(db, TEST_CAS_ATTEMPTS, Arc::new(LoggingHooks))
}

pub async fn setup_ledger(test_name: &str) -> DBConnection {
    init_logger();
    DBConnection::new("./test_data", test_name, DatabasePoolConfig::testing())
        .await
        .expect("Failed to create test ledger db")
}

pub struct TestApp {
    pub competitions: CompetitionStore,
    pub payments: PaymentStore,
    pub settlement: SettlementPipeline,
    pub draws: DrawEngine,
    pub processor: MockPiProcessor,
}

pub async fn spawn_services(test_name: &str) -> TestApp {
    spawn_services_with_draw_settings(test_name, test_draw_settings()).await
}

pub async fn spawn_services_with_draw_settings(
    test_name: &str,
    draw_settings: DrawSettings,
) -> TestApp {
    let db = setup_ledger(test_name).await;
    let processor = MockPiProcessor::new();
    build_services(db, Arc::new(processor.clone()), draw_settings, processor)
}

/// Same wiring but with a mockall processor, for injecting upstream
/// behaviors the stateful mock cannot express.
pub async fn spawn_services_with_processor(
    test_name: &str,
    processor: MockProcessor,
) -> TestApp {
    let db = setup_ledger(test_name).await;
    build_services(
        db,
        Arc::new(processor),
        test_draw_settings(),
        MockPiProcessor::new(),
    )
}

fn build_services(
    db: DBConnection,
    processor: Arc<dyn PaymentProcessor>,
    draw_settings: DrawSettings,
    pi_mock: MockPiProcessor,
) -> TestApp {
    let hooks: Arc<dyn GiveawayHooks> = Arc::new(LoggingHooks);
    let competitions = CompetitionStore::new(db.clone(), TEST_CAS_ATTEMPTS, hooks.clone());
    let payments = PaymentStore::new(db.clone(), TEST_CAS_ATTEMPTS);
    let settlement = SettlementPipeline::new(
        payments.clone(),
        competitions.clone(),
        processor,
        hooks.clone(),
    );
    let draws = DrawEngine::new(DrawStore::new(db), hooks, draw_settings);

    TestApp {
        competitions,
        payments,
        settlement,
        draws,
        processor: pi_mock,
    }
}

pub fn test_draw_settings() -> DrawSettings {
    DrawSettings {
        carryover_ratio: 0.20,
        claim_window_secs: 1864,
        code_ttl_secs: 1864,
        base_prize_pool_minor: 0,
    }
}

pub async fn create_open_competition(
    store: &CompetitionStore,
    slug: &str,
    total_tickets: u32,
    entry_fee_minor: i64,
) -> Competition {
    let now = OffsetDateTime::now_utc();
    store
        .create_competition(CreateCompetition {
            slug: slug.to_string(),
            title: format!("{} title", slug),
            total_tickets,
            entry_fee_minor,
            starts_at: now - Duration::hours(1),
            ends_at: now + Duration::hours(24),
        })
        .await
        .expect("Failed to create test competition")
}
