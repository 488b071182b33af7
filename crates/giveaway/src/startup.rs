use crate::{
    api::routes::{
        add_draw_entries, approve_payment, cancel_payment, claim_draw, complete_payment,
        create_competition, create_payment, get_competition, get_competitions, get_draw_cycle,
        get_user_tickets, grant_tickets, health, run_draw_cycle,
    },
    config::Settings,
    domain::{
        CompetitionStore, DrawEngine, DrawStore, GiveawayHooks, LoggingHooks, PaymentStore,
        SettlementPipeline, SettlementWatcher,
    },
    infra::{
        db::{DBConnection, DatabasePoolConfig},
        file_utils::create_folder,
        pi::{build_processor_client, PaymentProcessor, PiClient},
    },
};

// Mock implementations only available with e2e-testing feature or debug builds
#[cfg(any(feature = "e2e-testing", debug_assertions))]
use crate::infra::pi_mock::MockPiProcessor;
use anyhow::anyhow;
use axum::{
    body::Body,
    extract::{connect_info::IntoMakeServiceWithConnectInfo, ConnectInfo, Request},
    http::HeaderValue,
    middleware::{self, AddExtension, Next},
    response::IntoResponse,
    routing::{get, post},
    serve::Serve,
    Router,
};
use hyper::{
    header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE},
    Method,
};
use log::{error, info, warn};
use std::{collections::HashMap, net::SocketAddr, str::FromStr};
use std::{sync::Arc, time::Duration};
use tokio::{net::TcpListener, select, task::JoinHandle};
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tower_http::cors::{AllowOrigin, CorsLayer};

pub struct Application {
    server: Serve<
        TcpListener,
        IntoMakeServiceWithConnectInfo<Router, SocketAddr>,
        AddExtension<Router, ConnectInfo<SocketAddr>>,
    >,
    cancellation_token: CancellationToken,
    background_tasks: TaskTracker,
}

impl Application {
    pub async fn build(config: Settings) -> Result<Self, anyhow::Error> {
        let address = format!(
            "{}:{}",
            config.api_settings.domain, config.api_settings.port
        );
        let listener = SocketAddr::from_str(&address)?;
        let origins = config.api_settings.origins.clone();
        let (app_state, background_tasks, cancellation_token) = build_app(config).await?;
        let server = build_server(listener, app_state, origins).await?;
        Ok(Self {
            server,
            cancellation_token,
            background_tasks,
        })
    }

    pub async fn run_until_stopped(self) -> Result<(), anyhow::Error> {
        info!("Starting server...");
        match self.server.with_graceful_shutdown(shutdown_signal()).await {
            Ok(_) => {
                info!("Server shutdown initiated");
                self.cancellation_token.cancel();

                let timeout = tokio::time::sleep(Duration::from_secs(10));
                select! {
                    _ = self.background_tasks.wait() => {
                        info!("Background tasks completed gracefully");
                    }
                    _ = timeout => {
                        warn!("Background tasks timed out during shutdown");
                    }
                }

                info!("Shutdown complete");
                Ok(())
            }
            Err(e) => {
                error!("Server shutdown error: {}", e);
                self.cancellation_token.cancel();

                let _ = tokio::time::timeout(
                    Duration::from_secs(5),
                    self.background_tasks.wait(),
                )
                .await;

                Err(anyhow!("Error during server shutdown: {}", e))
            }
        }
    }
}

#[derive(Clone)]
pub struct AppState {
    pub competition_store: CompetitionStore,
    pub settlement: SettlementPipeline,
    pub draw_engine: DrawEngine,
    pub background_threads: Arc<HashMap<String, JoinHandle<()>>>,
}

pub async fn build_app(
    config: Settings,
) -> Result<(AppState, TaskTracker, CancellationToken), anyhow::Error> {
    // Payment processor (real or mock based on config)
    #[cfg(any(feature = "e2e-testing", debug_assertions))]
    let processor: Arc<dyn PaymentProcessor> = if config.pi_settings.mock_enabled {
        info!("Mock Pi payment processor configured");
        Arc::new(MockPiProcessor::new())
    } else {
        let client = build_processor_client(Duration::from_secs(
            config.pi_settings.request_timeout_secs,
        ));
        let pi_client = PiClient::new(client, &config.pi_settings).map(Arc::new)?;
        info!("Pi payment processor configured");
        pi_client
    };

    #[cfg(not(any(feature = "e2e-testing", debug_assertions)))]
    let processor: Arc<dyn PaymentProcessor> = {
        if config.pi_settings.mock_enabled {
            return Err(anyhow!(
                "Mock Pi processor requires e2e-testing feature or debug build"
            ));
        }
        let client = build_processor_client(Duration::from_secs(
            config.pi_settings.request_timeout_secs,
        ));
        let pi_client = PiClient::new(client, &config.pi_settings).map(Arc::new)?;
        info!("Pi payment processor configured");
        pi_client
    };

    create_folder(&config.db_settings.data_folder.clone());

    let pool_config: DatabasePoolConfig = config.db_settings.clone().into();

    let ledger_db = DBConnection::new(&config.db_settings.data_folder, "ledger", pool_config)
        .await
        .map_err(|e| anyhow!("Error setting up ledger db: {}", e))?;

    let hooks: Arc<dyn GiveawayHooks> = Arc::new(LoggingHooks);

    let competition_store = CompetitionStore::new(
        ledger_db.clone(),
        config.reservation_settings.max_cas_attempts,
        hooks.clone(),
    );
    let payment_store = PaymentStore::new(
        ledger_db.clone(),
        config.reservation_settings.max_cas_attempts,
    );
    let settlement = SettlementPipeline::new(
        payment_store,
        competition_store.clone(),
        processor,
        hooks.clone(),
    );
    let draw_engine = DrawEngine::new(
        DrawStore::new(ledger_db),
        hooks,
        config.draw_settings.clone(),
    );
    info!("Giveaway services configured");

    let tracker = TaskTracker::new();
    let mut threads = HashMap::new();
    let cancel_token = CancellationToken::new();

    let settlement_watcher = SettlementWatcher::new(
        settlement.clone(),
        cancel_token.clone(),
        Duration::from_secs(config.settlement_settings.watch_interval_secs),
        time::Duration::seconds(config.settlement_settings.retry_stuck_after_secs as i64),
        config.settlement_settings.sweep_concurrency,
    );
    let settlement_watcher_task = tracker.spawn(async move {
        match settlement_watcher.watch().await {
            Ok(_) => {
                info!("Successfully shutdown settlement watcher")
            }
            Err(e) => {
                error!("Error in settlement watcher: {}", e)
            }
        }
    });

    tracker.close();
    threads.insert(String::from("settlement_watcher"), settlement_watcher_task);

    let app_state = AppState {
        competition_store,
        settlement,
        draw_engine,
        background_threads: Arc::new(threads),
    };
    Ok((app_state, tracker, cancel_token))
}

pub async fn build_server(
    socket_addr: SocketAddr,
    app_state: AppState,
    origins: Vec<String>,
) -> Result<
    Serve<
        TcpListener,
        IntoMakeServiceWithConnectInfo<Router, SocketAddr>,
        AddExtension<Router, ConnectInfo<SocketAddr>>,
    >,
    anyhow::Error,
> {
    let listener = TcpListener::bind(socket_addr).await?;

    info!("Setting up service");
    let app = app(app_state, origins);
    let server = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    );
    info!(
        "Service running @: http://{}:{}",
        socket_addr.ip(),
        socket_addr.port()
    );
    Ok(server)
}

pub fn app(app_state: AppState, origins: Vec<String>) -> Router {
    let origins: Vec<HeaderValue> = origins
        .into_iter()
        .filter_map(|origin| origin.parse().ok())
        .collect();

    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([ACCEPT, CONTENT_TYPE, AUTHORIZATION])
        .allow_origin(AllowOrigin::list(origins))
        .allow_credentials(true);

    Router::new()
        .route("/api/v1/health_check", get(health))
        .route("/api/v1/competitions", post(create_competition))
        .route("/api/v1/competitions", get(get_competitions))
        .route("/api/v1/competitions/{slug}", get(get_competition))
        .route("/api/v1/competitions/{slug}/tickets", get(get_user_tickets))
        .route("/api/v1/competitions/{slug}/grants", post(grant_tickets))
        .route("/api/v1/payments", post(create_payment))
        .route(
            "/api/v1/payments/{payment_id}/approve",
            post(approve_payment),
        )
        .route(
            "/api/v1/payments/{payment_id}/complete",
            post(complete_payment),
        )
        .route("/api/v1/payments/{payment_id}/cancel", post(cancel_payment))
        .route("/api/v1/draws/run", post(run_draw_cycle))
        .route("/api/v1/draws/{week}", get(get_draw_cycle))
        .route("/api/v1/draws/{week}/entries", post(add_draw_entries))
        .route("/api/v1/draws/{week}/claim", post(claim_draw))
        .layer(middleware::from_fn(log_request))
        .with_state(Arc::new(app_state))
        .layer(cors)
}

async fn log_request(request: Request<Body>, next: Next) -> impl IntoResponse {
    let now = time::OffsetDateTime::now_utc();
    let path = request
        .uri()
        .path_and_query()
        .map(|p| p.as_str())
        .unwrap_or_default();
    info!(target: "http_request","new request, {} {}", request.method().as_str(), path);

    let response = next.run(request).await;
    let response_time = time::OffsetDateTime::now_utc() - now;
    info!(target: "http_response", "response, code: {}, time: {}", response.status().as_str(), response_time);

    response
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .unwrap_or_else(|e| error!("Failed to install Ctrl+C handler: {}", e));
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => error!("Failed to install SIGTERM handler: {}", e),
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    select! {
        _ = ctrl_c => info!("Received Ctrl+C signal"),
        _ = terminate => info!("Received SIGTERM signal"),
    }
}
