//! HTTP API and background runtime for the order purchase saga.
//!
//! The router exposes order placement, status, cancellation and the payment
//! webhook. [`Background`] runs everything that moves sagas forward: reply
//! workers, the outbox relay, the timeout sweeper, the command dispatcher and
//! the idempotency purge.

pub mod config;
pub mod error;
pub mod routes;

use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::routing::{get, post};
use chrono::Utc;
use idempotency::{IdempotencyStore, InMemoryIdempotencyStore, PostgresIdempotencyStore};
use messaging::{InMemoryBus, event_types};
use metrics_exporter_prometheus::PrometheusHandle;
use saga::{
    CommandDispatcher, InMemoryInventoryService, InMemoryNotificationService,
    InMemoryPaymentService, InMemorySagaStore, InventoryAdapter, NotificationAdapter,
    OutboxRelay, PaymentAdapter, PostgresSagaStore, RetryConfig, SagaCoordinator, SagaStore,
    TimeoutSweeper, spawn_workers,
};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use config::Config;
use error::StartupError;

/// How long a worker waits before redelivering a deferred reply.
const REPLY_REDELIVERY_DELAY: Duration = Duration::from_millis(200);

/// Shared application state accessible from all handlers.
pub struct AppState<S: SagaStore> {
    pub coordinator: Arc<SagaCoordinator<S>>,
    pub store_backend: &'static str,
}

/// Creates the Axum application router with all routes and shared state.
pub fn create_app<S: SagaStore + 'static>(
    state: Arc<AppState<S>>,
    metrics_handle: PrometheusHandle,
) -> Router {
    let metrics_router = Router::new()
        .route("/metrics", get(routes::metrics::get))
        .with_state(metrics_handle);

    Router::new()
        .route("/health", get(routes::health::check::<S>))
        .route("/orders", post(routes::orders::create::<S>))
        .route("/orders/{id}", get(routes::orders::get::<S>))
        .route("/orders/{id}/saga", get(routes::orders::saga::<S>))
        .route("/orders/{id}/cancel", post(routes::orders::cancel::<S>))
        .route("/webhooks/payment", post(routes::webhooks::payment::<S>))
        .with_state(state)
        .merge(metrics_router)
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
}

/// The saga and idempotency stores, behind trait objects so the rest of the
/// server does not care which backend was chosen.
#[derive(Clone)]
pub struct Backend {
    pub store: Arc<dyn SagaStore>,
    pub idempotency: Arc<dyn IdempotencyStore>,
    pub name: &'static str,
}

impl Backend {
    pub fn in_memory(config: &Config) -> Self {
        Self {
            store: Arc::new(InMemorySagaStore::new()),
            idempotency: Arc::new(InMemoryIdempotencyStore::with_config(
                config.idempotency_config(),
            )),
            name: "memory",
        }
    }

    /// Connects to PostgreSQL and applies migrations.
    pub async fn postgres(config: &Config, database_url: &str) -> Result<Self, StartupError> {
        let pool = sqlx::postgres::PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await?;

        let store = PostgresSagaStore::new(pool.clone());
        store.run_migrations().await?;
        let idempotency = PostgresIdempotencyStore::new(pool, config.idempotency_config());

        Ok(Self {
            store: Arc::new(store),
            idempotency: Arc::new(idempotency),
            name: "postgres",
        })
    }

    /// PostgreSQL when `DATABASE_URL` is configured, in-memory otherwise.
    pub async fn from_config(config: &Config) -> Result<Self, StartupError> {
        match config.database_url.as_deref() {
            Some(url) => {
                tracing::info!("using PostgreSQL stores");
                Self::postgres(config, url).await
            }
            None => {
                tracing::warn!("DATABASE_URL not set, state is kept in memory only");
                Ok(Self::in_memory(config))
            }
        }
    }
}

/// The capabilities the saga drives. This deployment uses in-memory stand-ins.
#[derive(Clone, Default)]
pub struct Capabilities {
    pub inventory: InMemoryInventoryService,
    pub payment: InMemoryPaymentService,
    pub notifications: InMemoryNotificationService,
}

/// Handles to the background tasks, stopped together on shutdown.
pub struct Background {
    shutdown: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

impl Background {
    /// Subscribes to the bus and starts every background task.
    pub async fn spawn(
        coordinator: Arc<SagaCoordinator<Arc<dyn SagaStore>>>,
        backend: &Backend,
        bus: InMemoryBus,
        capabilities: Capabilities,
        config: &Config,
    ) -> Self {
        let (shutdown, rx) = watch::channel(false);

        // Subscribe before anything can publish.
        let replies = bus.subscribe(event_types::SAGA_REPLIES).await;
        let commands = bus.subscribe(event_types::CAPABILITY_COMMANDS).await;

        let mut handles = spawn_workers(
            config.saga_workers,
            Arc::clone(&coordinator),
            replies,
            REPLY_REDELIVERY_DELAY,
            rx.clone(),
        );

        let relay = OutboxRelay::new(Arc::clone(&backend.store), bus.clone());
        handles.push(tokio::spawn(relay.run(config.relay_interval, rx.clone())));

        let sweeper = TimeoutSweeper::new(coordinator);
        handles.push(tokio::spawn(sweeper.run(config.sweep_interval, rx.clone())));

        let dispatcher = Arc::new(
            CommandDispatcher::new(Arc::clone(&backend.idempotency), bus)
                .register(InventoryAdapter::new(capabilities.inventory))
                .register(PaymentAdapter::new(capabilities.payment))
                .register(NotificationAdapter::new(capabilities.notifications)),
        );
        let redelivery = RetryConfig::default();
        handles.push(tokio::spawn(dispatcher.run(commands, redelivery, rx.clone())));

        handles.push(tokio::spawn(purge_idempotency_keys(
            Arc::clone(&backend.idempotency),
            config.idempotency_purge_interval,
            rx,
        )));

        tracing::info!(tasks = handles.len(), "background tasks started");
        Self { shutdown, handles }
    }

    /// Signals every task to stop and waits for them.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for result in futures_util::future::join_all(self.handles).await {
            if let Err(e) = result {
                tracing::error!(error = %e, "background task ended abnormally");
            }
        }
        tracing::info!("background tasks stopped");
    }
}

async fn purge_idempotency_keys(
    store: Arc<dyn IdempotencyStore>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            _ = ticker.tick() => {
                match store.purge_expired(Utc::now()).await {
                    Ok(0) => {}
                    Ok(purged) => {
                        metrics::counter!("idempotency_keys_purged_total").increment(purged);
                        tracing::debug!(purged, "expired idempotency keys removed");
                    }
                    Err(e) => tracing::error!(error = %e, "idempotency purge failed"),
                }
            }
        }
    }
}

/// Everything a running server needs, wired from one configuration.
pub struct Server {
    pub router: Router,
    pub coordinator: Arc<SagaCoordinator<Arc<dyn SagaStore>>>,
    pub background: Background,
}

impl Server {
    /// Builds the coordinator, starts background tasks and creates the router.
    pub async fn start(
        config: &Config,
        backend: Backend,
        capabilities: Capabilities,
        metrics_handle: PrometheusHandle,
    ) -> Self {
        let coordinator = Arc::new(SagaCoordinator::new(
            Arc::clone(&backend.store),
            config.saga_config(),
        ));
        let background = Background::spawn(
            Arc::clone(&coordinator),
            &backend,
            InMemoryBus::new(),
            capabilities,
            config,
        )
        .await;

        let state = Arc::new(AppState {
            coordinator: Arc::clone(&coordinator),
            store_backend: backend.name,
        });
        Self {
            router: create_app(state, metrics_handle),
            coordinator,
            background,
        }
    }
}
