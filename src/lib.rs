//! fedipost - ActivityPub federation for a single-user personal site
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      API Layer (Axum)                        │
//! │  - Actor, inbox, outbox, collections                        │
//! │  - WebFinger, health, metrics                               │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     Service Layer                            │
//! │  - Record activity + enqueue jobs in one transaction        │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//! ┌──────────────────────────────┐  ┌───────────────────────────┐
//! │        Data Layer            │  │        Job Workers         │
//! │  - SQLite (sqlx)             │◄─┤  - Follow / Undo handling  │
//! │  - activities, followers,    │  │  - Signed delivery         │
//! │    notes, jobs               │  │                            │
//! └──────────────────────────────┘  └───────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - `api`: HTTP handlers
//! - `service`: Activity recording
//! - `jobs`: Durable job queue, worker pool and federation handlers
//! - `federation`: Wire types, HTTP signatures, actor fetching, delivery
//! - `identity`: Local users, key pairs and API keys
//! - `data`: Database layer
//! - `config`: Configuration management
//! - `error`: Error types

pub mod api;
pub mod config;
pub mod data;
pub mod error;
pub mod federation;
pub mod identity;
pub mod jobs;
pub mod metrics;
pub mod service;

use std::sync::Arc;
use std::time::Duration;

/// Application state shared across all handlers
///
/// Cheap to clone; every member is reference counted internally.
#[derive(Clone)]
pub struct AppState {
    /// Application configuration
    pub config: Arc<config::AppConfig>,

    /// Database connection pool
    pub db: data::Database,

    /// Local users, keys and API keys
    pub identity: identity::IdentityService,

    /// Activity recording
    pub activities: service::ActivityService,

    /// Background job queue
    pub jobs: jobs::JobQueue,

    /// Remote actor fetching (cached)
    pub fetcher: federation::ActorFetcher,

    /// Signed activity delivery
    pub delivery: federation::ActivityDelivery,
}

impl AppState {
    /// Initialize application state
    ///
    /// # Steps
    /// 1. Connect to SQLite database
    /// 2. Build the federation HTTP client
    /// 3. Ensure the configured owner exists with keys and API key
    ///
    /// # Errors
    /// Returns error if any initialization step fails
    pub async fn new(config: config::AppConfig) -> Result<Self, error::AppError> {
        tracing::info!("Initializing application state...");

        // 1. Connect to SQLite database
        let db =
            data::Database::connect(&config.database.path, config.database.max_connections).await?;
        tracing::info!("Database connected");

        // 2. Initialize HTTP client
        let http_client = reqwest::Client::builder()
            .user_agent(config.federation.user_agent.clone())
            .timeout(Duration::from_secs(config.federation.request_timeout_seconds))
            .build()
            .map_err(|e| error::AppError::Internal(e.into()))?;

        let identity = identity::IdentityService::new(db.clone());
        let jobs = jobs::JobQueue::new(db.clone(), config.jobs.clone());
        let activities = service::ActivityService::new(db.clone(), jobs.clone());
        let fetcher = federation::ActorFetcher::new(http_client.clone(), &config.federation);
        let delivery =
            federation::ActivityDelivery::new(http_client, config.federation.allow_private_hosts);

        // 3. Initialize owner
        let owner = identity.ensure_owner(&config.owner).await?;
        tracing::info!(
            username = %owner.username,
            actor = %config.server.actor_id(&owner.username),
            "Owner ready"
        );

        tracing::info!("Application state initialized successfully");

        Ok(Self {
            config: Arc::new(config),
            db,
            identity,
            activities,
            jobs,
            fetcher,
            delivery,
        })
    }

    /// Job runner wired to this state's collaborators
    pub fn job_runner(&self) -> jobs::FederationJobRunner {
        jobs::FederationJobRunner::new(
            self.db.clone(),
            self.identity.clone(),
            self.fetcher.clone(),
            self.delivery.clone(),
            self.config.server.clone(),
        )
    }

    /// Worker pool over this state's queue
    pub fn worker_pool(&self) -> jobs::WorkerPool<jobs::FederationJobRunner> {
        jobs::WorkerPool::new(self.jobs.clone(), self.job_runner())
    }
}

/// Largest accepted request body
const MAX_BODY_BYTES: usize = 1024 * 1024;

/// Build the Axum router with all routes.
///
/// This is shared by the binary and integration tests to keep route
/// composition consistent across environments.
pub fn build_router(state: AppState) -> axum::Router {
    use axum::Router;
    use tower_http::{
        compression::CompressionLayer, limit::RequestBodyLimitLayer, trace::TraceLayer,
    };

    let cors_layer = build_cors_layer(&state.config.server);

    Router::new()
        .route("/health", axum::routing::get(health_check))
        .merge(api::wellknown_router())
        .merge(api::activitypub_router())
        .layer(RequestBodyLimitLayer::new(MAX_BODY_BYTES))
        .layer(CompressionLayer::new())
        .layer(TraceLayer::new_for_http())
        .layer(cors_layer)
        .with_state(state)
        .merge(api::metrics_router())
}

fn build_cors_layer(server: &config::ServerConfig) -> tower_http::cors::CorsLayer {
    use axum::http::HeaderValue;
    use tower_http::cors::{Any, CorsLayer};

    if !server.protocol.eq_ignore_ascii_case("https") {
        return CorsLayer::permissive();
    }

    let allowed_origin = server.base_url();
    match HeaderValue::from_str(&allowed_origin) {
        Ok(origin) => CorsLayer::new()
            .allow_origin([origin])
            .allow_methods(Any)
            .allow_headers(Any),
        Err(error) => {
            tracing::error!(
                %error,
                origin = %allowed_origin,
                "Failed to parse CORS origin from server base URL; denying cross-origin requests"
            );
            CorsLayer::new().allow_methods(Any).allow_headers(Any)
        }
    }
}

/// GET /health
///
/// Reports 503 when the database cannot be reached.
async fn health_check(
    axum::extract::State(state): axum::extract::State<AppState>,
) -> Result<&'static str, axum::http::StatusCode> {
    state.db.ping().await.map_err(|error| {
        tracing::error!(%error, "Health check could not reach the database");
        axum::http::StatusCode::SERVICE_UNAVAILABLE
    })?;
    Ok("OK")
}
