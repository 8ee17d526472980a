//! # imgopt: credit-metered image optimisation
//!
//! `imgopt` turns one uploaded image into two web-ready encodings (a resized JPEG and a resized
//! WebP) plus a short generated alt text, and charges the requesting user one credit for it.
//!
//! ## Request Flow
//!
//! A client posts a multipart form to `/api/optimize`. The handler takes a slot from the
//! [`limits`] layer, buffers the `image` field up to the configured ceiling and hands it to the
//! [`pipeline`], which:
//!
//! 1. identifies the caller through the configured [`auth`] methods,
//! 2. reserves a credit in the [`quota`] ledger (nothing is decoded for a user who cannot pay),
//! 3. decodes the image once and runs both encodes and the [`describe`] call concurrently,
//! 4. commits the credit when both encodes succeeded, or releases it otherwise.
//!
//! Description failures never fail a request; the response then carries the configured fallback
//! text. Credit bookkeeping problems that surface after the work is done are logged on the
//! `imgopt::reconciliation` target instead of being turned into errors.
//!
//! ## Quick Start
//!
//! ```no_run
//! use clap::Parser;
//! use imgopt::{Application, Config};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let args = imgopt::config::Args::parse();
//!     let config = Config::load(&args)?;
//!     imgopt::telemetry::init_telemetry(config.enable_otel_export)?;
//!
//!     let app = Application::new(config).await?;
//!     app.serve(async {
//!         tokio::signal::ctrl_c().await.expect("Failed to listen for Ctrl+C");
//!     })
//!     .await?;
//!
//!     Ok(())
//! }
//! ```
//!
//! ## Configuration
//!
//! See the [`config`] module for configuration options.

pub mod api;
pub mod auth;
pub mod config;
pub mod describe;
pub mod errors;
pub mod limits;
mod metrics;
mod openapi;
pub mod pipeline;
pub mod quota;
pub mod telemetry;
pub mod transcode;
mod types;

#[cfg(test)]
pub mod test_utils;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use axum::extract::DefaultBodyLimit;
use axum::http::{HeaderValue, Method, header};
use axum::{
    Json, Router,
    routing::{get, post},
};
use bon::Builder;
pub use config::Config;
use sqlx::PgPool;
use tokio::net::TcpListener;
use tower_http::{
    cors::{AllowOrigin, CorsLayer},
    trace::{DefaultMakeSpan, DefaultOnRequest, DefaultOnResponse, TraceLayer},
};
use tracing::{Level, debug, info, instrument};
use utoipa::OpenApi;

use crate::config::{CorsOrigin, CreditStoreConfig};
use crate::describe::{DescriptionGenerator, DescriptionSettings, DisabledDescriber, OpenAiDescriber};
use crate::limits::Limiters;
use crate::openapi::ApiDoc;
use crate::pipeline::Pipeline;
use crate::quota::{CreditStore, InMemoryCreditStore, PostgresCreditStore, QuotaLedger};
use crate::transcode::ImageTranscoder;

pub use types::{RequestId, UserId};

/// Multipart framing allowance on top of the image ceiling, so an image exactly at the limit is
/// rejected by our own check rather than by the body limit.
const MULTIPART_OVERHEAD_BYTES: usize = 64 * 1024;

/// Application state shared across all request handlers.
///
/// # Example
///
/// ```ignore
/// let state = AppState::builder()
///     .config(config)
///     .pipeline(Arc::new(pipeline))
///     .limiters(limiters)
///     .build();
/// ```
#[derive(Clone, Builder)]
pub struct AppState {
    pub config: Config,
    pub pipeline: Arc<Pipeline>,
    #[builder(default)]
    pub limiters: Limiters,
}

/// Credit store selected by configuration, plus the pool to close on shutdown when it is
/// PostgreSQL-backed.
async fn setup_credit_store(config: &Config) -> anyhow::Result<(Arc<dyn CreditStore>, Option<PgPool>)> {
    match &config.quota.store {
        CreditStoreConfig::Memory => {
            info!("Using in-memory credit store; balances are lost on restart");
            Ok((Arc::new(InMemoryCreditStore::default()), None))
        }
        CreditStoreConfig::Postgres { url, max_connections } => {
            let url = url
                .as_deref()
                .context("postgres credit store requires quota.store.url or DATABASE_URL")?;
            info!("Using PostgreSQL credit store");
            let store = PostgresCreditStore::connect(url, *max_connections)
                .await
                .context("failed to connect to credit store")?;
            let pool = store.pool().clone();
            Ok((Arc::new(store), Some(pool)))
        }
    }
}

/// Wire the pipeline's collaborators from configuration.
async fn setup_pipeline(config: &Config) -> anyhow::Result<(Pipeline, Option<PgPool>)> {
    let authenticator = auth::from_config(config).context("failed to set up authentication")?;

    let (ledger, pool) = if config.quota.enabled {
        let (store, pool) = setup_credit_store(config).await?;
        let ledger = QuotaLedger::new(
            store,
            config.quota.charge_policy,
            config.quota.max_retries,
            config.quota.initial_credits,
        );
        (Some(ledger), pool)
    } else {
        info!("Credit accounting disabled; anonymous requests are served free of charge");
        (None, None)
    };

    let describer: Arc<dyn DescriptionGenerator> = if config.description.enabled {
        Arc::new(OpenAiDescriber::from_config(&config.description).context("failed to build description client")?)
    } else {
        Arc::new(DisabledDescriber)
    };

    let pipeline = Pipeline::builder()
        .authenticator(authenticator)
        .maybe_ledger(ledger)
        .transcoder(Arc::new(ImageTranscoder::new(&config.transcode)))
        .describer(describer)
        .specs(config.transcode.specs())
        .description(DescriptionSettings::from(&config.description))
        .request_timeout(config.request_timeout)
        .build();

    Ok((pipeline, pool))
}

/// Create CORS layer from configuration
fn create_cors_layer(config: &Config) -> anyhow::Result<CorsLayer> {
    let cors_config = &config.auth.security.cors;

    let allow_origin = if cors_config
        .allowed_origins
        .iter()
        .any(|origin| matches!(origin, CorsOrigin::Wildcard)) {
        if cors_config.allow_credentials {
            anyhow::bail!("CORS wildcard origin cannot be combined with allow_credentials");
        }
        AllowOrigin::any()
    } else {
        let mut origins = Vec::new();
        for origin in &cors_config.allowed_origins {
            if let CorsOrigin::Url(url) = origin {
                origins.push(url.as_str().trim_end_matches('/').parse::<HeaderValue>()?);
            }
        }
        AllowOrigin::list(origins)
    };

    let mut cors = CorsLayer::new()
        .allow_origin(allow_origin)
        .allow_methods([Method::GET, Method::POST])
        .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION])
        .allow_credentials(cors_config.allow_credentials);

    if let Some(max_age) = cors_config.max_age {
        cors = cors.max_age(Duration::from_secs(max_age));
    }

    Ok(cors)
}

/// Build the application router.
///
/// - `POST /api/optimize` with a body limit slightly above `transcode.max_input_bytes`
/// - `GET /api/credits/balance`
/// - `GET /healthz` and `GET /openapi.json`
/// - `GET /internal/metrics` when metrics are enabled
///
/// CORS and request tracing wrap every route.
#[instrument(skip_all)]
pub fn build_router(state: &AppState) -> anyhow::Result<Router> {
    let body_limit = state.config.transcode.max_input_bytes + MULTIPART_OVERHEAD_BYTES;

    let api_routes = Router::new()
        .route(
            "/optimize",
            post(api::handlers::optimize::optimize_image).layer(DefaultBodyLimit::max(body_limit)),
        )
        .route("/credits/balance", get(api::handlers::credits::get_balance));

    let mut router = Router::new()
        .route("/healthz", get(api::handlers::health::healthz))
        .route("/openapi.json", get(|| async { Json(ApiDoc::openapi()) }))
        .nest("/api", api_routes)
        .with_state(state.clone());

    if state.config.enable_metrics {
        router = router.route("/internal/metrics", get(|| async { metrics::render() }));
    }

    let router = router.layer(create_cors_layer(&state.config)?).layer(
        TraceLayer::new_for_http()
            .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
            .on_request(DefaultOnRequest::new().level(Level::INFO))
            .on_response(DefaultOnResponse::new().level(Level::INFO)),
    );

    Ok(router)
}

/// Main application struct that owns the router and the credit store connection.
///
/// # Lifecycle
///
/// 1. **Create**: [`Application::new`] connects the credit store (running migrations for
///    PostgreSQL), builds the pipeline and the router
/// 2. **Serve**: [`Application::serve`] binds to a TCP port and starts handling requests
/// 3. **Shutdown**: when the shutdown future resolves, in-flight requests finish and the credit
///    store pool is closed
pub struct Application {
    router: Router,
    config: Config,
    credit_pool: Option<PgPool>,
}

impl Application {
    /// Create a new application instance with all resources initialized
    pub async fn new(config: Config) -> anyhow::Result<Self> {
        debug!(
            host = %config.host,
            port = config.port,
            quota = config.quota.enabled,
            description = config.description.enabled,
            "Starting imgopt"
        );

        let (pipeline, credit_pool) = setup_pipeline(&config).await?;
        let state = AppState::builder()
            .config(config.clone())
            .pipeline(Arc::new(pipeline))
            .limiters(Limiters::new(&config.limits))
            .build();
        let router = build_router(&state)?;

        Ok(Self {
            router,
            config,
            credit_pool,
        })
    }

    /// Convert application into a test server (for tests)
    #[cfg(test)]
    pub fn into_test_server(self) -> axum_test::TestServer {
        axum_test::TestServer::new(self.router).expect("Failed to create test server")
    }

    /// Start serving the application
    pub async fn serve<F>(self, shutdown: F) -> anyhow::Result<()>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let bind_addr = self.config.bind_address();
        let listener = TcpListener::bind(&bind_addr).await?;
        info!(
            "imgopt listening on http://{}, available at http://localhost:{}",
            bind_addr, self.config.port
        );

        axum::serve(listener, self.router.into_make_service())
            .with_graceful_shutdown(shutdown)
            .await?;

        if let Some(pool) = self.credit_pool {
            info!("Closing credit store connections...");
            pool.close().await;
        }

        Ok(())
    }
}
