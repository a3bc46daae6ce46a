use axum::{
    routing::{get, post},
    Router,
};
use std::{net::SocketAddr, sync::Arc};
use tokio::time::{interval, Duration};
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use chatcore_server::auth::AuthMiddleware;
use chatcore_server::broadcaster::Broadcaster;
use chatcore_server::hub::Hub;
use chatcore_server::metrics;
use chatcore_server::middleware;
use chatcore_server::pubsub::{distributed::DistributedPubSub, memory::MemoryPubSub, PubSub};
use chatcore_server::rest::{self, AppState};
use chatcore_server::store::{self, DbConfig};
use chatcore_server::token::TokenService;
use chatcore_server::{health, ws};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let log_level = std::env::var("RUST_LOG").unwrap_or_else(|_| {
        #[cfg(debug_assertions)]
        {
            "debug".to_string()
        }
        #[cfg(not(debug_assertions))]
        {
            "warn".to_string()
        }
    });

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(&log_level))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    tracing::info!("starting chatcore-server");

    let environment = std::env::var("APP_ENV").unwrap_or_else(|_| "development".to_string());
    let is_development = environment == "development";

    if std::env::var("DATABASE_URL").is_err() && !is_development {
        tracing::error!("DATABASE_URL is not set outside development; refusing to start");
        std::process::exit(1);
    }
    if std::env::var("JWT_SECRET").is_err() && !is_development {
        tracing::error!("JWT_SECRET is not set outside development; refusing to start");
        std::process::exit(1);
    }

    let metrics_recorder = metrics::MetricsRecorder::new();
    let metrics_handle = metrics_recorder.handle().clone();
    tracing::info!("metrics recorder installed");

    let db_pool = store::init_db(DbConfig::default()).await?;
    tracing::info!("database initialized and migrations applied");

    let tokens = TokenService::from_env().or_else(|e| {
        if is_development {
            tracing::warn!("JWT_SECRET missing, using a development-only fallback key");
            Ok::<TokenService, anyhow::Error>(TokenService::new(b"dev-only-insecure-key".to_vec()))
        } else {
            Err(e)
        }
    })?;

    let instance_id = std::env::var("INSTANCE_ID").unwrap_or_else(|_| uuid::Uuid::new_v4().to_string());

    let shutdown = CancellationToken::new();
    let pubsub: Arc<dyn PubSub> = if matches!(
        std::env::var("PUBSUB_BACKEND").as_deref(),
        Ok("distributed")
    ) {
        let distributed = Arc::new(DistributedPubSub::new(db_pool.clone(), instance_id.clone()));
        let worker = distributed.clone();
        let worker_shutdown = shutdown.clone();
        tokio::spawn(async move {
            worker.run_worker(worker_shutdown).await;
        });
        tracing::info!("distributed pubsub backend active");
        distributed
    } else {
        tracing::info!("in-memory pubsub backend active");
        Arc::new(MemoryPubSub::new(instance_id.clone()))
    };

    let hub = Hub::new(db_pool.clone(), pubsub.clone(), tokens.clone(), instance_id);
    let broadcaster = Broadcaster::new(hub.clone());
    let auth_middleware = AuthMiddleware::new();

    let app_state = AppState {
        store: db_pool.clone(),
        pubsub,
        hub,
        tokens,
        auth_middleware,
        broadcaster,
    };

    // Stale rate-limit bucket cleanup, mirroring the teacher's periodic
    // cleanup worker pattern.
    tokio::spawn(async move {
        let mut interval_timer = interval(Duration::from_secs(300));
        loop {
            interval_timer.tick().await;
            let max_age = Duration::from_secs(600);
            middleware::rate_limit::IP_LIMITER.cleanup_old_buckets(max_age).await;
            tracing::debug!("rate limiter cleanup completed");
        }
    });

    let metrics_router = if matches!(
        std::env::var("ENABLE_METRICS").as_deref(),
        Ok("1") | Ok("true") | Ok("TRUE") | Ok("yes") | Ok("YES")
    ) {
        Router::new()
            .route("/metrics", get(metrics::metrics_handler))
            .with_state(metrics_handle)
    } else {
        Router::new()
    };

    // Spec §6: every REST route requires a bearer token except auth and user
    // search, so `users/search` shares the auth router's unauthenticated,
    // per-IP-rate-limited layer instead of the authenticated routes below.
    let auth_router = Router::new()
        .route("/auth/register", post(rest::auth::register))
        .route("/auth/login", post(rest::auth::login))
        .route("/auth/refresh", post(rest::auth::refresh))
        .route("/auth/logout", post(rest::auth::logout))
        .route("/auth/logout-everywhere", post(rest::auth::logout_everywhere))
        .route("/users/search", get(rest::users::search_users))
        .layer(axum::middleware::from_fn(middleware::rate_limit::rate_limit_middleware));

    let app = Router::new()
        .route("/health", get(health::health))
        .route("/health/live", get(health::liveness))
        .route("/health/ready", get(health::readiness))
        .route("/ws", get(ws::upgrade))
        .merge(auth_router)
        .route(
            "/conversations",
            post(rest::conversations::create_conversation).get(rest::conversations::list_conversations),
        )
        .route(
            "/conversations/{id}",
            get(rest::conversations::get_conversation).patch(rest::conversations::patch_conversation),
        )
        .route("/conversations/{id}/members", post(rest::conversations::add_member))
        .route(
            "/conversations/{id}/members/{user_id}",
            axum::routing::delete(rest::conversations::remove_member),
        )
        .route("/conversations/{id}/archive", post(rest::conversations::archive_conversation))
        .route("/conversations/{id}/unarchive", post(rest::conversations::unarchive_conversation))
        .route("/conversations/{id}/search", get(rest::conversations::search_messages))
        .route(
            "/conversations/{id}/messages",
            get(rest::messages::list_messages).post(rest::messages::send_message),
        )
        .route("/conversations/{id}/read", post(rest::messages::mark_conversation_read))
        .route("/messages/search", get(rest::conversations::search_all_messages))
        .route("/messages/{id}", axum::routing::delete(rest::messages::delete_message))
        .route("/messages/{id}/star", post(rest::conversations::star_message))
        .route("/messages/{id}/unstar", post(rest::conversations::unstar_message))
        .route("/starred", get(rest::conversations::list_starred))
        .route("/blocks", post(rest::conversations::block_user))
        .route("/blocks/{user_id}", axum::routing::delete(rest::conversations::unblock_user))
        .route("/users/me", get(rest::users::me).patch(rest::users::update_profile))
        .merge(metrics_router)
        .layer(TraceLayer::new_for_http())
        .layer(axum::middleware::from_fn(middleware::logging::log_headers_middleware))
        .layer(axum::middleware::from_fn(metrics::track_request_metrics))
        .with_state(app_state);

    let port = std::env::var("SERVER_PORT")
        .unwrap_or_else(|_| "8080".to_string())
        .parse::<u16>()
        .unwrap_or(8080);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    tracing::info!(%addr, "server listening");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    shutdown.cancel();
    Ok(())
}
