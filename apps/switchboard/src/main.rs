use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use axum::Router;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use switchboard::auth::{AuthService, HttpAuthService, StaticAuthService};
use switchboard::bus::{LocalBus, MessageBus};
use switchboard::config::Config;
use switchboard::AppState;

#[tokio::main]
async fn main() {
    // Load .env file (silently skip if missing; env vars may be set externally)
    if dotenvy::dotenv().is_err() {
        let env_path = Path::new(env!("CARGO_MANIFEST_DIR")).join(".env");
        let _ = dotenvy::from_path(env_path);
    }

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env();
    let port = config.port;

    let auth: Arc<dyn AuthService> = match config.auth_url.as_deref() {
        Some(url) => {
            tracing::info!(auth_url = %url, "validating sessions against auth service");
            Arc::new(HttpAuthService::new(url, config.auth_cache_ttl))
        }
        None => {
            let sessions = StaticAuthService::from_list(&config.static_sessions);
            tracing::info!(sessions = sessions.len(), "using static session table");
            Arc::new(sessions)
        }
    };

    // In-process bus. Backends embedding the library subscribe to it directly;
    // out-of-process producers use the publish route.
    let bus: Arc<dyn MessageBus> = Arc::new(LocalBus::new());

    tracing::info!(
        transports = ?config.transports,
        grace_secs = config.grace_period.as_secs(),
        no_route_policy = ?config.no_route_policy,
        "switchboard configured"
    );

    let state = AppState::new(config, auth, bus);
    let background = state.spawn_background_tasks();

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = Router::new()
        .merge(switchboard::routes::router())
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    tracing::info!(%addr, "switchboard listening");

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .expect("failed to bind");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("server error");

    for task in background {
        task.abort();
    }
    tracing::info!("switchboard stopped");
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(?e, "failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown requested");
}
