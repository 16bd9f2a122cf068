//! Switchboard - message-routing core for a multi-agent chat server
//!
//! Accepts user messages over sync, SSE, and socket transports, persists
//! them, fans them out on an in-process bus to agent workers, and streams
//! agent responses back to clients.

mod api;
mod bus;
mod central;
mod config;
mod connector;
mod db;
mod error;
mod jobs;
mod messages;
mod runtime;
mod sessions;
mod socket;
mod title;
mod transport;
mod validate;

use api::{AppState, RateLimiters};
use bus::MessageBus;
use central::CentralClient;
use config::Config;
use connector::AgentConnector;
use db::Store;
use jobs::JobManager;
use messages::MessageService;
use runtime::{EchoRuntime, RuntimeRegistry};
use sessions::SessionManager;
use socket::{SocketHub, SocketLogLayer};

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = Arc::new(Config::from_env());

    // The hub exists before logging so the log-stream layer can feed it.
    let hub = Arc::new(SocketHub::new());
    let (log_layer, _log_forwarder) = SocketLogLayer::new(hub.clone());

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "switchboard=info,tower_http=warn".into()),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_current_span(false)
                .with_span_list(false),
        )
        .with(log_layer)
        .init();

    // Ensure the database directory exists
    if let Some(parent) = PathBuf::from(&config.db_path).parent() {
        std::fs::create_dir_all(parent)?;
    }

    tracing::info!(path = %config.db_path, "opening store");
    let store = Store::open(&config.db_path)?;

    // Bootstrap the current message server. A configured UUID wins; any
    // other configured value is looked up as a source id; the nil id is the
    // conventional default.
    let server = match config.server_id.as_deref() {
        Some(raw) => match Uuid::try_parse(raw) {
            Ok(id) => store.create_server(Some(id), "Default Server", "bootstrap", None, None)?,
            Err(_) => match store.get_server_by_source_id(raw)? {
                Some(existing) => existing,
                None => store.create_server(
                    Some(Uuid::nil()),
                    "Default Server",
                    "bootstrap",
                    Some(raw),
                    None,
                )?,
            },
        },
        None => store.create_server(Some(Uuid::nil()), "Default Server", "bootstrap", None, None)?,
    };
    tracing::info!(server_id = %server.id, "current message server ready");

    let bus = Arc::new(MessageBus::new());
    hub.attach_bus(&bus).await;

    let service = Arc::new(MessageService::new(
        store.clone(),
        bus.clone(),
        hub.clone(),
        server.id,
    ));

    // Agent workers. The default wiring runs a single echo agent; real
    // deployments register their own runtimes here.
    let registry = Arc::new(RuntimeRegistry::new());
    let agent_id = Uuid::new_v4();
    let echo = Arc::new(EchoRuntime::new(agent_id, "echo"));
    registry.register(echo.clone()).await;
    store.add_agent_to_server(server.id, agent_id)?;
    tracing::info!(agent_id = %agent_id, agent_name = "echo", "default agent registered");

    let central = Arc::new(CentralClient::new(
        &config.central_url,
        config.auth_token.clone(),
    )?);
    let echo_connector = AgentConnector::new(echo, store.clone(), bus.clone(), central);
    echo_connector.start().await;

    let sessions = Arc::new(SessionManager::new(
        service.clone(),
        registry.clone(),
        config.session,
    ));
    sessions.start();

    let jobs = JobManager::new(service.clone(), bus.clone(), registry.clone());
    jobs.start();

    let state = AppState {
        config: config.clone(),
        service,
        sessions: sessions.clone(),
        jobs: jobs.clone(),
        hub: hub.clone(),
        bus: bus.clone(),
        registry,
        rate_limits: Arc::new(RateLimiters::new()),
    };

    let cors = match &config.cors_origin {
        Some(origin) => CorsLayer::new()
            .allow_origin(origin.parse::<axum::http::HeaderValue>()?)
            .allow_methods(Any)
            .allow_headers(Any),
        None => CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any),
    };

    let app = api::create_router(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http());

    let addr = SocketAddr::from((config.host, config.port));
    tracing::info!(%addr, "switchboard listening");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    // Signal received: run every cleanup exactly once.
    tracing::info!("shutting down");
    sessions.cleanup(config.clear_sessions_on_shutdown);
    jobs.cleanup().await;
    echo_connector.cleanup().await;
    hub.cleanup(&bus).await;
    bus.clear().await;

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                tracing::error!(error = %err, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
}
