use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::State;
use axum::http::{HeaderValue, Method};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use tally_core::Registry;
use tally_settings::ServerSettings;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::api;
use crate::connection;
use crate::error::ServerError;

/// Server configuration.
#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub address: String,
    pub allowed_origins: Vec<String>,
    pub max_message_size: usize,
    pub send_queue_size: usize,
    pub heartbeat_interval: Duration,
    pub session_timeout: Duration,
    pub reap_interval: Duration,
    pub shutdown_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::from(&ServerSettings::default())
    }
}

impl From<&ServerSettings> for ServerConfig {
    fn from(settings: &ServerSettings) -> Self {
        Self {
            address: settings.address(),
            allowed_origins: settings.allowed_origins.clone(),
            max_message_size: settings.max_message_size,
            send_queue_size: settings.send_queue_size,
            heartbeat_interval: settings.heartbeat_interval(),
            session_timeout: settings.session_timeout(),
            reap_interval: settings.reap_interval(),
            shutdown_timeout: settings.shutdown_timeout(),
        }
    }
}

/// Shared application state passed to Axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<Registry>,
    pub config: Arc<ServerConfig>,
}

impl AppState {
    pub fn new(config: ServerConfig) -> Self {
        Self {
            registry: Arc::new(Registry::new()),
            config: Arc::new(config),
        }
    }
}

/// Build the Axum router with all routes.
pub fn build_router(state: AppState) -> Router {
    let cors = cors_layer(&state.config.allowed_origins);
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(api::health))
        .route("/api/sessions", get(api::list_sessions).post(api::create_session))
        .route("/api/sessions/{id}", get(api::get_session))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    if origins.iter().any(|o| o == "*") {
        return CorsLayer::permissive();
    }
    let allowed: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|origin| match HeaderValue::from_str(origin) {
            Ok(value) => Some(value),
            Err(_) => {
                warn!(origin = %origin, "ignoring invalid CORS origin");
                None
            }
        })
        .collect();
    CorsLayer::new()
        .allow_origin(AllowOrigin::list(allowed))
        .allow_methods([Method::GET, Method::POST])
        .allow_headers(Any)
}

/// Bind and start serving. Returns a handle to shut it down.
pub async fn start(config: ServerConfig) -> Result<ServerHandle, ServerError> {
    let state = AppState::new(config);
    let config = Arc::clone(&state.config);
    let registry = Arc::clone(&state.registry);

    let listener = tokio::net::TcpListener::bind(&config.address)
        .await
        .map_err(|source| ServerError::Bind {
            address: config.address.clone(),
            source,
        })?;
    let local_addr = listener.local_addr()?;

    let reaper = start_reaper_task(Arc::clone(&registry), config.reap_interval, config.session_timeout);

    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let router = build_router(state);
    let server = tokio::spawn(async move {
        let result = axum::serve(listener, router)
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.await;
            })
            .await;
        if let Err(e) = result {
            warn!(error = %e, "server stopped with error");
        }
    });

    info!(address = %local_addr, "tally server started");

    Ok(ServerHandle {
        local_addr,
        registry,
        shutdown_timeout: config.shutdown_timeout,
        shutdown_tx: Some(shutdown_tx),
        server,
        reaper,
    })
}

/// Handle returned by `start()`. Keeps background tasks alive.
pub struct ServerHandle {
    local_addr: SocketAddr,
    registry: Arc<Registry>,
    shutdown_timeout: Duration,
    shutdown_tx: Option<oneshot::Sender<()>>,
    server: JoinHandle<()>,
    reaper: JoinHandle<()>,
}

impl ServerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn port(&self) -> u16 {
        self.local_addr.port()
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Stop accepting connections and wait for in-flight requests, bounded
    /// by the configured shutdown timeout.
    pub async fn shutdown(mut self) {
        self.reaper.abort();
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        match tokio::time::timeout(self.shutdown_timeout, &mut self.server).await {
            Ok(_) => info!("server shut down"),
            Err(_) => {
                warn!(timeout_ms = self.shutdown_timeout.as_millis() as u64, "graceful shutdown timed out");
                self.server.abort();
            }
        }
    }
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.max_message_size(state.config.max_message_size)
        .on_upgrade(move |socket| connection::handle_socket(socket, state))
}

/// Periodically retire sessions that have been empty for `max_age`.
pub fn start_reaper_task(
    registry: Arc<Registry>,
    interval: Duration,
    max_age: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let _ = registry.reap_idle(max_age);
        }
    })
}
