//! Network front of the relay.
//!
//! Page agents and the viewer connect over `/ws` and exchange JSON
//! [`SignalEnvelope`](multiview_common::SignalEnvelope)s; the gateway maps
//! each connection onto the relay's routing roles.

pub mod client;
pub mod signal;

use std::sync::Arc;

use axum::{
    extract::{FromRef, State},
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use serde::Serialize;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;

use multiview_common::config::RelayConfig;
use multiview_relay::{Injector, LocalAgentHost, Relay, RelayHandle};

pub use client::GatewayLink;
pub use signal::ConnectionCounter;

#[derive(Clone)]
pub struct GatewayState {
    pub relay: RelayHandle,
    pub host: Arc<LocalAgentHost>,
    pub connections: ConnectionCounter,
}

impl GatewayState {
    /// Spawns the relay; must run inside a tokio runtime.
    pub fn new(config: RelayConfig, injector: Option<Injector>) -> Self {
        let host = Arc::new(match injector {
            Some(injector) => LocalAgentHost::with_injector(injector),
            None => LocalAgentHost::new(),
        });
        let relay = Relay::new(Arc::clone(&host), config).spawn();
        Self {
            relay,
            host,
            connections: ConnectionCounter::default(),
        }
    }
}

impl FromRef<GatewayState> for RelayHandle {
    fn from_ref(state: &GatewayState) -> Self {
        state.relay.clone()
    }
}

impl FromRef<GatewayState> for ConnectionCounter {
    fn from_ref(state: &GatewayState) -> Self {
        state.connections.clone()
    }
}

impl FromRef<GatewayState> for Arc<LocalAgentHost> {
    fn from_ref(state: &GatewayState) -> Self {
        state.host.clone()
    }
}

#[derive(Debug, Serialize)]
struct Health {
    status: &'static str,
    active_ws_connections: usize,
    bound_agents: usize,
}

async fn health(State(state): State<GatewayState>) -> impl IntoResponse {
    Json(Health {
        status: "ok",
        active_ws_connections: state.connections.get(),
        bound_agents: state.host.agent_count().await,
    })
}

pub fn router(state: GatewayState) -> Router {
    Router::new()
        .route("/", get(|| async { "Multiview Gateway Online" }))
        .route("/health", get(health))
        .route("/ws", get(signal::ws_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub async fn serve(listener: TcpListener, state: GatewayState) -> std::io::Result<()> {
    axum::serve(listener, router(state)).await
}
