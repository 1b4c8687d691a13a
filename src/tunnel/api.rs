//! HTTP surface of the tunnel registry.
//!
//! Whichever process owns the control plane runs this server; siblings
//! discover the ephemeral port through the strongbox and speak JSON over
//! loopback instead of sharing memory.

use std::net::{Ipv4Addr, SocketAddr};

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde_json::json;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::info;

use super::registry::{SharedRegistry, TunnelRegistryEntry};
use super::strongbox::{Strongbox, REGISTRY_PORT_KEY};
use crate::RemoteXpcError;

/// Builds the registry router.
pub fn router(registry: SharedRegistry) -> Router {
    Router::new()
        .route("/remotexpc/tunnels", get(list_tunnels))
        .route(
            "/remotexpc/tunnels/:udid",
            get(get_tunnel).put(put_tunnel),
        )
        .route("/remotexpc/tunnels/device/:device_id", get(get_by_device))
        .fallback(not_found)
        .with_state(registry)
}

async fn list_tunnels(State(registry): State<SharedRegistry>) -> Response {
    let registry = registry.read().await;
    Json(json!({
        "tunnels": registry.entries(),
        "metadata": registry.metadata(),
    }))
    .into_response()
}

async fn get_tunnel(
    State(registry): State<SharedRegistry>,
    Path(udid): Path<String>,
) -> Response {
    let registry = registry.read().await;
    match registry.get(&udid) {
        Some(entry) => Json(entry).into_response(),
        None => error_response(StatusCode::NOT_FOUND, "Tunnel not found"),
    }
}

async fn get_by_device(
    State(registry): State<SharedRegistry>,
    Path(device_id): Path<String>,
) -> Response {
    let Ok(device_id) = device_id.parse::<u32>() else {
        return error_response(StatusCode::BAD_REQUEST, "Invalid device ID");
    };
    let registry = registry.read().await;
    match registry.get_by_device_id(device_id) {
        Some(entry) => Json(entry).into_response(),
        None => error_response(StatusCode::NOT_FOUND, "Tunnel not found"),
    }
}

async fn put_tunnel(
    State(registry): State<SharedRegistry>,
    Path(udid): Path<String>,
    body: Bytes,
) -> Response {
    let entry: TunnelRegistryEntry = match serde_json::from_slice(&body) {
        Ok(entry) => entry,
        Err(_) => return error_response(StatusCode::BAD_REQUEST, "Invalid JSON"),
    };
    if entry.udid != udid {
        return error_response(StatusCode::BAD_REQUEST, "UDID mismatch");
    }

    let mut registry = registry.write().await;
    let stored = registry.upsert(entry);
    Json(json!({ "success": true, "tunnel": stored })).into_response()
}

async fn not_found() -> Response {
    error_response(StatusCode::NOT_FOUND, "Not found")
}

fn error_response(status: StatusCode, message: &str) -> Response {
    (status, Json(json!({ "error": message }))).into_response()
}

/// A running registry server bound to an ephemeral loopback port.
#[derive(Debug)]
pub struct TunnelRegistryServer {
    registry: SharedRegistry,
    local_addr: SocketAddr,
    strongbox: Strongbox,
    shutdown: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl TunnelRegistryServer {
    /// Binds the server, publishes its port in the strongbox and starts
    /// serving in the background.
    pub async fn start(
        registry: SharedRegistry,
        strongbox: Strongbox,
    ) -> Result<Self, RemoteXpcError> {
        let listener = tokio::net::TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await?;
        let local_addr = listener.local_addr()?;
        strongbox.put(REGISTRY_PORT_KEY, local_addr.port().to_string())?;
        info!("tunnel registry listening on {local_addr}");

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let app = router(registry.clone());
        let task = tokio::spawn(async move {
            let _ = axum::serve(listener, app)
                .with_graceful_shutdown(async {
                    let _ = shutdown_rx.await;
                })
                .await;
        });

        Ok(Self {
            registry,
            local_addr,
            strongbox,
            shutdown: Some(shutdown_tx),
            task: Some(task),
        })
    }

    pub fn registry(&self) -> &SharedRegistry {
        &self.registry
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn port(&self) -> u16 {
        self.local_addr.port()
    }

    /// Stops serving and withdraws the strongbox entry. Idempotent.
    pub async fn stop(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
        let _ = self.strongbox.remove(REGISTRY_PORT_KEY);
    }
}
