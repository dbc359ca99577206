//! Inbound HTTP endpoint.
//!
//! `POST /{prefix}` hands the decoded record and the caller's IP to the node
//! and writes back whatever single response the dispatcher settles on.
//! `GET /{prefix}/status` is a small operator view.

use crate::constants::rate_limit::UNKNOWN_CALLER;
use crate::node::SyncNode;
use crate::types::InboundRecord;
use axum::body::Bytes;
use axum::extract::{ConnectInfo, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

pub fn router(node: Arc<SyncNode>) -> Router {
    let events_path = format!("/{}", node.prefix());
    let status_path = format!("/{}/status", node.prefix());

    Router::new()
        .route(&events_path, post(receive_event))
        .route(&status_path, get(node_status))
        .with_state(node)
}

async fn receive_event(
    State(node): State<Arc<SyncNode>>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    body: Bytes,
) -> Response {
    let caller = connect_info
        .map(|ConnectInfo(addr)| caller_ip(addr))
        .unwrap_or_else(|| UNKNOWN_CALLER.to_string());

    // An unreadable body is treated like an empty one: no eventId
    let record = serde_json::from_slice::<InboundRecord>(&body).unwrap_or_else(|e| {
        debug!("Unparseable event body from {}: {}", caller, e);
        InboundRecord::default()
    });

    match node.receive(record, &caller).await {
        Some(value) => Json(value).into_response(),
        None => StatusCode::OK.into_response(),
    }
}

/// Rate-limit key for a connection. IPv4-mapped addresses from a dual-stack
/// listener are unmapped so one caller has one key.
fn caller_ip(addr: SocketAddr) -> String {
    addr.ip().to_canonical().to_string()
}

async fn node_status(State(node): State<Arc<SyncNode>>) -> impl IntoResponse {
    Json(node.status())
}

pub struct EventServer {
    listener: TcpListener,
    node: Arc<SyncNode>,
}

impl EventServer {
    pub async fn bind(addr: &str, node: Arc<SyncNode>) -> Result<Self, std::io::Error> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self { listener, node })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, std::io::Error> {
        self.listener.local_addr()
    }

    /// Serve until `shutdown` is cancelled.
    pub async fn run(self, shutdown: CancellationToken) -> Result<(), std::io::Error> {
        info!(
            "  ✅ Event endpoint listening on http://{}/{}",
            self.listener.local_addr()?,
            self.node.prefix()
        );

        let app = router(self.node).into_make_service_with_connect_info::<SocketAddr>();
        axum::serve(self.listener, app)
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await
    }
}
