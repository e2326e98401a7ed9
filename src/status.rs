//! ==============================================================================
//! status.rs - local diagnostics api
//! ==============================================================================
//!
//! purpose:
//!     read-only json view of the gateway for a technician on the local
//!     network. nothing here can change state.
//!
//! routes:
//!     GET /api/nodes       node table snapshot
//!     GET /api/subsystems  lifecycle state of each subsystem
//!     GET /api/radio       rf front-end holder and refused acquisitions
//!     GET /api/ingress     accepted / dropped mesh messages
//!
//! ==============================================================================

use anyhow::Result;
use axum::{extract::State, response::Json, routing::get, Router};
use serde::Serialize;
use std::sync::Arc;
use tower_http::cors::CorsLayer;

use crate::ingress::{IngressStats, MeshIngress};
use crate::manager::SubsystemManager;
use crate::mesh::MeshStack;
use crate::node_table::{NodeEntry, SharedNodeTable};
use crate::radio::{Radio, RadioArbiter};
use crate::sensors::SensorBank;
use crate::subsystem::{SubsystemRecord, SubsystemStatus};
use crate::wifi::WifiDriver;

/// handles the api reads from; cheap to clone
#[derive(Clone)]
pub struct StatusState {
    nodes: SharedNodeTable,
    records: Vec<Arc<SubsystemRecord>>,
    arbiter: RadioArbiter,
    ingress: Arc<MeshIngress>,
}

impl StatusState {
    pub fn from_manager<M: MeshStack, W: WifiDriver, S: SensorBank>(manager: &SubsystemManager<M, W, S>) -> Self {
        Self {
            nodes: manager.shared.nodes.clone(),
            records: manager.records(),
            arbiter: manager.shared.arbiter.clone(),
            ingress: manager.ingress.clone(),
        }
    }
}

#[derive(Serialize)]
pub struct RadioStatus {
    pub holder: Option<Radio>,
    pub grants: u64,
    pub violations: u64,
}

pub fn router(state: StatusState) -> Router {
    Router::new()
        .route("/api/nodes", get(nodes_handler))
        .route("/api/subsystems", get(subsystems_handler))
        .route("/api/radio", get(radio_handler))
        .route("/api/ingress", get(ingress_handler))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

pub async fn run_server(state: StatusState, bind: &str) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(bind).await?;
    tracing::info!(addr = %listener.local_addr()?, "diagnostics api listening");
    axum::serve(listener, router(state)).await?;
    Ok(())
}

async fn nodes_handler(State(state): State<StatusState>) -> Json<Vec<NodeEntry>> {
    Json(state.nodes.snapshot().await)
}

async fn subsystems_handler(State(state): State<StatusState>) -> Json<Vec<SubsystemStatus>> {
    Json(state.records.iter().map(|r| r.status()).collect())
}

async fn radio_handler(State(state): State<StatusState>) -> Json<RadioStatus> {
    Json(RadioStatus {
        holder: state.arbiter.holder(),
        grants: state.arbiter.grants(),
        violations: state.arbiter.violations(),
    })
}

async fn ingress_handler(State(state): State<StatusState>) -> Json<IngressStats> {
    Json(state.ingress.stats())
}
