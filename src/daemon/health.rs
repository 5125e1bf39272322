//! Local network info endpoint.

use axum::{extract::State, routing::get, Json, Router};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

/// VXLAN encapsulation overhead.
pub const VXLAN_OVERHEAD: u32 = 50;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkInfo {
    pub overlay_subnet: String,
    pub mtu: u32,
}

impl NetworkInfo {
    /// MTU left for overlay traffic on an underlay interface with `underlay_mtu`.
    pub fn new(overlay_subnet: impl Into<String>, underlay_mtu: u32) -> Self {
        Self {
            overlay_subnet: overlay_subnet.into(),
            mtu: underlay_mtu.saturating_sub(VXLAN_OVERHEAD),
        }
    }
}

async fn network_info(State(info): State<Arc<NetworkInfo>>) -> Json<NetworkInfo> {
    Json(info.as_ref().clone())
}

pub fn create_router(info: Arc<NetworkInfo>) -> Router {
    Router::new()
        .route("/", get(network_info))
        .route("/health", get(network_info))
        .with_state(info)
        .layer(TraceLayer::new_for_http())
}
