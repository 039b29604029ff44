use std::sync::Arc;

use axum::{extract::State, routing::get, Json, Router};
use serde::Serialize;
use utoipa::ToSchema;

use crate::tracker::BusTracker;

#[derive(Clone)]
pub struct HealthState {
    pub tracker: Arc<BusTracker>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct HealthResponse {
    /// Whether the service is running
    pub healthy: bool,
    /// Number of routes in the database
    pub route_count: i64,
    /// Number of stops in the database
    pub stop_count: i64,
    /// Number of buses in the database
    pub bus_count: i64,
    /// Number of trips in the database, any status
    pub trip_count: i64,
    /// Number of currently simulated trips
    pub active_trip_count: usize,
}

/// Health check endpoint
#[utoipa::path(
    get,
    path = "/health",
    responses(
        (status = 200, description = "Service health status", body = HealthResponse)
    ),
    tag = "health"
)]
pub async fn health_check(State(state): State<HealthState>) -> Json<HealthResponse> {
    let pool = state.tracker.store().pool();
    let route_count = count(pool, "routes").await;
    let stop_count = count(pool, "stops").await;
    let bus_count = count(pool, "buses").await;
    let trip_count = count(pool, "trips").await;
    let active_trip_count = state.tracker.active_trips().await.len();

    Json(HealthResponse {
        healthy: true,
        route_count,
        stop_count,
        bus_count,
        trip_count,
        active_trip_count,
    })
}

async fn count(pool: &sqlx::SqlitePool, table: &str) -> i64 {
    // Table names are fixed strings from this module, never user input.
    sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {table}"))
        .fetch_one(pool)
        .await
        .unwrap_or(0)
}

pub fn router(tracker: Arc<BusTracker>) -> Router {
    let state = HealthState { tracker };
    Router::new()
        .route("/", get(health_check))
        .with_state(state)
}
