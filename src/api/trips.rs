//! Admin trip-control endpoints.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{NaiveDate, NaiveTime, Timelike, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use super::error::{bad_request, ApiError};
use crate::models::{Direction, Trip};
use crate::store::{GenerationParams, GenerationSummary};
use crate::tracker::{BusTracker, TripSnapshot};

#[derive(Clone)]
pub struct TripsState {
    pub tracker: Arc<BusTracker>,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct StartTripRequest {
    /// Optional starting stop. Must be the route's first stop (forward run)
    /// or its last stop (backward run).
    pub starting_stop_id: Option<i64>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct StartTripResponse {
    pub success: bool,
    pub message: String,
    pub trip_id: i64,
    pub route_name: String,
    pub direction: Direction,
    pub total_stops: usize,
    pub starting_stop: String,
    pub ending_stop: String,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct StopTripResponse {
    pub success: bool,
    pub message: String,
}

/// Live snapshot plus a derived completion percentage, matching what the
/// admin dashboard renders.
#[derive(Debug, Serialize, ToSchema)]
pub struct ActiveTripView {
    #[serde(flatten)]
    pub snapshot: TripSnapshot,
    pub progress_percentage: f64,
}

impl From<TripSnapshot> for ActiveTripView {
    fn from(snapshot: TripSnapshot) -> Self {
        let progress_percentage = if snapshot.total_stops > 1 {
            (snapshot.current_stop_index as f64 / (snapshot.total_stops - 1) as f64 * 1000.0)
                .round()
                / 10.0
        } else {
            100.0
        };
        Self {
            snapshot,
            progress_percentage,
        }
    }
}

#[derive(Debug, Serialize, ToSchema)]
pub struct ActiveTripsResponse {
    pub success: bool,
    pub active_trips: Vec<ActiveTripView>,
    pub count: usize,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct TripStatusResponse {
    pub success: bool,
    /// Live snapshot, present while the trip is actively tracked
    #[serde(skip_serializing_if = "Option::is_none")]
    pub active: Option<ActiveTripView>,
    /// Stored trip record, present when the trip exists but is not live
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trip: Option<Trip>,
}

fn default_daily_start() -> String {
    "07:00:00".to_string()
}

fn default_daily_end() -> String {
    "21:00:00".to_string()
}

fn default_departure_gap() -> u32 {
    30
}

fn default_stop_gap() -> u32 {
    15
}

fn default_final_wait() -> u32 {
    30
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct GenerateDailyRequest {
    /// Day to generate for; defaults to today (UTC)
    pub date: Option<NaiveDate>,
    /// First departure of the day, HH:MM:SS
    #[serde(default = "default_daily_start")]
    pub daily_start_time: String,
    /// No departures at or after this time, HH:MM:SS
    #[serde(default = "default_daily_end")]
    pub daily_end_time: String,
    #[serde(default = "default_departure_gap")]
    pub seconds_between_bus_departures: u32,
    #[serde(default = "default_stop_gap")]
    pub seconds_between_each_stop: u32,
    #[serde(default = "default_final_wait")]
    pub seconds_waiting_at_final_stop: u32,
    /// Restrict generation to a single route
    pub route_id: Option<i64>,
    /// Upper bound on the number of routes processed
    pub max_routes: Option<u32>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct GenerateDailyResponse {
    pub success: bool,
    pub trips_created: u32,
    pub routes_processed: u32,
    pub routes_skipped: u32,
    pub summary: String,
    pub parameters_used: serde_json::Value,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct AutoReturnConfigRequest {
    pub auto_return_enabled: Option<bool>,
    pub return_buffer_seconds: Option<u64>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct AutoReturnConfigResponse {
    pub success: bool,
    pub auto_return_enabled: bool,
    pub return_buffer_seconds: u64,
}

/// Start a scheduled trip
#[utoipa::path(
    post,
    path = "/admin/trips/{trip_id}/start",
    params(("trip_id" = i64, Path, description = "Trip to start")),
    request_body = StartTripRequest,
    responses(
        (status = 200, description = "Trip started", body = StartTripResponse),
        (status = 400, description = "Trip is not startable", body = super::ErrorResponse),
        (status = 404, description = "Trip not found", body = super::ErrorResponse),
        (status = 409, description = "Trip already tracked", body = super::ErrorResponse)
    ),
    tag = "trips"
)]
pub async fn start_trip(
    State(state): State<TripsState>,
    Path(trip_id): Path<i64>,
    body: Option<Json<StartTripRequest>>,
) -> Result<Json<StartTripResponse>, ApiError> {
    let starting_stop_id = body.and_then(|Json(req)| req.starting_stop_id);
    let started = state.tracker.start_trip(trip_id, starting_stop_id).await?;
    Ok(Json(StartTripResponse {
        success: true,
        message: format!(
            "Trip {} started on {} ({})",
            started.trip_id,
            started.route_name,
            started.direction.as_str()
        ),
        trip_id: started.trip_id,
        route_name: started.route_name,
        direction: started.direction,
        total_stops: started.total_stops,
        starting_stop: started.starting_stop,
        ending_stop: started.ending_stop,
    }))
}

/// Stop a running trip
#[utoipa::path(
    post,
    path = "/admin/trips/{trip_id}/stop",
    params(("trip_id" = i64, Path, description = "Trip to stop")),
    responses(
        (status = 200, description = "Trip stopped", body = StopTripResponse),
        (status = 404, description = "Trip is not running", body = super::ErrorResponse)
    ),
    tag = "trips"
)]
pub async fn stop_trip(
    State(state): State<TripsState>,
    Path(trip_id): Path<i64>,
) -> Result<Json<StopTripResponse>, ApiError> {
    state.tracker.stop_trip(trip_id).await?;
    Ok(Json(StopTripResponse {
        success: true,
        message: format!("Trip {} stopped", trip_id),
    }))
}

/// Current status of one trip
#[utoipa::path(
    get,
    path = "/admin/trips/{trip_id}/status",
    params(("trip_id" = i64, Path, description = "Trip to inspect")),
    responses(
        (status = 200, description = "Trip status", body = TripStatusResponse),
        (status = 404, description = "Trip not found", body = super::ErrorResponse)
    ),
    tag = "trips"
)]
pub async fn trip_status(
    State(state): State<TripsState>,
    Path(trip_id): Path<i64>,
) -> Result<Json<TripStatusResponse>, ApiError> {
    if let Some(snapshot) = state.tracker.trip_snapshot(trip_id).await {
        return Ok(Json(TripStatusResponse {
            success: true,
            active: Some(snapshot.into()),
            trip: None,
        }));
    }
    // Not live; fall back to the stored record so a just-started or
    // just-finished trip still resolves.
    let trip = state
        .tracker
        .trip_from_store(trip_id)
        .await?
        .ok_or(crate::tracker::TrackerError::NotFound(trip_id))?;
    Ok(Json(TripStatusResponse {
        success: true,
        active: None,
        trip: Some(trip),
    }))
}

/// All currently running trips
#[utoipa::path(
    get,
    path = "/admin/trips/active",
    responses(
        (status = 200, description = "Active trip snapshots", body = ActiveTripsResponse)
    ),
    tag = "trips"
)]
pub async fn active_trips(State(state): State<TripsState>) -> Json<ActiveTripsResponse> {
    // Reconcile first so the response reflects the store even right after a
    // restart or an external cancellation.
    state.tracker.reconcile().await;
    let active_trips: Vec<ActiveTripView> = state
        .tracker
        .active_trips()
        .await
        .into_iter()
        .map(ActiveTripView::from)
        .collect();
    let count = active_trips.len();
    Json(ActiveTripsResponse {
        success: true,
        active_trips,
        count,
    })
}

/// Generate a day of scheduled trips for every route
#[utoipa::path(
    post,
    path = "/admin/trips/generate-daily",
    request_body = GenerateDailyRequest,
    responses(
        (status = 200, description = "Generation summary", body = GenerateDailyResponse),
        (status = 400, description = "Invalid parameters", body = super::ErrorResponse)
    ),
    tag = "trips"
)]
pub async fn generate_daily(
    State(state): State<TripsState>,
    Json(req): Json<GenerateDailyRequest>,
) -> Response {
    let params = match validate_generation_request(&req) {
        Ok(params) => params,
        Err(message) => return bad_request(message),
    };

    let summary = match state.tracker.store().generate_daily_trips(&params).await {
        Ok(summary) => summary,
        Err(e) => return ApiError::from(e).into_response(),
    };
    tracing::info!(
        day = %params.day,
        trips_created = summary.trips_created,
        routes_processed = summary.routes_processed,
        routes_skipped = summary.routes_skipped,
        "daily trip generation finished"
    );

    Json(build_generation_response(&req, &params, summary)).into_response()
}

fn validate_generation_request(req: &GenerateDailyRequest) -> Result<GenerationParams, String> {
    let start = NaiveTime::parse_from_str(&req.daily_start_time, "%H:%M:%S")
        .map_err(|_| "daily_start_time must be in HH:MM:SS format (e.g., '07:00:00')")?;
    let end = NaiveTime::parse_from_str(&req.daily_end_time, "%H:%M:%S")
        .map_err(|_| "daily_end_time must be in HH:MM:SS format (e.g., '21:00:00')")?;
    if start >= end {
        return Err("daily_start_time must be before daily_end_time".into());
    }

    if req.seconds_between_bus_departures < 1 {
        return Err("seconds_between_bus_departures must be at least 1 second".into());
    }
    if req.seconds_between_bus_departures > 3600 {
        return Err("seconds_between_bus_departures must not exceed 3600 seconds (1 hour)".into());
    }
    if req.seconds_between_each_stop < 5 {
        return Err("seconds_between_each_stop must be at least 5 seconds".into());
    }
    if req.seconds_between_each_stop > 300 {
        return Err("seconds_between_each_stop must not exceed 300 seconds (5 minutes)".into());
    }
    if req.seconds_waiting_at_final_stop > 600 {
        return Err("seconds_waiting_at_final_stop must not exceed 600 seconds (10 minutes)".into());
    }
    if let Some(route_id) = req.route_id {
        if route_id < 1 {
            return Err("route_id must be a positive integer".into());
        }
    }
    if let Some(max_routes) = req.max_routes {
        if max_routes < 1 {
            return Err("max_routes must be at least 1".into());
        }
        if max_routes > 50 {
            return Err("max_routes must not exceed 50".into());
        }
    }

    Ok(GenerationParams {
        day: req.date.unwrap_or_else(|| Utc::now().date_naive()),
        window_start_secs: start.num_seconds_from_midnight(),
        window_end_secs: end.num_seconds_from_midnight(),
        seconds_between_bus_departures: req.seconds_between_bus_departures,
        seconds_between_each_stop: req.seconds_between_each_stop,
        seconds_waiting_at_final_stop: req.seconds_waiting_at_final_stop,
        route_id: req.route_id,
        max_routes: req.max_routes,
    })
}

fn build_generation_response(
    req: &GenerateDailyRequest,
    params: &GenerationParams,
    summary: GenerationSummary,
) -> GenerateDailyResponse {
    GenerateDailyResponse {
        success: true,
        trips_created: summary.trips_created,
        routes_processed: summary.routes_processed,
        routes_skipped: summary.routes_skipped,
        summary: format!(
            "Created {} trips across {} routes ({} skipped) for {}",
            summary.trips_created, summary.routes_processed, summary.routes_skipped, params.day
        ),
        parameters_used: serde_json::json!({
            "date": params.day,
            "daily_start_time": req.daily_start_time,
            "daily_end_time": req.daily_end_time,
            "seconds_between_bus_departures": req.seconds_between_bus_departures,
            "seconds_between_each_stop": req.seconds_between_each_stop,
            "seconds_waiting_at_final_stop": req.seconds_waiting_at_final_stop,
            "route_id": req.route_id,
            "max_routes": req.max_routes,
        }),
    }
}

/// Read the auto-return configuration
#[utoipa::path(
    get,
    path = "/admin/trips/auto-return/config",
    responses(
        (status = 200, description = "Current configuration", body = AutoReturnConfigResponse)
    ),
    tag = "trips"
)]
pub async fn get_auto_return_config(
    State(state): State<TripsState>,
) -> Json<AutoReturnConfigResponse> {
    let cfg = state.tracker.auto_return().await;
    Json(AutoReturnConfigResponse {
        success: true,
        auto_return_enabled: cfg.enabled,
        return_buffer_seconds: cfg.buffer.as_secs(),
    })
}

/// Update the auto-return configuration
#[utoipa::path(
    put,
    path = "/admin/trips/auto-return/config",
    request_body = AutoReturnConfigRequest,
    responses(
        (status = 200, description = "Updated configuration", body = AutoReturnConfigResponse),
        (status = 400, description = "Invalid configuration", body = super::ErrorResponse)
    ),
    tag = "trips"
)]
pub async fn update_auto_return_config(
    State(state): State<TripsState>,
    Json(req): Json<AutoReturnConfigRequest>,
) -> Response {
    if let Some(buffer) = req.return_buffer_seconds {
        if buffer > 3600 {
            return bad_request("return_buffer_seconds must be between 0 and 3600");
        }
    }
    state
        .tracker
        .configure_auto_return(
            req.auto_return_enabled,
            req.return_buffer_seconds
                .map(std::time::Duration::from_secs),
        )
        .await;
    let cfg = state.tracker.auto_return().await;
    Json(AutoReturnConfigResponse {
        success: true,
        auto_return_enabled: cfg.enabled,
        return_buffer_seconds: cfg.buffer.as_secs(),
    })
    .into_response()
}

pub fn router(tracker: Arc<BusTracker>) -> Router {
    let state = TripsState { tracker };
    Router::new()
        .route("/{trip_id}/start", post(start_trip))
        .route("/{trip_id}/stop", post(stop_trip))
        .route("/{trip_id}/status", get(trip_status))
        .route("/active", get(active_trips))
        .route("/generate-daily", post(generate_daily))
        .route(
            "/auto-return/config",
            get(get_auto_return_config).put(update_auto_return_config),
        )
        .with_state(state)
}
