use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;
use utoipa::ToSchema;

use crate::models::{Direction, Trip, TripStatus};

/// Live position/status record for one running trip.
///
/// Owned by the registry; every read hands out a copy so consumers iterating
/// a snapshot are never affected by concurrent ticks.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct TripSnapshot {
    pub trip_id: i64,
    pub route_id: i64,
    pub route_name: String,
    pub bus_id: i64,
    pub direction: Direction,
    pub current_stop_index: usize,
    pub current_stop_id: i64,
    pub current_stop_name: String,
    pub total_stops: usize,
    pub status: TripStatus,
    pub started_at: DateTime<Utc>,
}

/// Events broadcast to every connected real-time client.
///
/// Delivery is at-most-once and best-effort: no replay log, no acks. Clients
/// compensate by polling the active-trips REST snapshot. For a single trip
/// the emission order is strictly `trip_started`, N x `trip_position_update`,
/// then `trip_completed` or `trip_stopped`; across trips there is no ordering
/// guarantee.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TrackerEvent {
    TripStarted {
        trip_id: i64,
        route_id: i64,
        route_name: String,
        current_stop_index: usize,
        current_stop_name: String,
        total_stops: usize,
    },
    TripPositionUpdate {
        trip_id: i64,
        current_stop_index: usize,
        current_stop_id: i64,
        current_stop_name: String,
        total_stops: usize,
    },
    TripCompleted {
        trip_id: i64,
        trip: Option<Trip>,
    },
    TripStopped {
        trip_id: i64,
    },
    ReturnTripCreated {
        original_trip_id: i64,
        new_trip_id: i64,
        bus_id: i64,
        route_id: i64,
        direction: Direction,
        departure_time: DateTime<Utc>,
        trip: Option<Trip>,
    },
    /// A registry entry was evicted because the store no longer shows the
    /// trip as running (admin edit or external cancellation).
    TripRemoved {
        trip_id: i64,
    },
}

pub type EventSender = broadcast::Sender<TrackerEvent>;
