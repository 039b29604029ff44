use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// Lifecycle state of a trip as persisted in the trip store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type, ToSchema)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum TripStatus {
    Scheduled,
    Running,
    Completed,
    Cancelled,
}

impl TripStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TripStatus::Scheduled => "scheduled",
            TripStatus::Running => "running",
            TripStatus::Completed => "completed",
            TripStatus::Cancelled => "cancelled",
        }
    }
}

/// Travel direction along a route's stop sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type, ToSchema)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum Direction {
    Forward,
    Backward,
}

impl Direction {
    pub fn flipped(&self) -> Direction {
        match self {
            Direction::Forward => Direction::Backward,
            Direction::Backward => Direction::Forward,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Forward => "forward",
            Direction::Backward => "backward",
        }
    }
}

/// One scheduled/executed run of a bus along a route in one direction.
#[derive(Debug, Clone, Serialize, sqlx::FromRow, ToSchema)]
pub struct Trip {
    pub trip_id: i64,
    pub bus_id: i64,
    pub route_id: i64,
    pub direction: Direction,
    pub departure_time: DateTime<Utc>,
    pub arrival_time: Option<DateTime<Utc>>,
    pub status: TripStatus,
    /// Present only while the trip is running.
    pub current_stop_index: Option<i64>,
    /// For auto-generated return trips: the trip this one returns from.
    pub origin_trip_id: Option<i64>,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow, ToSchema)]
pub struct Route {
    pub route_id: i64,
    pub route_name: String,
}

/// A stop on a route, in route order.
#[derive(Debug, Clone, Serialize, sqlx::FromRow, ToSchema)]
pub struct RouteStop {
    pub stop_id: i64,
    pub stop_name: String,
    pub stop_order: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn direction_flips_both_ways() {
        assert_eq!(Direction::Forward.flipped(), Direction::Backward);
        assert_eq!(Direction::Backward.flipped(), Direction::Forward);
    }

    #[test]
    fn status_serializes_lowercase() {
        assert_eq!(
            serde_json::to_string(&TripStatus::Running).unwrap(),
            "\"running\""
        );
        assert_eq!(
            serde_json::to_string(&Direction::Backward).unwrap(),
            "\"backward\""
        );
    }
}
