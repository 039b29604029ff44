//! Process-wide map of trip_id -> live trip state.
//!
//! The registry is the only shared mutable structure in the tracker; all
//! mutation goes through `register`/`update`/`remove`/`cancel`, which are
//! safe under concurrent access from per-trip runner tasks and request
//! handlers.

use std::collections::{HashMap, HashSet};
use tokio::sync::RwLock;
use tokio::task::AbortHandle;

use super::error::TrackerError;
use super::events::TripSnapshot;

struct ActiveTrip {
    snapshot: TripSnapshot,
    /// Abort handle for the runner task; set just after spawn.
    abort: Option<AbortHandle>,
}

#[derive(Default)]
pub struct ActiveTripRegistry {
    trips: RwLock<HashMap<i64, ActiveTrip>>,
}

impl ActiveTripRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a newly started trip. Enforces at most one live entry per
    /// trip_id, and at most one running trip per bus.
    pub async fn register(&self, snapshot: TripSnapshot) -> Result<(), TrackerError> {
        let mut trips = self.trips.write().await;
        if trips.contains_key(&snapshot.trip_id) {
            return Err(TrackerError::Conflict(snapshot.trip_id));
        }
        if let Some(other) = trips.values().find(|t| t.snapshot.bus_id == snapshot.bus_id) {
            return Err(TrackerError::InvalidState(format!(
                "Bus {} is already driving trip {}",
                snapshot.bus_id, other.snapshot.trip_id
            )));
        }
        trips.insert(snapshot.trip_id, ActiveTrip { snapshot, abort: None });
        Ok(())
    }

    pub async fn set_abort_handle(&self, trip_id: i64, handle: AbortHandle) {
        if let Some(trip) = self.trips.write().await.get_mut(&trip_id) {
            trip.abort = Some(handle);
        }
    }

    /// Apply a mutation to a live snapshot, returning the updated copy.
    /// Returns None if the trip is not registered; a stale timer firing after
    /// `cancel` must not resurrect an entry.
    pub async fn update<F>(&self, trip_id: i64, mutate: F) -> Option<TripSnapshot>
    where
        F: FnOnce(&mut TripSnapshot),
    {
        let mut trips = self.trips.write().await;
        let trip = trips.get_mut(&trip_id)?;
        mutate(&mut trip.snapshot);
        Some(trip.snapshot.clone())
    }

    /// Remove an entry without touching its runner task. Used by the runner
    /// itself on completion.
    pub async fn remove(&self, trip_id: i64) -> Option<TripSnapshot> {
        self.trips
            .write()
            .await
            .remove(&trip_id)
            .map(|t| t.snapshot)
    }

    /// Cancel-then-remove: aborts the runner task and removes the entry
    /// inside one write-lock critical section, so a tick already in flight
    /// either completed before this call or finds the entry gone.
    pub async fn cancel(&self, trip_id: i64) -> Option<TripSnapshot> {
        let mut trips = self.trips.write().await;
        let trip = trips.remove(&trip_id)?;
        if let Some(abort) = &trip.abort {
            abort.abort();
        }
        Some(trip.snapshot)
    }

    pub async fn snapshot(&self, trip_id: i64) -> Option<TripSnapshot> {
        self.trips
            .read()
            .await
            .get(&trip_id)
            .map(|t| t.snapshot.clone())
    }

    /// Point-in-time copy of all live entries, ordered by trip_id.
    pub async fn snapshot_all(&self) -> Vec<TripSnapshot> {
        let trips = self.trips.read().await;
        let mut all: Vec<TripSnapshot> = trips.values().map(|t| t.snapshot.clone()).collect();
        all.sort_by_key(|s| s.trip_id);
        all
    }

    pub async fn trip_ids(&self) -> HashSet<i64> {
        self.trips.read().await.keys().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Direction, TripStatus};
    use chrono::Utc;

    fn snapshot(trip_id: i64, bus_id: i64) -> TripSnapshot {
        TripSnapshot {
            trip_id,
            route_id: 1,
            route_name: "Downtown Express".into(),
            bus_id,
            direction: Direction::Forward,
            current_stop_index: 0,
            current_stop_id: 1,
            current_stop_name: "Central Station".into(),
            total_stops: 3,
            status: TripStatus::Running,
            started_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn duplicate_trip_registration_conflicts() {
        let registry = ActiveTripRegistry::new();
        registry.register(snapshot(1, 1)).await.unwrap();
        let err = registry.register(snapshot(1, 2)).await.unwrap_err();
        assert!(matches!(err, TrackerError::Conflict(1)));
    }

    #[tokio::test]
    async fn one_running_trip_per_bus() {
        let registry = ActiveTripRegistry::new();
        registry.register(snapshot(1, 7)).await.unwrap();
        let err = registry.register(snapshot(2, 7)).await.unwrap_err();
        assert!(matches!(err, TrackerError::InvalidState(_)));
        // A different bus is fine.
        registry.register(snapshot(3, 8)).await.unwrap();
    }

    #[tokio::test]
    async fn update_on_absent_trip_is_a_noop() {
        let registry = ActiveTripRegistry::new();
        let result = registry.update(42, |s| s.current_stop_index = 9).await;
        assert!(result.is_none());
        assert!(registry.snapshot_all().await.is_empty());
    }

    #[tokio::test]
    async fn snapshots_are_copies() {
        let registry = ActiveTripRegistry::new();
        registry.register(snapshot(1, 1)).await.unwrap();
        let before = registry.snapshot(1).await.unwrap();

        registry.update(1, |s| s.current_stop_index = 2).await.unwrap();

        // The copy handed out earlier is unaffected by the concurrent tick.
        assert_eq!(before.current_stop_index, 0);
        assert_eq!(registry.snapshot(1).await.unwrap().current_stop_index, 2);
    }

    #[tokio::test]
    async fn cancel_removes_entry() {
        let registry = ActiveTripRegistry::new();
        registry.register(snapshot(1, 1)).await.unwrap();
        assert!(registry.cancel(1).await.is_some());
        assert!(registry.cancel(1).await.is_none());
        assert!(registry.trip_ids().await.is_empty());
    }
}
