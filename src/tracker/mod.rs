//! Real-time trip position simulator.
//!
//! This module owns everything live: the per-trip runner tasks that advance
//! buses stop by stop, the registry of currently running trips, the
//! return-trip generator, and the broadcast channel the WebSocket layer fans
//! events out from. Durable state lives in [`TripStore`]; a background
//! scheduler keeps the two in sync and auto-starts trips whose departure time
//! has passed.

mod error;
mod events;
mod registry;
mod return_trip;
mod runner;

pub use error::TrackerError;
pub use events::{EventSender, TrackerEvent, TripSnapshot};
pub use registry::ActiveTripRegistry;

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, info, warn};

use crate::config::SimulatorConfig;
use crate::models::{Direction, RouteStop, Trip, TripStatus};
use crate::store::TripStore;

/// Simulator timing, injected so tests can run at millisecond scale.
#[derive(Debug, Clone, Copy)]
pub struct Timing {
    pub move_interval: Duration,
    pub final_stop_dwell: Duration,
    pub scheduler_interval: Duration,
}

impl From<&SimulatorConfig> for Timing {
    fn from(cfg: &SimulatorConfig) -> Self {
        Self {
            move_interval: cfg.move_interval(),
            final_stop_dwell: cfg.final_stop_dwell(),
            scheduler_interval: cfg.scheduler_interval(),
        }
    }
}

/// Runtime-adjustable auto-return behaviour.
#[derive(Debug, Clone, Copy)]
pub struct AutoReturnConfig {
    pub enabled: bool,
    pub buffer: Duration,
}

impl From<&SimulatorConfig> for AutoReturnConfig {
    fn from(cfg: &SimulatorConfig) -> Self {
        Self {
            enabled: cfg.auto_return_enabled,
            buffer: cfg.return_buffer(),
        }
    }
}

/// Shared state between the tracker facade, runner tasks and the return-trip
/// generator.
pub(crate) struct TrackerInner {
    pub(crate) store: TripStore,
    pub(crate) registry: ActiveTripRegistry,
    pub(crate) events: EventSender,
    pub(crate) timing: Timing,
    pub(crate) auto_return: RwLock<AutoReturnConfig>,
}

/// Result of a successful `start_trip`, echoed back to the admin client.
#[derive(Debug)]
pub struct StartedTrip {
    pub trip_id: i64,
    pub route_name: String,
    pub direction: Direction,
    pub total_stops: usize,
    pub starting_stop: String,
    pub ending_stop: String,
}

pub struct BusTracker {
    inner: Arc<TrackerInner>,
}

impl BusTracker {
    pub fn new(store: TripStore, config: &SimulatorConfig) -> Self {
        Self::with_timing(store, Timing::from(config), AutoReturnConfig::from(config))
    }

    pub fn with_timing(store: TripStore, timing: Timing, auto_return: AutoReturnConfig) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            inner: Arc::new(TrackerInner {
                store,
                registry: ActiveTripRegistry::new(),
                events,
                timing,
                auto_return: RwLock::new(auto_return),
            }),
        }
    }

    pub fn store(&self) -> &TripStore {
        &self.inner.store
    }

    /// Subscribe to the lifecycle event broadcast. Each WebSocket connection
    /// holds its own receiver; lagged receivers skip ahead.
    pub fn subscribe(&self) -> broadcast::Receiver<TrackerEvent> {
        self.inner.events.subscribe()
    }

    pub async fn auto_return(&self) -> AutoReturnConfig {
        *self.inner.auto_return.read().await
    }

    pub async fn configure_auto_return(&self, enabled: Option<bool>, buffer: Option<Duration>) {
        let mut cfg = self.inner.auto_return.write().await;
        if let Some(enabled) = enabled {
            cfg.enabled = enabled;
        }
        if let Some(buffer) = buffer {
            cfg.buffer = buffer;
        }
        info!(
            enabled = cfg.enabled,
            buffer_seconds = cfg.buffer.as_secs(),
            "auto-return configuration updated"
        );
    }

    /// Start a scheduled trip.
    ///
    /// `starting_stop_id` optionally overrides direction the way the admin UI
    /// does: the route's first stop means forward, its last stop backward.
    pub async fn start_trip(
        &self,
        trip_id: i64,
        starting_stop_id: Option<i64>,
    ) -> Result<StartedTrip, TrackerError> {
        let inner = &self.inner;
        let trip = inner
            .store
            .trip(trip_id)
            .await?
            .ok_or(TrackerError::NotFound(trip_id))?;
        if trip.status != TripStatus::Scheduled {
            return Err(TrackerError::InvalidState(format!(
                "Cannot start trip with status: {}",
                trip.status.as_str()
            )));
        }

        let route = inner.store.route(trip.route_id).await?.ok_or_else(|| {
            TrackerError::InvalidState(format!("Route {} does not exist", trip.route_id))
        })?;
        let stops = inner.store.route_stops(trip.route_id).await?;
        if stops.len() < 2 {
            return Err(TrackerError::InvalidState(format!(
                "Route {} needs at least 2 stops to run a trip",
                trip.route_id
            )));
        }

        let direction = match starting_stop_id {
            Some(id) if id == stops[0].stop_id => Direction::Forward,
            Some(id) if id == stops[stops.len() - 1].stop_id => Direction::Backward,
            Some(_) => {
                return Err(TrackerError::InvalidState(
                    "Starting stop must be either the first or last stop of the route".into(),
                ))
            }
            None => trip.direction,
        };
        let ordered = order_stops(stops, direction);

        let started = StartedTrip {
            trip_id,
            route_name: route.route_name.clone(),
            direction,
            total_stops: ordered.len(),
            starting_stop: ordered[0].stop_name.clone(),
            ending_stop: ordered[ordered.len() - 1].stop_name.clone(),
        };

        let started_at = Utc::now();
        // The registry acts as the uniqueness gate: one runner per trip, one
        // running trip per bus.
        inner
            .registry
            .register(TripSnapshot {
                trip_id,
                route_id: trip.route_id,
                route_name: route.route_name.clone(),
                bus_id: trip.bus_id,
                direction,
                current_stop_index: 0,
                current_stop_id: ordered[0].stop_id,
                current_stop_name: ordered[0].stop_name.clone(),
                total_stops: ordered.len(),
                status: TripStatus::Running,
                started_at,
            })
            .await?;

        if let Err(e) = inner.store.mark_running(trip_id, started_at, direction).await {
            inner.registry.remove(trip_id).await;
            return Err(e.into());
        }

        self.announce_and_spawn(trip_id, &route.route_name, ordered).await;
        info!(
            trip_id,
            route_id = trip.route_id,
            direction = direction.as_str(),
            total_stops = started.total_stops,
            "trip started"
        );
        Ok(started)
    }

    /// Stop a running trip early. The pending timer is cancelled atomically
    /// with the registry removal, so no position update can follow the stop.
    pub async fn stop_trip(&self, trip_id: i64) -> Result<(), TrackerError> {
        self.inner
            .registry
            .cancel(trip_id)
            .await
            .ok_or(TrackerError::NotFound(trip_id))?;

        // If this write fails the registry entry is already gone; the
        // scheduler's next reconciliation pass re-registers the trip from the
        // still-running store row.
        self.inner.store.mark_cancelled(trip_id).await?;
        let _ = self.inner.events.send(TrackerEvent::TripStopped { trip_id });
        info!(trip_id, "trip stopped");
        Ok(())
    }

    pub async fn trip_snapshot(&self, trip_id: i64) -> Option<TripSnapshot> {
        self.inner.registry.snapshot(trip_id).await
    }

    /// Point-in-time copy of every live trip.
    pub async fn active_trips(&self) -> Vec<TripSnapshot> {
        self.inner.registry.snapshot_all().await
    }

    /// Run the background scheduler until the process exits: one startup
    /// reconciliation pass (recovers trips left running across a restart),
    /// then periodic passes that auto-start due trips and reconcile the
    /// registry against the store.
    pub async fn run(self: Arc<Self>) {
        info!("starting trip scheduler");
        self.reconcile().await;

        let mut interval = tokio::time::interval(self.inner.timing.scheduler_interval);
        interval.tick().await;
        loop {
            interval.tick().await;
            self.scheduler_pass().await;
        }
    }

    /// One scheduler iteration, separated out for tests.
    pub async fn scheduler_pass(&self) {
        self.reconcile().await;

        let due = match self.inner.store.due_scheduled_trips(Utc::now(), 10).await {
            Ok(due) => due,
            Err(e) => {
                warn!(error = %e, "scheduler failed to query due trips");
                return;
            }
        };
        for trip_id in due {
            match self.start_trip(trip_id, None).await {
                Ok(started) => {
                    info!(
                        trip_id,
                        route_name = %started.route_name,
                        "auto-started scheduled trip"
                    );
                }
                Err(TrackerError::InvalidState(reason)) => {
                    // Bus still out driving, or the route is unusable; the
                    // trip stays scheduled and is retried next pass.
                    debug!(trip_id, reason, "due trip not started");
                }
                Err(e) => warn!(trip_id, error = %e, "failed to auto-start due trip"),
            }
        }
    }

    /// Bring the registry in line with the store: recover trips marked
    /// running in the store but missing here, evict entries the store no
    /// longer shows as running.
    pub async fn reconcile(&self) {
        let store_running = match self.inner.store.running_trip_ids().await {
            Ok(ids) => ids,
            Err(e) => {
                warn!(error = %e, "reconciliation failed to query running trips");
                return;
            }
        };
        let store_set: std::collections::HashSet<i64> = store_running.into_iter().collect();
        let live = self.inner.registry.trip_ids().await;

        for &trip_id in store_set.difference(&live) {
            if let Err(e) = self.recover_trip(trip_id).await {
                warn!(trip_id, error = %e, "failed to recover running trip");
            }
        }

        for &trip_id in live.difference(&store_set) {
            // The store set can predate a trip started while this pass was
            // already underway, so only the current row decides eviction. A
            // scheduled row with a live entry is a start still in flight, not
            // staleness; evict only on confirmed terminal or missing rows.
            let evict = match self.inner.store.trip(trip_id).await {
                Ok(Some(trip)) => {
                    matches!(trip.status, TripStatus::Completed | TripStatus::Cancelled)
                }
                Ok(None) => true,
                Err(e) => {
                    warn!(trip_id, error = %e, "reconciliation failed to re-check trip");
                    continue;
                }
            };
            if !evict {
                continue;
            }
            if self.inner.registry.cancel(trip_id).await.is_some() {
                warn!(trip_id, "evicted stale trip no longer running in store");
                let _ = self.inner.events.send(TrackerEvent::TripRemoved { trip_id });
            }
        }
    }

    /// Re-register a trip the store says is running but we have no snapshot
    /// for (server restart, or a write that raced registry population). The
    /// actual position is unknown, so the bus restarts from its first stop.
    async fn recover_trip(&self, trip_id: i64) -> Result<(), TrackerError> {
        let inner = &self.inner;
        let trip = inner
            .store
            .trip(trip_id)
            .await?
            .ok_or(TrackerError::NotFound(trip_id))?;
        if trip.status != TripStatus::Running {
            return Ok(());
        }
        let route = inner.store.route(trip.route_id).await?.ok_or_else(|| {
            TrackerError::InvalidState(format!("Route {} does not exist", trip.route_id))
        })?;
        let stops = inner.store.route_stops(trip.route_id).await?;
        if stops.len() < 2 {
            return Err(TrackerError::InvalidState(format!(
                "Route {} has no usable stop sequence",
                trip.route_id
            )));
        }
        let ordered = order_stops(stops, trip.direction);

        inner
            .registry
            .register(TripSnapshot {
                trip_id,
                route_id: trip.route_id,
                route_name: route.route_name.clone(),
                bus_id: trip.bus_id,
                direction: trip.direction,
                current_stop_index: 0,
                current_stop_id: ordered[0].stop_id,
                current_stop_name: ordered[0].stop_name.clone(),
                total_stops: ordered.len(),
                status: TripStatus::Running,
                started_at: Utc::now(),
            })
            .await?;

        self.announce_and_spawn(trip_id, &route.route_name, ordered).await;
        info!(trip_id, "recovered running trip, restarting from first stop");
        Ok(())
    }

    async fn announce_and_spawn(&self, trip_id: i64, route_name: &str, ordered: Vec<RouteStop>) {
        let snapshot = self.inner.registry.snapshot(trip_id).await;
        let _ = self.inner.events.send(TrackerEvent::TripStarted {
            trip_id,
            route_id: snapshot.as_ref().map(|s| s.route_id).unwrap_or_default(),
            route_name: route_name.to_string(),
            current_stop_index: 0,
            current_stop_name: ordered[0].stop_name.clone(),
            total_stops: ordered.len(),
        });

        let handle = tokio::spawn(runner::drive(self.inner.clone(), trip_id, ordered));
        self.inner
            .registry
            .set_abort_handle(trip_id, handle.abort_handle())
            .await;
    }

    /// Store-backed view of a trip for clients that observed `running` in the
    /// store before the registry was populated.
    pub async fn trip_from_store(&self, trip_id: i64) -> Result<Option<Trip>, TrackerError> {
        Ok(self.inner.store.trip(trip_id).await?)
    }
}

fn order_stops(stops: Vec<RouteStop>, direction: Direction) -> Vec<RouteStop> {
    match direction {
        Direction::Forward => stops,
        Direction::Backward => stops.into_iter().rev().collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::test_support::{insert_scheduled_trip, seeded_store};

    fn fast_timing() -> Timing {
        Timing {
            move_interval: Duration::from_millis(40),
            final_stop_dwell: Duration::from_millis(80),
            scheduler_interval: Duration::from_millis(50),
        }
    }

    async fn fast_tracker() -> BusTracker {
        let store = seeded_store().await;
        BusTracker::with_timing(
            store,
            fast_timing(),
            AutoReturnConfig {
                enabled: true,
                buffer: Duration::from_millis(10),
            },
        )
    }

    async fn next_event(rx: &mut broadcast::Receiver<TrackerEvent>) -> TrackerEvent {
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("timed out waiting for tracker event")
            .expect("event channel closed")
    }

    async fn assert_silent(rx: &mut broadcast::Receiver<TrackerEvent>, window: Duration) {
        if let Ok(event) = tokio::time::timeout(window, rx.recv()).await {
            panic!("expected no further events, got {:?}", event);
        }
    }

    #[tokio::test]
    async fn full_lifecycle_emits_ordered_events_and_a_return_trip() {
        let tracker = fast_tracker().await;
        let trip_id =
            insert_scheduled_trip(tracker.store(), 1, 1, Direction::Forward, Utc::now()).await;
        let mut rx = tracker.subscribe();

        let started = tracker.start_trip(trip_id, None).await.unwrap();
        assert_eq!(started.total_stops, 3);
        assert_eq!(started.starting_stop, "Central Station");
        assert_eq!(started.ending_stop, "Harbour Gate");

        match next_event(&mut rx).await {
            TrackerEvent::TripStarted {
                trip_id: id,
                current_stop_index,
                total_stops,
                ..
            } => {
                assert_eq!(id, trip_id);
                assert_eq!(current_stop_index, 0);
                assert_eq!(total_stops, 3);
            }
            other => panic!("expected trip_started, got {:?}", other),
        }

        // Positions strictly increase by 1 per update.
        for expected in [1usize, 2] {
            match next_event(&mut rx).await {
                TrackerEvent::TripPositionUpdate {
                    trip_id: id,
                    current_stop_index,
                    ..
                } => {
                    assert_eq!(id, trip_id);
                    assert_eq!(current_stop_index, expected);
                }
                other => panic!("expected trip_position_update, got {:?}", other),
            }
        }

        match next_event(&mut rx).await {
            TrackerEvent::TripCompleted { trip_id: id, trip } => {
                assert_eq!(id, trip_id);
                let trip = trip.expect("completion payload");
                assert_eq!(trip.status, TripStatus::Completed);
                assert!(trip.arrival_time.is_some());
            }
            other => panic!("expected trip_completed, got {:?}", other),
        }

        match next_event(&mut rx).await {
            TrackerEvent::ReturnTripCreated {
                original_trip_id,
                new_trip_id,
                direction,
                ..
            } => {
                assert_eq!(original_trip_id, trip_id);
                assert_ne!(new_trip_id, trip_id);
                assert_eq!(direction, Direction::Backward);

                let created = tracker.store().trip(new_trip_id).await.unwrap().unwrap();
                assert_eq!(created.status, TripStatus::Scheduled);
                assert_eq!(created.origin_trip_id, Some(trip_id));
            }
            other => panic!("expected return_trip_created, got {:?}", other),
        }

        // Snapshot is gone once the trip completed.
        assert!(tracker.active_trips().await.is_empty());
    }

    #[tokio::test]
    async fn starting_an_unknown_trip_is_not_found() {
        let tracker = fast_tracker().await;
        let err = tracker.start_trip(999, None).await.unwrap_err();
        assert!(matches!(err, TrackerError::NotFound(999)));
    }

    #[tokio::test]
    async fn starting_a_non_scheduled_trip_is_invalid_state() {
        let tracker = fast_tracker().await;
        let trip_id =
            insert_scheduled_trip(tracker.store(), 1, 1, Direction::Forward, Utc::now()).await;
        tracker.store().mark_completed(trip_id, Utc::now()).await.unwrap();

        let err = tracker.start_trip(trip_id, None).await.unwrap_err();
        assert!(matches!(err, TrackerError::InvalidState(_)));
    }

    #[tokio::test]
    async fn double_start_fails_and_emits_one_started_event() {
        let tracker = fast_tracker().await;
        let trip_id =
            insert_scheduled_trip(tracker.store(), 1, 1, Direction::Forward, Utc::now()).await;
        let mut rx = tracker.subscribe();

        tracker.start_trip(trip_id, None).await.unwrap();
        let err = tracker.start_trip(trip_id, None).await.unwrap_err();
        assert!(matches!(err, TrackerError::InvalidState(_)));

        assert!(matches!(
            next_event(&mut rx).await,
            TrackerEvent::TripStarted { .. }
        ));
        // Only position updates may follow; a second trip_started would
        // arrive before the first 40ms tick.
        match tokio::time::timeout(Duration::from_millis(20), rx.recv()).await {
            Err(_) => {}
            Ok(Ok(TrackerEvent::TripStarted { .. })) => panic!("duplicate trip_started"),
            Ok(_) => {}
        }
    }

    #[tokio::test]
    async fn a_bus_cannot_drive_two_trips_at_once() {
        let tracker = fast_tracker().await;
        let first =
            insert_scheduled_trip(tracker.store(), 1, 1, Direction::Forward, Utc::now()).await;
        let second =
            insert_scheduled_trip(tracker.store(), 1, 2, Direction::Forward, Utc::now()).await;

        tracker.start_trip(first, None).await.unwrap();
        let err = tracker.start_trip(second, None).await.unwrap_err();
        assert!(matches!(err, TrackerError::InvalidState(_)));
    }

    #[tokio::test]
    async fn starting_stop_overrides_direction() {
        let tracker = fast_tracker().await;
        let trip_id =
            insert_scheduled_trip(tracker.store(), 1, 1, Direction::Forward, Utc::now()).await;

        // Stop 3 is the last stop of route 1, so the trip runs backward.
        let started = tracker.start_trip(trip_id, Some(3)).await.unwrap();
        assert_eq!(started.direction, Direction::Backward);
        assert_eq!(started.starting_stop, "Harbour Gate");
        assert_eq!(started.ending_stop, "Central Station");

        let snapshot = tracker.trip_snapshot(trip_id).await.unwrap();
        assert_eq!(snapshot.current_stop_id, 3);
    }

    #[tokio::test]
    async fn mid_route_stop_is_an_invalid_starting_stop() {
        let tracker = fast_tracker().await;
        let trip_id =
            insert_scheduled_trip(tracker.store(), 1, 1, Direction::Forward, Utc::now()).await;
        let err = tracker.start_trip(trip_id, Some(2)).await.unwrap_err();
        assert!(matches!(err, TrackerError::InvalidState(_)));
    }

    #[tokio::test]
    async fn stop_silences_the_trip_and_cancels_it_in_the_store() {
        let store = seeded_store().await;
        // Slow ticks so the stop lands mid-journey.
        let tracker = BusTracker::with_timing(
            store,
            Timing {
                move_interval: Duration::from_millis(200),
                final_stop_dwell: Duration::from_millis(200),
                scheduler_interval: Duration::from_millis(50),
            },
            AutoReturnConfig {
                enabled: true,
                buffer: Duration::from_millis(10),
            },
        );
        let trip_id =
            insert_scheduled_trip(tracker.store(), 1, 1, Direction::Forward, Utc::now()).await;
        let mut rx = tracker.subscribe();

        tracker.start_trip(trip_id, None).await.unwrap();
        assert!(matches!(
            next_event(&mut rx).await,
            TrackerEvent::TripStarted { .. }
        ));

        tracker.stop_trip(trip_id).await.unwrap();
        assert!(matches!(
            next_event(&mut rx).await,
            TrackerEvent::TripStopped { trip_id: id } if id == trip_id
        ));

        assert!(tracker.active_trips().await.is_empty());
        let trip = tracker.store().trip(trip_id).await.unwrap().unwrap();
        assert_eq!(trip.status, TripStatus::Cancelled);

        // No resurrected ticks: more than two movement intervals pass without
        // a single event for this trip.
        assert_silent(&mut rx, Duration::from_millis(500)).await;
    }

    #[tokio::test]
    async fn stopping_an_untracked_trip_is_not_found() {
        let tracker = fast_tracker().await;
        let err = tracker.stop_trip(123).await.unwrap_err();
        assert!(matches!(err, TrackerError::NotFound(123)));
    }

    #[tokio::test]
    async fn return_generation_skips_when_a_pending_return_exists() {
        let tracker = fast_tracker().await;
        let now = Utc::now();
        let trip_id =
            insert_scheduled_trip(tracker.store(), 1, 1, Direction::Forward, now).await;
        // The bus already has a backward trip on the books.
        insert_scheduled_trip(
            tracker.store(),
            1,
            1,
            Direction::Backward,
            now + chrono::Duration::hours(1),
        )
        .await;
        let mut rx = tracker.subscribe();

        tracker.start_trip(trip_id, None).await.unwrap();
        loop {
            if let TrackerEvent::TripCompleted { .. } = next_event(&mut rx).await {
                break;
            }
        }
        assert_silent(&mut rx, Duration::from_millis(300)).await;
    }

    #[tokio::test]
    async fn disabled_auto_return_creates_nothing() {
        let store = seeded_store().await;
        let tracker = BusTracker::with_timing(
            store,
            fast_timing(),
            AutoReturnConfig {
                enabled: false,
                buffer: Duration::from_millis(10),
            },
        );
        let trip_id =
            insert_scheduled_trip(tracker.store(), 1, 2, Direction::Forward, Utc::now()).await;
        let mut rx = tracker.subscribe();

        tracker.start_trip(trip_id, None).await.unwrap();
        loop {
            if let TrackerEvent::TripCompleted { .. } = next_event(&mut rx).await {
                break;
            }
        }
        assert_silent(&mut rx, Duration::from_millis(300)).await;
        assert!(!tracker
            .store()
            .has_pending_trip(1, 2, Direction::Backward)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn scheduler_auto_starts_due_trips() {
        let tracker = fast_tracker().await;
        let trip_id = insert_scheduled_trip(
            tracker.store(),
            1,
            1,
            Direction::Forward,
            Utc::now() - chrono::Duration::seconds(5),
        )
        .await;
        let mut rx = tracker.subscribe();

        tracker.scheduler_pass().await;

        assert!(matches!(
            next_event(&mut rx).await,
            TrackerEvent::TripStarted { trip_id: id, .. } if id == trip_id
        ));
        assert!(tracker.trip_snapshot(trip_id).await.is_some());
    }

    #[tokio::test]
    async fn reconciliation_recovers_store_running_trips() {
        let tracker = fast_tracker().await;
        let trip_id =
            insert_scheduled_trip(tracker.store(), 1, 1, Direction::Forward, Utc::now()).await;
        // Simulate a restart: the store says running, the registry is empty.
        tracker
            .store()
            .mark_running(trip_id, Utc::now(), Direction::Forward)
            .await
            .unwrap();
        let mut rx = tracker.subscribe();

        tracker.reconcile().await;

        assert!(matches!(
            next_event(&mut rx).await,
            TrackerEvent::TripStarted { trip_id: id, current_stop_index: 0, .. } if id == trip_id
        ));
        let snapshot = tracker.trip_snapshot(trip_id).await.unwrap();
        assert_eq!(snapshot.current_stop_index, 0);
    }

    #[tokio::test]
    async fn reconciliation_never_evicts_a_freshly_started_trip() {
        let store = seeded_store().await;
        let tracker = Arc::new(BusTracker::with_timing(
            store,
            Timing {
                move_interval: Duration::from_secs(60),
                final_stop_dwell: Duration::from_secs(60),
                scheduler_interval: Duration::from_secs(60),
            },
            AutoReturnConfig {
                enabled: false,
                buffer: Duration::from_millis(10),
            },
        ));
        // Extra buses so every trip can run concurrently.
        for i in 3i64..=22 {
            sqlx::query("INSERT INTO buses (bus_id, number_plate, capacity) VALUES (?, ?, 40)")
                .bind(i)
                .bind(format!("BRT-{i:03}"))
                .execute(tracker.store().pool())
                .await
                .unwrap();
        }
        let mut rx = tracker.subscribe();

        // Hammer reconciliation while trips are starting. A pass that read
        // the store before a start must not evict the new registry entry.
        let background = {
            let tracker = tracker.clone();
            tokio::spawn(async move {
                for _ in 0..200 {
                    tracker.reconcile().await;
                    tokio::task::yield_now().await;
                }
            })
        };

        let mut started = Vec::new();
        for bus_id in 1..=22 {
            let trip_id =
                insert_scheduled_trip(tracker.store(), bus_id, 1, Direction::Forward, Utc::now())
                    .await;
            tracker.start_trip(trip_id, None).await.unwrap();
            started.push(trip_id);
        }
        background.await.unwrap();
        tracker.reconcile().await;

        assert_eq!(tracker.active_trips().await.len(), started.len());
        while let Ok(event) = rx.try_recv() {
            assert!(
                !matches!(event, TrackerEvent::TripRemoved { .. }),
                "running trip was evicted: {:?}",
                event
            );
        }
    }

    #[tokio::test]
    async fn completion_is_not_announced_until_it_can_be_persisted() {
        let tracker = fast_tracker().await;
        let trip_id =
            insert_scheduled_trip(tracker.store(), 1, 1, Direction::Forward, Utc::now()).await;
        let mut rx = tracker.subscribe();

        tracker.start_trip(trip_id, None).await.unwrap();
        assert!(matches!(
            next_event(&mut rx).await,
            TrackerEvent::TripStarted { .. }
        ));

        // Take the database away mid-trip.
        tracker.store().pool().close().await;

        // Position updates keep flowing: each failed write is logged and
        // superseded by the next tick's.
        for expected in [1usize, 2] {
            match next_event(&mut rx).await {
                TrackerEvent::TripPositionUpdate {
                    current_stop_index, ..
                } => assert_eq!(current_stop_index, expected),
                other => panic!("expected trip_position_update, got {:?}", other),
            }
        }

        // The dwell elapses but the completed status cannot be persisted:
        // no trip_completed goes out and the snapshot stays live while the
        // runner keeps retrying.
        assert_silent(&mut rx, Duration::from_millis(400)).await;
        let snapshot = tracker.trip_snapshot(trip_id).await.unwrap();
        assert_eq!(snapshot.current_stop_index, 2);
        assert_eq!(snapshot.status, TripStatus::Running);
    }

    #[tokio::test]
    async fn reconciliation_evicts_stale_registry_entries() {
        let store = seeded_store().await;
        // Long ticks: the runner never advances during the test.
        let tracker = BusTracker::with_timing(
            store,
            Timing {
                move_interval: Duration::from_secs(60),
                final_stop_dwell: Duration::from_secs(60),
                scheduler_interval: Duration::from_secs(60),
            },
            AutoReturnConfig {
                enabled: false,
                buffer: Duration::from_millis(10),
            },
        );
        let trip_id =
            insert_scheduled_trip(tracker.store(), 1, 1, Direction::Forward, Utc::now()).await;
        tracker.start_trip(trip_id, None).await.unwrap();

        // Someone cancels the trip directly in the store.
        tracker.store().mark_cancelled(trip_id).await.unwrap();
        let mut rx = tracker.subscribe();

        tracker.reconcile().await;

        assert!(matches!(
            next_event(&mut rx).await,
            TrackerEvent::TripRemoved { trip_id: id } if id == trip_id
        ));
        assert!(tracker.active_trips().await.is_empty());
    }
}
