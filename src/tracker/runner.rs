//! Per-trip runner task: advances one running trip along its stop sequence.

use std::sync::Arc;

use chrono::Utc;
use tokio::time::MissedTickBehavior;

use super::events::TrackerEvent;
use super::{return_trip, TrackerInner};
use crate::models::RouteStop;

/// Drive a trip from its first stop to completion.
///
/// Each running trip owns one of these tasks and its own timer, so a slow
/// database write for one trip never delays another trip's tick. The task is
/// aborted by `stop_trip`; a tick that was already past the abort point finds
/// its registry entry gone and exits without emitting.
pub(super) async fn drive(inner: Arc<TrackerInner>, trip_id: i64, stops: Vec<RouteStop>) {
    let total_stops = stops.len();
    let mut interval = tokio::time::interval(inner.timing.move_interval);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick of a tokio interval fires immediately; the bus is
    // already at stop 0, so skip it.
    interval.tick().await;

    let mut index: usize = 0;
    while index + 1 < total_stops {
        interval.tick().await;
        index += 1;
        let stop = &stops[index];

        let updated = inner
            .registry
            .update(trip_id, |snapshot| {
                snapshot.current_stop_index = index;
                snapshot.current_stop_id = stop.stop_id;
                snapshot.current_stop_name = stop.stop_name.clone();
            })
            .await;
        if updated.is_none() {
            // Stopped while this tick was in flight.
            tracing::debug!(trip_id, "tick for untracked trip ignored");
            return;
        }

        if let Err(e) = inner.store.update_position(trip_id, index as i64).await {
            // Tolerate a missed write; the next tick writes a newer index.
            tracing::warn!(trip_id, index, error = %e, "position write failed");
        }

        let _ = inner.events.send(TrackerEvent::TripPositionUpdate {
            trip_id,
            current_stop_index: index,
            current_stop_id: stop.stop_id,
            current_stop_name: stop.stop_name.clone(),
            total_stops,
        });
    }

    // Arrived at the final stop: dwell while offloading, then complete.
    tokio::time::sleep(inner.timing.final_stop_dwell).await;

    // The store must record completion before the snapshot disappears and the
    // event goes out, otherwise clients resync against a row that still says
    // running. On failure, keep the trip live and retry next cycle.
    loop {
        match inner.store.mark_completed(trip_id, Utc::now()).await {
            Ok(()) => break,
            Err(e) => {
                tracing::error!(trip_id, error = %e, "failed to persist completion, retrying");
                tokio::time::sleep(inner.timing.move_interval).await;
            }
        }
    }

    inner.registry.remove(trip_id).await;
    let trip = inner.store.trip(trip_id).await.ok().flatten();
    let _ = inner.events.send(TrackerEvent::TripCompleted { trip_id, trip });
    tracing::info!(trip_id, total_stops, "trip completed");

    return_trip::spawn(inner, trip_id);
}
