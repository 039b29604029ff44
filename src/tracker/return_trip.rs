//! Auto-generation of reverse-direction return trips.

use std::sync::Arc;

use chrono::Utc;

use super::error::TrackerError;
use super::events::TrackerEvent;
use super::TrackerInner;
use crate::models::TripStatus;

/// Schedule return-trip generation for a trip that just completed.
///
/// Fire-and-forget relative to the completing trip: a failure here is logged
/// and never rolls back the trip's completed status.
pub(super) fn spawn(inner: Arc<TrackerInner>, completed_trip_id: i64) {
    tokio::spawn(async move {
        if let Err(e) = generate(&inner, completed_trip_id).await {
            tracing::warn!(
                trip_id = completed_trip_id,
                error = %e,
                "return trip generation failed"
            );
        }
    });
}

async fn generate(inner: &TrackerInner, completed_trip_id: i64) -> Result<(), TrackerError> {
    let (enabled, buffer) = {
        let cfg = inner.auto_return.read().await;
        (cfg.enabled, cfg.buffer)
    };
    if !enabled {
        return Ok(());
    }

    let trip = inner
        .store
        .trip(completed_trip_id)
        .await?
        .ok_or(TrackerError::NotFound(completed_trip_id))?;

    // Only natural completions loop back, and a return trip does not beget
    // another return trip.
    if trip.status != TripStatus::Completed || trip.origin_trip_id.is_some() {
        return Ok(());
    }

    let direction = trip.direction.flipped();
    if inner
        .store
        .has_pending_trip(trip.bus_id, trip.route_id, direction)
        .await?
    {
        tracing::info!(
            trip_id = completed_trip_id,
            bus_id = trip.bus_id,
            "bus already has a pending trip in the return direction, skipping generation"
        );
        return Ok(());
    }

    let completed_at = trip.arrival_time.unwrap_or_else(Utc::now);
    let departure_time = completed_at
        + chrono::Duration::from_std(buffer).unwrap_or_else(|_| chrono::Duration::zero());

    let new_trip_id = inner
        .store
        .create_trip(
            trip.bus_id,
            trip.route_id,
            direction,
            departure_time,
            Some(completed_trip_id),
        )
        .await?;

    let payload = inner.store.trip(new_trip_id).await.ok().flatten();
    let _ = inner.events.send(TrackerEvent::ReturnTripCreated {
        original_trip_id: completed_trip_id,
        new_trip_id,
        bus_id: trip.bus_id,
        route_id: trip.route_id,
        direction,
        departure_time,
        trip: payload,
    });
    tracing::info!(
        trip_id = completed_trip_id,
        new_trip_id,
        direction = direction.as_str(),
        "return trip scheduled"
    );
    Ok(())
}
