//! Persistence layer for trips, routes and stops.
//!
//! All tracker state transitions are written through to this store; it is the
//! durable source of truth the in-memory registry reconciles against.

use chrono::{DateTime, Duration, NaiveDate, Utc};
use sqlx::SqlitePool;

use crate::models::{Direction, Route, RouteStop, Trip, TripStatus};

#[derive(Clone)]
pub struct TripStore {
    pool: SqlitePool,
}

/// Outcome of a daily trip generation run.
#[derive(Debug, Default)]
pub struct GenerationSummary {
    pub routes_processed: u32,
    pub routes_skipped: u32,
    pub trips_created: u32,
}

/// Parameters for daily trip generation, validated at the API boundary.
#[derive(Debug, Clone)]
pub struct GenerationParams {
    pub day: NaiveDate,
    /// Window within the day, as seconds since midnight UTC.
    pub window_start_secs: u32,
    pub window_end_secs: u32,
    pub seconds_between_bus_departures: u32,
    pub seconds_between_each_stop: u32,
    pub seconds_waiting_at_final_stop: u32,
    pub route_id: Option<i64>,
    pub max_routes: Option<u32>,
}

impl TripStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn trip(&self, trip_id: i64) -> Result<Option<Trip>, sqlx::Error> {
        sqlx::query_as(
            "SELECT trip_id, bus_id, route_id, direction, departure_time, arrival_time, \
             status, current_stop_index, origin_trip_id \
             FROM trips WHERE trip_id = ?",
        )
        .bind(trip_id)
        .fetch_optional(&self.pool)
        .await
    }

    pub async fn route(&self, route_id: i64) -> Result<Option<Route>, sqlx::Error> {
        sqlx::query_as("SELECT route_id, route_name FROM routes WHERE route_id = ?")
            .bind(route_id)
            .fetch_optional(&self.pool)
            .await
    }

    pub async fn routes(&self) -> Result<Vec<Route>, sqlx::Error> {
        sqlx::query_as("SELECT route_id, route_name FROM routes ORDER BY route_id")
            .fetch_all(&self.pool)
            .await
    }

    /// Stops of a route in forward order.
    pub async fn route_stops(&self, route_id: i64) -> Result<Vec<RouteStop>, sqlx::Error> {
        sqlx::query_as(
            "SELECT rs.stop_id, s.stop_name, rs.stop_order \
             FROM routes_stops rs \
             JOIN stops s ON rs.stop_id = s.stop_id \
             WHERE rs.route_id = ? \
             ORDER BY rs.stop_order",
        )
        .bind(route_id)
        .fetch_all(&self.pool)
        .await
    }

    pub async fn bus_ids(&self) -> Result<Vec<i64>, sqlx::Error> {
        let rows: Vec<(i64,)> = sqlx::query_as("SELECT bus_id FROM buses ORDER BY bus_id")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    /// Transition a trip to `running` with its actual departure time and
    /// (possibly admin-overridden) direction.
    pub async fn mark_running(
        &self,
        trip_id: i64,
        departure_time: DateTime<Utc>,
        direction: Direction,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            "UPDATE trips SET status = 'running', departure_time = ?, direction = ?, \
             current_stop_index = 0 WHERE trip_id = ?",
        )
        .bind(departure_time)
        .bind(direction)
        .bind(trip_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Write-through of a running trip's position. A no-op once the trip has
    /// left the `running` state, so a stale tick cannot dirty a finished row.
    pub async fn update_position(&self, trip_id: i64, stop_index: i64) -> Result<(), sqlx::Error> {
        sqlx::query(
            "UPDATE trips SET current_stop_index = ? WHERE trip_id = ? AND status = 'running'",
        )
        .bind(stop_index)
        .bind(trip_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn mark_completed(
        &self,
        trip_id: i64,
        arrival_time: DateTime<Utc>,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            "UPDATE trips SET status = 'completed', arrival_time = ?, current_stop_index = NULL \
             WHERE trip_id = ?",
        )
        .bind(arrival_time)
        .bind(trip_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Cancel a trip and any still-scheduled return trip generated from it.
    pub async fn mark_cancelled(&self, trip_id: i64) -> Result<(), sqlx::Error> {
        sqlx::query(
            "UPDATE trips SET status = 'cancelled', current_stop_index = NULL WHERE trip_id = ?",
        )
        .bind(trip_id)
        .execute(&self.pool)
        .await?;
        sqlx::query(
            "UPDATE trips SET status = 'cancelled' \
             WHERE origin_trip_id = ? AND status = 'scheduled'",
        )
        .bind(trip_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Whether the bus already has a scheduled or running trip on this route
    /// in the given direction.
    pub async fn has_pending_trip(
        &self,
        bus_id: i64,
        route_id: i64,
        direction: Direction,
    ) -> Result<bool, sqlx::Error> {
        let row: Option<(i64,)> = sqlx::query_as(
            "SELECT trip_id FROM trips \
             WHERE bus_id = ? AND route_id = ? AND direction = ? \
               AND status IN ('scheduled', 'running') \
             ORDER BY departure_time ASC LIMIT 1",
        )
        .bind(bus_id)
        .bind(route_id)
        .bind(direction)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.is_some())
    }

    pub async fn create_trip(
        &self,
        bus_id: i64,
        route_id: i64,
        direction: Direction,
        departure_time: DateTime<Utc>,
        origin_trip_id: Option<i64>,
    ) -> Result<i64, sqlx::Error> {
        let result = sqlx::query(
            "INSERT INTO trips (bus_id, route_id, direction, departure_time, status, origin_trip_id) \
             VALUES (?, ?, ?, ?, 'scheduled', ?)",
        )
        .bind(bus_id)
        .bind(route_id)
        .bind(direction)
        .bind(departure_time)
        .bind(origin_trip_id)
        .execute(&self.pool)
        .await?;
        Ok(result.last_insert_rowid())
    }

    /// Trip ids marked `running` in the store, used for registry reconciliation.
    pub async fn running_trip_ids(&self) -> Result<Vec<i64>, sqlx::Error> {
        let rows: Vec<(i64,)> = sqlx::query_as("SELECT trip_id FROM trips WHERE status = 'running'")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    /// Scheduled trips whose departure time has passed, oldest first.
    pub async fn due_scheduled_trips(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<i64>, sqlx::Error> {
        let rows: Vec<(i64,)> = sqlx::query_as(
            "SELECT trip_id FROM trips \
             WHERE status = 'scheduled' AND departure_time <= ? \
             ORDER BY departure_time ASC LIMIT ?",
        )
        .bind(now)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    async fn has_trips_on_day(&self, route_id: i64, day: NaiveDate) -> Result<bool, sqlx::Error> {
        let start = day.and_hms_opt(0, 0, 0).expect("midnight is valid").and_utc();
        let end = start + Duration::days(1);
        let row: Option<(i64,)> = sqlx::query_as(
            "SELECT trip_id FROM trips \
             WHERE route_id = ? AND status = 'scheduled' \
               AND departure_time >= ? AND departure_time < ? \
             LIMIT 1",
        )
        .bind(route_id)
        .bind(start)
        .bind(end)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.is_some())
    }

    /// Batch-generate scheduled trips for the given day.
    ///
    /// Buses are assigned to candidate routes round-robin. Departures on a
    /// route are spaced by the inter-departure gap plus the estimated one-way
    /// leg time, so a bus has finished driving (and dwelling) before its next
    /// departure slot. Return legs are not pre-generated; the auto-return
    /// generator creates them as forward trips complete.
    pub async fn generate_daily_trips(
        &self,
        params: &GenerationParams,
    ) -> Result<GenerationSummary, sqlx::Error> {
        let mut summary = GenerationSummary::default();

        let routes = match params.route_id {
            Some(id) => self.route(id).await?.into_iter().collect(),
            None => self.routes().await?,
        };
        let buses = self.bus_ids().await?;

        let midnight = params
            .day
            .and_hms_opt(0, 0, 0)
            .expect("midnight is valid")
            .and_utc();
        let window_start = midnight + Duration::seconds(params.window_start_secs as i64);
        let window_end = midnight + Duration::seconds(params.window_end_secs as i64);

        let mut processed: u32 = 0;
        for (idx, route) in routes.iter().enumerate() {
            if let Some(max) = params.max_routes {
                if processed >= max {
                    summary.routes_skipped += 1;
                    continue;
                }
            }

            let stop_count = self.route_stops(route.route_id).await?.len();
            if stop_count < 2 {
                summary.routes_skipped += 1;
                continue;
            }
            if buses.is_empty() {
                summary.routes_skipped += 1;
                continue;
            }
            if self.has_trips_on_day(route.route_id, params.day).await? {
                summary.routes_skipped += 1;
                continue;
            }

            let bus_id = buses[idx % buses.len()];
            let leg_secs = (stop_count as i64 - 1) * params.seconds_between_each_stop as i64
                + params.seconds_waiting_at_final_stop as i64;
            let spacing =
                Duration::seconds(params.seconds_between_bus_departures as i64 + leg_secs);

            let mut departure = window_start;
            let mut created_for_route: u32 = 0;
            while departure < window_end {
                self.create_trip(bus_id, route.route_id, Direction::Forward, departure, None)
                    .await?;
                created_for_route += 1;
                departure += spacing;
            }

            summary.trips_created += created_for_route;
            processed += 1;
        }

        summary.routes_processed = processed;
        Ok(summary)
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use sqlx::sqlite::SqlitePoolOptions;

    /// In-memory store with the production migrations applied and a small
    /// network seeded: one 3-stop route, one 2-stop route, two buses.
    pub async fn seeded_store() -> TripStore {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .expect("in-memory sqlite");
        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .expect("migrations");

        sqlx::query(
            "INSERT INTO routes (route_id, route_name) VALUES (1, 'Downtown Express'), (2, 'Airport Shuttle')",
        )
        .execute(&pool)
        .await
        .unwrap();
        sqlx::query(
            "INSERT INTO stops (stop_id, stop_name) VALUES \
             (1, 'Central Station'), (2, 'Market Square'), (3, 'Harbour Gate'), \
             (4, 'Terminal 1'), (5, 'Terminal 2')",
        )
        .execute(&pool)
        .await
        .unwrap();
        sqlx::query(
            "INSERT INTO routes_stops (route_id, stop_id, stop_order) VALUES \
             (1, 1, 1), (1, 2, 2), (1, 3, 3), \
             (2, 4, 1), (2, 5, 2)",
        )
        .execute(&pool)
        .await
        .unwrap();
        sqlx::query(
            "INSERT INTO buses (bus_id, number_plate, capacity) VALUES \
             (1, 'BRT-001', 40), (2, 'BRT-002', 40)",
        )
        .execute(&pool)
        .await
        .unwrap();

        TripStore::new(pool)
    }

    pub async fn insert_scheduled_trip(
        store: &TripStore,
        bus_id: i64,
        route_id: i64,
        direction: Direction,
        departure_time: DateTime<Utc>,
    ) -> i64 {
        store
            .create_trip(bus_id, route_id, direction, departure_time, None)
            .await
            .unwrap()
    }
}
