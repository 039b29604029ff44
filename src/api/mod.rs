pub mod error;
pub mod health;
pub mod trips;
pub mod ws;

pub use error::ErrorResponse;

use std::sync::Arc;

use axum::{routing::get, Router};

use crate::tracker::BusTracker;

pub fn router(tracker: Arc<BusTracker>) -> Router {
    let ws_state = ws::WsState {
        tracker: tracker.clone(),
    };

    Router::new()
        .nest("/admin/trips", trips::router(tracker.clone()))
        .nest("/health", health::router(tracker))
        .route("/ws", get(ws::ws_trips).with_state(ws_state))
}
