pub mod appresult;
pub mod catchup;
pub mod config;
pub mod db;
pub mod groups;
pub mod ingress;
pub mod model;
pub mod notify;
pub mod reconcile;
pub mod rooms;
pub mod telemetry;
pub mod upstream;

use std::sync::Arc;

use axum::{extract::FromRef, routing::get, Router};
use tower_http::cors::CorsLayer;

pub use appresult::{AppError, AppResult};

use crate::{db::Store, ingress::SqliteEventLog, notify::Notifier, rooms::RoomRegistry};

#[derive(Clone, FromRef)]
pub struct AppState {
    pub store: Store,
    pub rooms: RoomRegistry,
    pub notifier: Arc<dyn Notifier>,
    pub events: SqliteEventLog,
}

pub fn router(app_state: AppState) -> Router {
    Router::new()
        .merge(rooms::router())
        .route("/retrieve/message", get(catchup::retrieve))
        .route("/retrieve/fit-group", get(groups::groups_for_user))
        .merge(ingress::router())

        .with_state(app_state)
        .layer(telemetry::http_trace())
        .layer(CorsLayer::permissive())
}
