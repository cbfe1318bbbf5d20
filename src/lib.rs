pub mod config;
pub mod grader;
pub mod logging;
pub mod model;
pub mod protocol;
pub mod response;
pub mod room;
pub mod routes;
pub mod state;
pub mod store;
pub mod ws;

use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::state::AppState;

pub fn create_app(state: AppState) -> axum::Router {
    routes::router(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}
