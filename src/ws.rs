//! `GET /ws` — the WebSocket upgrade entry point.
//!
//! The connection starts unauthenticated; [`crate::hub::Hub::dispatch`]
//! requires an `auth` envelope as the first frame before anything else is
//! accepted (spec §4.2), so this handler takes no `AuthUser` extractor.

use std::sync::Arc;

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::State;
use axum::response::Response;

use crate::connection;
use crate::hub::Hub;

pub async fn upgrade(ws: WebSocketUpgrade, State(hub): State<Arc<Hub>>) -> Response {
    ws.on_upgrade(move |socket| connection::run(socket, hub))
}
