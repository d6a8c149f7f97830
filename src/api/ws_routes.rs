//! Websocket upgrade endpoint (§4.15): hands the accepted socket to a
//! fresh `DiffBroadcaster` for the lifetime of the connection.

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::State;
use axum::response::Response;

use crate::api::AppState;
use crate::diff_broadcaster::DiffBroadcaster;

pub async fn ws_handler(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| async move {
        let broadcaster = DiffBroadcaster::new(state.pool.clone(), state.version_rx.clone());
        broadcaster.serve(socket).await;
    })
}
