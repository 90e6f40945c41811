//! axum glue: upgrades a connection, registers it with the hub, and pumps
//! frames in both directions until either side hangs up.

use std::sync::Arc;

use axum::Router;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::Response;
use axum::routing::get;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tracing::debug;

use crate::hub::Hub;
use crate::wire::ClientCommand;

#[derive(Debug, Deserialize)]
pub struct WsParams {
  /// Optional execution scope for this client.
  pub execution_id: Option<String>,
}

/// A router exposing the hub at `/ws`.
pub fn router(hub: Arc<Hub>) -> Router {
  Router::new().route("/ws", get(ws_handler)).with_state(hub)
}

pub async fn ws_handler(
  ws: WebSocketUpgrade,
  State(hub): State<Arc<Hub>>,
  Query(params): Query<WsParams>,
) -> Response {
  ws.on_upgrade(move |socket| handle_socket(socket, hub, params.execution_id))
}

async fn handle_socket(socket: WebSocket, hub: Arc<Hub>, execution_id: Option<String>) {
  let (client_id, mut queue) = hub.register(execution_id);
  let (mut sink, mut stream) = socket.split();

  let outbound_client = client_id.clone();
  let outbound = tokio::spawn(async move {
    while let Some(text) = queue.recv().await {
      if sink.send(Message::Text(text)).await.is_err() {
        break;
      }
    }
    debug!(client_id = %outbound_client, "outbound pump finished");
  });

  while let Some(Ok(message)) = stream.next().await {
    match message {
      Message::Text(text) => match serde_json::from_str::<ClientCommand>(&text) {
        Ok(ClientCommand::Subscribe { event_types }) => {
          hub.subscribe(&client_id, &event_types);
        }
        Ok(ClientCommand::Unsubscribe { event_types }) => {
          hub.unsubscribe(&client_id, &event_types);
        }
        Err(e) => {
          debug!(client_id = %client_id, error = %e, "ignoring malformed command");
        }
      },
      Message::Close(_) => break,
      _ => {}
    }
  }

  hub.unregister(&client_id);
  outbound.abort();
}
