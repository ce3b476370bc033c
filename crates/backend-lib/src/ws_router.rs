// ============================
// crates/backend-lib/src/ws_router.rs
// ============================
//! WebSocket router and connection handling.
use crate::lifecycle::{Connection, ConnectionManager};
use crate::storage::Storage;
use crate::AppState;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    http::HeaderMap,
    response::IntoResponse,
    routing::get,
    Router,
};
use chat_relay_common::{ClientToServer, ServerToClient};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use std::sync::Arc;
use tower_http::trace::TraceLayer;

/// Query parameters accepted on the upgrade request
#[derive(Debug, Default, Deserialize)]
pub struct ConnectParams {
    pub identity: Option<String>,
}

/// Create the WebSocket router
pub fn create_router<S: Storage + Clone + 'static>(state: Arc<AppState<S>>) -> Router {
    Router::new()
        .route("/ws", get(ws_handler::<S>))
        .route("/health", get(health_check))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health_check() -> &'static str {
    "Healthy"
}

/// Handler for WebSocket connections
pub async fn ws_handler<S: Storage + Clone + 'static>(
    ws: WebSocketUpgrade,
    Query(params): Query<ConnectParams>,
    headers: HeaderMap,
    State(state): State<Arc<AppState<S>>>,
) -> impl IntoResponse {
    let claimed = claimed_identity(params, &headers, &state.settings.connection.identity_header);
    ws.on_upgrade(move |socket| handle_connection(socket, state, claimed))
}

/// The `identity` query parameter, else the identity header. Blank values
/// count as absent.
fn claimed_identity(params: ConnectParams, headers: &HeaderMap, header: &str) -> Option<String> {
    let non_blank = |value: &str| !value.trim().is_empty();
    params.identity.filter(|v| non_blank(v.as_str())).or_else(|| {
        headers
            .get(header)
            .and_then(|value| value.to_str().ok())
            .filter(|v| non_blank(*v))
            .map(str::to_string)
    })
}

async fn handle_connection<S: Storage + Clone + 'static>(
    socket: WebSocket,
    state: Arc<AppState<S>>,
    claimed: Option<String>,
) {
    let manager = state.connections.clone();
    let mut conn = manager.open();
    let Some(mut outbound) = conn.take_outbound() else {
        manager.close(&mut conn);
        return;
    };

    // Taken before anything can await, so a concurrent shutdown is not missed
    let mut shutdown = conn.shutdown_signal();
    let (mut sink, mut stream) = socket.split();

    // Forward queued events to the socket
    let conn_id = conn.id();
    let mut send_task = tokio::spawn(async move {
        while let Some(event) = outbound.recv().await {
            let json = match serde_json::to_string(&event) {
                Ok(json) => json,
                Err(e) => {
                    tracing::error!("Failed to serialize event for {conn_id}: {e}");
                    continue;
                },
            };
            if sink.send(Message::Text(json.into())).await.is_err() {
                break;
            }
        }
        let _ = sink.send(Message::Close(None)).await;
    });

    match claimed {
        Some(claimed) => {
            if let Ok(identity) = manager.identify(&mut conn, &claimed) {
                manager
                    .reply(&conn, ServerToClient::Identified { identity })
                    .await;
            }
        },
        None => tracing::info!("Connection {} opened without an identity", conn.id()),
    }

    while !*shutdown.borrow_and_update() {
        tokio::select! {
            frame = stream.next() => {
                match frame {
                    Some(Ok(Message::Text(text))) => {
                        handle_frame(&manager, &mut conn, text.as_str()).await;
                    },
                    Some(Ok(Message::Binary(_))) => {
                        manager
                            .reply(&conn, ServerToClient::MalformedMessage {
                                err_msg: "binary frames are not supported".to_string(),
                            })
                            .await;
                    },
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {},
                    Some(Err(e)) => {
                        tracing::debug!("Connection {} read error: {e}", conn.id());
                        break;
                    },
                }
            },
            _ = shutdown.changed() => break,
            _ = &mut send_task => break,
        }
    }

    // Unbind first so nothing new is routed here, then let the writer drain.
    manager.close(&mut conn);
    drop(conn);
    if !send_task.is_finished() {
        let _ = tokio::time::timeout(state.settings.delivery.push_timeout(), &mut send_task).await;
        send_task.abort();
    }
}

async fn handle_frame<S: Storage + Clone + 'static>(
    manager: &ConnectionManager<S>,
    conn: &mut Connection,
    text: &str,
) {
    tracing::debug!("Connection {} frame: {} bytes", conn.id(), text.len());

    let reply = match serde_json::from_str::<ClientToServer>(text) {
        Ok(msg) => manager.handle_client_message(conn, msg).await,
        Err(e) => Some(ServerToClient::MalformedMessage {
            err_msg: e.to_string(),
        }),
    };

    if let Some(reply) = reply {
        manager.reply(conn, reply).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Settings;
    use crate::storage::MemoryStorage;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    #[tokio::test]
    async fn test_health_check() {
        let state = Arc::new(AppState::new(MemoryStorage::new(), Settings::default()).unwrap());
        let app = create_router(state);

        let response = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[test]
    fn test_blank_query_identity_falls_back_to_header() {
        let mut headers = HeaderMap::new();
        headers.insert("x-user-identity", "carol".parse().unwrap());

        let blank = ConnectParams {
            identity: Some(String::new()),
        };
        assert_eq!(
            claimed_identity(blank, &headers, "x-user-identity").as_deref(),
            Some("carol")
        );

        let query = ConnectParams {
            identity: Some("alice".to_string()),
        };
        assert_eq!(
            claimed_identity(query, &headers, "x-user-identity").as_deref(),
            Some("alice")
        );

        headers.insert("x-user-identity", " ".parse().unwrap());
        assert!(claimed_identity(ConnectParams::default(), &headers, "x-user-identity").is_none());
    }

    #[tokio::test]
    async fn test_plain_get_on_ws_is_not_upgraded() {
        let state = Arc::new(AppState::new(MemoryStorage::new(), Settings::default()).unwrap());
        let app = create_router(state);

        let response = app
            .oneshot(Request::builder().uri("/ws?identity=alice").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert!(response.status().is_client_error());
    }
}
