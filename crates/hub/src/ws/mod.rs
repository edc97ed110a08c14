// WebSocket endpoint: upgrade gate, per-connection socket loop, inbound
// frame parsing.

use axum::{
    extract::{
        ws::{rejection::WebSocketUpgradeRejection, Message, WebSocket, WebSocketUpgrade},
        rejection::QueryRejection,
        Path, Query, State,
    },
    http::HeaderMap,
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use tessera_common::protocol::ws::ClientMessage;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::{
    auth::upgrade::{UpgradeAuthenticator, UpgradeQuery, UpgradeRejection},
    error::{current_request_id, request_id_from_headers_or_generate, with_request_id_scope},
    hub::{
        registry::{ConnectionId, ConnectionIdentity},
        Hub,
    },
};

pub const MAX_FRAME_BYTES: usize = 262_144;

#[derive(Clone)]
struct WsState {
    hub: Hub,
    authenticator: UpgradeAuthenticator,
}

pub fn router(hub: Hub, authenticator: UpgradeAuthenticator) -> Router {
    Router::new()
        .route("/ws/{workspace_id}", get(ws_upgrade))
        .with_state(WsState { hub, authenticator })
}

// Authentication runs before the upgrade headers are checked so a rejected
// client always sees 401/403 rather than a protocol error.
async fn ws_upgrade(
    Path(workspace_id): Path<String>,
    query: Result<Query<UpgradeQuery>, QueryRejection>,
    State(state): State<WsState>,
    headers: HeaderMap,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    // An undecodable query (e.g. a repeated token) is an auth failure.
    let query = match query {
        Ok(Query(query)) => query,
        Err(rejection) => {
            warn!(
                workspace_id = %workspace_id,
                error = %rejection.body_text(),
                "rejected websocket upgrade with malformed query"
            );
            return UpgradeRejection::InvalidToken.into_response();
        }
    };
    let identity = match state.authenticator.authenticate(&workspace_id, &query).await {
        Ok(identity) => identity,
        Err(rejection) => return rejection.into_response(),
    };
    let ws = match ws {
        Ok(ws) => ws,
        Err(rejection) => return rejection.into_response(),
    };

    let request_id =
        current_request_id().unwrap_or_else(|| request_id_from_headers_or_generate(&headers));
    let hub = state.hub.clone();
    ws.max_frame_size(MAX_FRAME_BYTES).max_message_size(MAX_FRAME_BYTES).on_upgrade(
        move |socket| async move {
            with_request_id_scope(request_id, handle_socket(hub, workspace_id, identity, socket))
                .await;
        },
    )
}

async fn handle_socket(
    hub: Hub,
    workspace_id: String,
    identity: ConnectionIdentity,
    mut socket: WebSocket,
) {
    let (outbound_sender, mut outbound_receiver) = mpsc::unbounded_channel();
    let connection_id = hub.join(&workspace_id, identity, outbound_sender).await;

    loop {
        tokio::select! {
            maybe_outbound = outbound_receiver.recv() => {
                let Some(frame) = maybe_outbound else {
                    break;
                };
                if socket.send(Message::Text(frame)).await.is_err() {
                    break;
                }
            }
            maybe_message = socket.recv() => {
                let Some(message) = maybe_message else {
                    break;
                };

                match message {
                    Ok(Message::Text(raw_message)) => {
                        let inbound = parse_client_frame(&hub, connection_id, raw_message.as_str());
                        if let Some(inbound) = inbound {
                            hub.handle_client_message(connection_id, inbound).await;
                        }
                    }
                    Ok(Message::Binary(_)) => hub.metrics().record_dropped_frame(),
                    Ok(Message::Close(_)) => break,
                    // Pings are answered by the transport.
                    Ok(_) => {}
                    Err(error) => {
                        debug!(
                            workspace_id = %workspace_id,
                            connection_id = %connection_id,
                            error = %error,
                            "websocket receive failed"
                        );
                        break;
                    }
                }
            }
        }
    }

    hub.leave(connection_id).await;
}

// Malformed JSON and unknown message types are dropped without a reply.
fn parse_client_frame(hub: &Hub, connection_id: ConnectionId, raw: &str) -> Option<ClientMessage> {
    match serde_json::from_str::<ClientMessage>(raw) {
        Ok(message) => Some(message),
        Err(error) => {
            hub.metrics().record_dropped_frame();
            debug!(connection_id = %connection_id, error = %error, "dropping malformed frame");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, time::Duration};

    use axum::{
        body::{to_bytes, Body},
        http::{Request, StatusCode},
    };
    use serde_json::Value;
    use tower::ServiceExt;
    use uuid::Uuid;

    use super::{parse_client_frame, router};
    use crate::{
        auth::{jwt::JwtAccessTokenService, upgrade::UpgradeAuthenticator},
        hub::Hub,
        membership::WorkspaceMembershipStore,
        metrics::HubMetrics,
    };

    const TEST_SECRET: &str = "tessera_test_secret_that_is_definitely_long_enough";

    fn hub() -> Hub {
        Hub::new(Duration::from_secs(60), Arc::new(HubMetrics::default()))
    }

    fn authenticator(dev_auth_bypass: bool) -> UpgradeAuthenticator {
        let jwt_service =
            Arc::new(JwtAccessTokenService::new(TEST_SECRET).expect("service should initialize"));
        UpgradeAuthenticator::new(jwt_service, WorkspaceMembershipStore::in_memory(), dev_auth_bypass)
    }

    #[tokio::test]
    async fn upgrade_without_token_is_rejected_before_protocol_checks() {
        let response = router(hub(), authenticator(false))
            .oneshot(Request::builder().uri("/ws/w1").body(Body::empty()).expect("request"))
            .await
            .expect("response");

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        let body = to_bytes(response.into_body(), usize::MAX).await.expect("body");
        let parsed: Value = serde_json::from_slice(&body).expect("json body");
        assert_eq!(parsed["error"]["code"], "AUTH_INVALID_TOKEN");
    }

    #[tokio::test]
    async fn repeated_token_parameter_is_unauthorized_even_with_bypass() {
        let response = router(hub(), authenticator(true))
            .oneshot(
                Request::builder()
                    .uri("/ws/w1?token=forged&token=forged2&userId=mallory")
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("response");

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        let body = to_bytes(response.into_body(), usize::MAX).await.expect("body");
        let parsed: Value = serde_json::from_slice(&body).expect("json body");
        assert_eq!(parsed["error"]["code"], "AUTH_INVALID_TOKEN");
    }

    #[tokio::test]
    async fn bypass_identity_reaches_the_upgrade_check() {
        let response = router(hub(), authenticator(true))
            .oneshot(
                Request::builder().uri("/ws/w1?userId=ann").body(Body::empty()).expect("request"),
            )
            .await
            .expect("response");

        assert!(response.status().is_client_error());
        assert_ne!(response.status(), StatusCode::UNAUTHORIZED);
        assert_ne!(response.status(), StatusCode::FORBIDDEN);
    }

    #[test]
    fn malformed_frames_are_counted_and_dropped() {
        let hub = hub();
        let connection_id = Uuid::new_v4();

        assert!(parse_client_frame(&hub, connection_id, "{not json").is_none());
        assert!(parse_client_frame(&hub, connection_id, r#"{"type":"teleport"}"#).is_none());
        assert!(parse_client_frame(&hub, connection_id, r#"{"type":"hello"}"#).is_some());

        assert!(hub.metrics().render_prometheus().contains("hub_ws_dropped_frames_total 2"));
    }
}
