// Collaborator ingress: backend services push pass-through events to
// connected clients and read presence snapshots. Requires a service token.

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post},
    Extension, Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::info;

use crate::{
    auth::{
        jwt::JwtAccessTokenService,
        middleware::{require_service_auth, AuthenticatedService},
    },
    error::{ErrorCode, HubError},
    hub::{locks::FrameLock, registry::ConnectionSnapshot, router::EventRouter},
};

#[derive(Debug, Deserialize)]
pub struct WorkspaceEventRequest {
    pub event: Value,
    #[serde(default)]
    pub canvas_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct UserEventRequest {
    pub event: Value,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DeliveryResponse {
    pub delivered: usize,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct MembersResponse {
    workspace_id: String,
    members: Vec<ConnectionSnapshot>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CanvasViewersResponse {
    workspace_id: String,
    canvas_id: String,
    viewers: Vec<ConnectionSnapshot>,
    locks: Vec<FrameLock>,
}

pub fn router(jwt_service: Arc<JwtAccessTokenService>, events: EventRouter) -> Router {
    let auth_layer = middleware::from_fn_with_state(jwt_service, require_service_auth);

    Router::new()
        .route("/v1/workspaces/{workspace_id}/events", post(publish_workspace_event))
        .route("/v1/users/{user_id}/events", post(publish_user_event))
        .route("/v1/workspaces/{workspace_id}/members", get(list_members))
        .route(
            "/v1/workspaces/{workspace_id}/canvases/{canvas_id}/viewers",
            get(list_canvas_viewers),
        )
        .route_layer(auth_layer)
        .with_state(events)
}

async fn publish_workspace_event(
    Path(workspace_id): Path<String>,
    State(events): State<EventRouter>,
    Extension(service): Extension<AuthenticatedService>,
    Json(payload): Json<WorkspaceEventRequest>,
) -> Response {
    if let Err(error) = ensure_event_object(&payload.event) {
        return error.into_response();
    }

    let canvas_id = payload.canvas_id.as_deref().map(str::trim).filter(|id| !id.is_empty());
    let delivered = match canvas_id {
        Some(canvas_id) => {
            events.ws_broadcast_to_canvas(&workspace_id, canvas_id, &payload.event).await
        }
        None => events.ws_broadcast(&workspace_id, &payload.event).await,
    };

    info!(
        service = %service.name,
        workspace_id = %workspace_id,
        canvas_id = canvas_id.unwrap_or(""),
        event_type = event_type(&payload.event),
        delivered,
        "published workspace event"
    );

    (StatusCode::ACCEPTED, Json(DeliveryResponse { delivered })).into_response()
}

async fn publish_user_event(
    Path(user_id): Path<String>,
    State(events): State<EventRouter>,
    Extension(service): Extension<AuthenticatedService>,
    Json(payload): Json<UserEventRequest>,
) -> Response {
    if let Err(error) = ensure_event_object(&payload.event) {
        return error.into_response();
    }

    let delivered = events.broadcast_to_user(&user_id, &payload.event).await;

    info!(
        service = %service.name,
        user_id = %user_id,
        event_type = event_type(&payload.event),
        delivered,
        "published user event"
    );

    (StatusCode::ACCEPTED, Json(DeliveryResponse { delivered })).into_response()
}

async fn list_members(
    Path(workspace_id): Path<String>,
    State(events): State<EventRouter>,
) -> Json<MembersResponse> {
    let members = match events.hub() {
        Some(hub) => hub.members(&workspace_id).await,
        None => Vec::new(),
    };

    Json(MembersResponse { workspace_id, members })
}

async fn list_canvas_viewers(
    Path((workspace_id, canvas_id)): Path<(String, String)>,
    State(events): State<EventRouter>,
) -> Json<CanvasViewersResponse> {
    let (viewers, locks) = match events.hub() {
        Some(hub) => (
            hub.canvas_viewers(&workspace_id, &canvas_id).await,
            hub.canvas_locks(&workspace_id, &canvas_id).await,
        ),
        None => (Vec::new(), Vec::new()),
    };

    Json(CanvasViewersResponse { workspace_id, canvas_id, viewers, locks })
}

fn ensure_event_object(event: &Value) -> Result<(), HubError> {
    if event.is_object() {
        return Ok(());
    }

    Err(HubError::new(ErrorCode::ValidationFailed, "event must be a JSON object")
        .with_details(json!({ "field": "event" })))
}

fn event_type(event: &Value) -> &str {
    event.get("type").and_then(Value::as_str).unwrap_or("unknown")
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, time::Duration};

    use axum::{
        body::{to_bytes, Body},
        http::{header::AUTHORIZATION, Method, Request, StatusCode},
        Router,
    };
    use serde_json::{json, Value};
    use tessera_common::protocol::ws::ClientMessage;
    use tokio::sync::mpsc;
    use tower::ServiceExt;

    use super::router;
    use crate::{
        auth::jwt::JwtAccessTokenService,
        hub::{
            registry::{ConnectionIdentity, OutboundFrame},
            router::EventRouter,
            Hub,
        },
        metrics::HubMetrics,
    };

    const TEST_SECRET: &str = "tessera_test_secret_that_is_definitely_long_enough";

    struct Fixture {
        app: Router,
        hub: Hub,
        service_token: String,
        jwt_service: Arc<JwtAccessTokenService>,
    }

    fn fixture() -> Fixture {
        let jwt_service =
            Arc::new(JwtAccessTokenService::new(TEST_SECRET).expect("service should initialize"));
        let hub = Hub::new(Duration::from_secs(60), Arc::new(HubMetrics::default()));
        let app = router(Arc::clone(&jwt_service), EventRouter::with_hub(hub.clone()));
        let service_token = jwt_service.issue_service_token("comments-api").expect("token");

        Fixture { app, hub, service_token, jwt_service }
    }

    async fn connect(
        hub: &Hub,
        workspace_id: &str,
        user_id: &str,
    ) -> (uuid::Uuid, mpsc::UnboundedReceiver<OutboundFrame>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let identity = ConnectionIdentity {
            user_id: Some(user_id.to_string()),
            display_name: user_id.to_string(),
        };
        (hub.join(workspace_id, identity, sender).await, receiver)
    }

    fn request(method: Method, uri: &str, token: &str, body: Option<Value>) -> Request<Body> {
        let builder = Request::builder()
            .method(method)
            .uri(uri)
            .header(AUTHORIZATION, format!("Bearer {token}"))
            .header("content-type", "application/json");
        let body = body.map(|value| Body::from(value.to_string())).unwrap_or_else(Body::empty);
        builder.body(body).expect("request should build")
    }

    async fn json_body(response: axum::response::Response) -> Value {
        let body = to_bytes(response.into_body(), usize::MAX).await.expect("body");
        serde_json::from_slice(&body).expect("json body")
    }

    #[tokio::test]
    async fn workspace_event_is_relayed_verbatim() {
        let fixture = fixture();
        let (_id, mut receiver) = connect(&fixture.hub, "w1", "ann").await;
        let event = json!({"type": "comment", "comment": {"id": "c1", "body": "hi"}});

        let response = fixture
            .app
            .oneshot(request(
                Method::POST,
                "/v1/workspaces/w1/events",
                &fixture.service_token,
                Some(json!({ "event": event })),
            ))
            .await
            .expect("response");

        assert_eq!(response.status(), StatusCode::ACCEPTED);
        assert_eq!(json_body(response).await, json!({"delivered": 1}));
        let frame = receiver.try_recv().expect("event delivered");
        let relayed: Value = serde_json::from_str(frame.as_str()).expect("json frame");
        assert_eq!(relayed, event);
    }

    #[tokio::test]
    async fn canvas_scoped_event_reaches_only_viewers() {
        let fixture = fixture();
        let (ann, mut ann_rx) = connect(&fixture.hub, "w1", "ann").await;
        let (_bob, mut bob_rx) = connect(&fixture.hub, "w1", "bob").await;
        fixture
            .hub
            .handle_client_message(ann, ClientMessage::CanvasJoin { canvas_id: "c1".into() })
            .await;
        while ann_rx.try_recv().is_ok() {}
        while bob_rx.try_recv().is_ok() {}

        let response = fixture
            .app
            .oneshot(request(
                Method::POST,
                "/v1/workspaces/w1/events",
                &fixture.service_token,
                Some(json!({"event": {"type": "canvas_edit"}, "canvas_id": "c1"})),
            ))
            .await
            .expect("response");

        assert_eq!(json_body(response).await["delivered"], 1);
        assert!(ann_rx.try_recv().is_ok());
        assert!(bob_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn user_event_reaches_that_user_only() {
        let fixture = fixture();
        let (_ann, mut ann_rx) = connect(&fixture.hub, "w1", "ann").await;
        let (_bob, mut bob_rx) = connect(&fixture.hub, "w2", "bob").await;

        let response = fixture
            .app
            .oneshot(request(
                Method::POST,
                "/v1/users/bob/events",
                &fixture.service_token,
                Some(json!({"event": {"type": "notification", "id": "n1"}})),
            ))
            .await
            .expect("response");

        assert_eq!(response.status(), StatusCode::ACCEPTED);
        assert_eq!(json_body(response).await["delivered"], 1);
        assert_eq!(
            serde_json::from_str::<Value>(bob_rx.try_recv().expect("delivered").as_str())
                .expect("json")["type"],
            "notification"
        );
        assert!(ann_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn non_object_event_is_a_validation_error() {
        let fixture = fixture();

        let response = fixture
            .app
            .oneshot(request(
                Method::POST,
                "/v1/workspaces/w1/events",
                &fixture.service_token,
                Some(json!({"event": "comment"})),
            ))
            .await
            .expect("response");

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(json_body(response).await["error"]["code"], "VALIDATION_FAILED");
    }

    #[tokio::test]
    async fn user_access_tokens_cannot_publish() {
        let fixture = fixture();
        let access = fixture.jwt_service.issue_access_token("ann", None).expect("token");

        let response = fixture
            .app
            .oneshot(request(
                Method::POST,
                "/v1/workspaces/w1/events",
                &access,
                Some(json!({"event": {"type": "comment"}})),
            ))
            .await
            .expect("response");

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn snapshots_list_members_viewers_and_locks() {
        let fixture = fixture();
        let (ann, _ann_rx) = connect(&fixture.hub, "w1", "ann").await;
        let (_bob, _bob_rx) = connect(&fixture.hub, "w1", "bob").await;
        fixture
            .hub
            .handle_client_message(ann, ClientMessage::CanvasJoin { canvas_id: "c1".into() })
            .await;
        fixture
            .hub
            .handle_client_message(
                ann,
                ClientMessage::CanvasLockRequest {
                    action: tessera_common::protocol::ws::LockRequestAction::Acquire,
                    frame_id: "f1".into(),
                },
            )
            .await;

        let members = fixture
            .app
            .clone()
            .oneshot(request(
                Method::GET,
                "/v1/workspaces/w1/members",
                &fixture.service_token,
                None,
            ))
            .await
            .expect("response");
        assert_eq!(members.status(), StatusCode::OK);
        let members = json_body(members).await;
        assert_eq!(members["members"].as_array().map(Vec::len), Some(2));
        assert_eq!(members["members"][0]["userId"], "ann");
        assert_eq!(members["workspaceId"], "w1");
        assert!(members.get("workspace_id").is_none());

        let viewers = fixture
            .app
            .oneshot(request(
                Method::GET,
                "/v1/workspaces/w1/canvases/c1/viewers",
                &fixture.service_token,
                None,
            ))
            .await
            .expect("response");
        let viewers = json_body(viewers).await;
        assert_eq!(viewers["viewers"].as_array().map(Vec::len), Some(1));
        assert_eq!(viewers["workspaceId"], "w1");
        assert_eq!(viewers["canvasId"], "c1");
        assert_eq!(viewers["locks"][0]["frameId"], "f1");
        assert_eq!(viewers["locks"][0]["ownerId"], "ann");
    }
}
