use crate::{
    auth::jwt::JwtAccessTokenService,
    error::{ErrorCode, HubError},
};
use axum::{
    extract::{Request, State},
    http::header::AUTHORIZATION,
    middleware::Next,
    response::{IntoResponse, Response},
};
use std::sync::Arc;
use tracing::warn;

/// Backend collaborator authenticated by a service-class bearer token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthenticatedService {
    pub name: String,
}

pub async fn require_service_auth(
    State(jwt_service): State<Arc<JwtAccessTokenService>>,
    mut request: Request,
    next: Next,
) -> Response {
    let token = match request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(extract_bearer_token)
    {
        Some(token) => token,
        None => return unauthorized_response("missing bearer token"),
    };

    let name = match jwt_service.validate_service_token(token) {
        Ok(name) => name,
        Err(error) => {
            warn!(error = %error, path = %request.uri().path(), "rejected service token");
            return unauthorized_response("invalid bearer token");
        }
    };

    request.extensions_mut().insert(AuthenticatedService { name });

    next.run(request).await
}

pub(crate) fn extract_bearer_token(value: &str) -> Option<&str> {
    let (scheme, token) = value.split_once(' ')?;

    if !scheme.eq_ignore_ascii_case("Bearer") {
        return None;
    }

    let token = token.trim();
    if token.is_empty() {
        return None;
    }

    Some(token)
}

fn unauthorized_response(message: &'static str) -> Response {
    HubError::new(ErrorCode::AuthInvalidToken, message).into_response()
}
