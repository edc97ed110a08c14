use std::sync::Arc;

use axum::response::{IntoResponse, Response};
use serde::Deserialize;
use thiserror::Error;
use tracing::{error, warn};

use crate::{
    auth::jwt::JwtAccessTokenService,
    error::{ErrorCode, HubError},
    hub::registry::ConnectionIdentity,
    membership::WorkspaceMembershipStore,
};

pub const ANONYMOUS_DISPLAY_NAME: &str = "Anonymous";

/// Query parameters accepted on `GET /ws/{workspace_id}`.
///
/// `userId`/`displayName` are only honoured in development bypass mode and
/// only when no token is supplied.
#[derive(Debug, Default, Clone, Deserialize)]
pub struct UpgradeQuery {
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default, rename = "userId")]
    pub user_id: Option<String>,
    #[serde(default, rename = "displayName")]
    pub display_name: Option<String>,
}

#[derive(Debug, Error)]
pub enum UpgradeRejection {
    #[error("missing access token")]
    MissingToken,
    #[error("invalid access token")]
    InvalidToken,
    #[error("user {user_id} is not a member of workspace {workspace_id}")]
    NotMember { workspace_id: String, user_id: String },
    #[error("workspace membership lookup failed: {0:#}")]
    MembershipLookup(anyhow::Error),
}

impl UpgradeRejection {
    pub fn error_code(&self) -> ErrorCode {
        match self {
            Self::MissingToken | Self::InvalidToken => ErrorCode::AuthInvalidToken,
            Self::NotMember { .. } => ErrorCode::AuthForbidden,
            Self::MembershipLookup(_) => ErrorCode::InternalError,
        }
    }
}

impl IntoResponse for UpgradeRejection {
    fn into_response(self) -> Response {
        let code = self.error_code();
        let message = match &self {
            Self::MembershipLookup(_) => code.default_message().to_string(),
            other => other.to_string(),
        };

        HubError::new(code, message).into_response()
    }
}

/// Admission gate run before a websocket upgrade is accepted.
#[derive(Clone)]
pub struct UpgradeAuthenticator {
    jwt_service: Arc<JwtAccessTokenService>,
    membership: WorkspaceMembershipStore,
    dev_auth_bypass: bool,
}

impl UpgradeAuthenticator {
    pub fn new(
        jwt_service: Arc<JwtAccessTokenService>,
        membership: WorkspaceMembershipStore,
        dev_auth_bypass: bool,
    ) -> Self {
        Self { jwt_service, membership, dev_auth_bypass }
    }

    pub fn dev_auth_bypass(&self) -> bool {
        self.dev_auth_bypass
    }

    /// Resolve the identity a socket will carry for its whole lifetime.
    ///
    /// A supplied token is always verified, even in bypass mode, so a stale
    /// or forged token can never degrade into an anonymous session.
    pub async fn authenticate(
        &self,
        workspace_id: &str,
        query: &UpgradeQuery,
    ) -> Result<ConnectionIdentity, UpgradeRejection> {
        // Only an absent or empty parameter counts as "no token"; anything
        // else, whitespace included, must validate.
        let token = query.token.as_deref().filter(|token| !token.is_empty());

        let Some(token) = token else {
            if self.dev_auth_bypass {
                return Ok(bypass_identity(query));
            }
            warn!(workspace_id = %workspace_id, "rejected websocket upgrade without token");
            return Err(UpgradeRejection::MissingToken);
        };

        let identity = self.jwt_service.validate_access_token(token).map_err(|error| {
            warn!(
                workspace_id = %workspace_id,
                error = %error,
                "rejected websocket upgrade with invalid token"
            );
            UpgradeRejection::InvalidToken
        })?;

        let role = self
            .membership
            .role_for_user(workspace_id, &identity.user_id)
            .await
            .map_err(|lookup_error| {
                error!(
                    workspace_id = %workspace_id,
                    user_id = %identity.user_id,
                    error = ?lookup_error,
                    "workspace membership lookup failed"
                );
                UpgradeRejection::MembershipLookup(lookup_error)
            })?;

        if role.is_none() {
            warn!(
                workspace_id = %workspace_id,
                user_id = %identity.user_id,
                "rejected websocket upgrade for non-member"
            );
            return Err(UpgradeRejection::NotMember {
                workspace_id: workspace_id.to_string(),
                user_id: identity.user_id,
            });
        }

        let display_name = identity.display_name.unwrap_or_else(|| identity.user_id.clone());
        Ok(ConnectionIdentity { user_id: Some(identity.user_id), display_name })
    }
}

fn bypass_identity(query: &UpgradeQuery) -> ConnectionIdentity {
    let user_id = non_blank(query.user_id.as_deref());
    let display_name = non_blank(query.display_name.as_deref())
        .or_else(|| user_id.clone())
        .unwrap_or_else(|| ANONYMOUS_DISPLAY_NAME.to_string());

    ConnectionIdentity { user_id, display_name }
}

fn non_blank(value: Option<&str>) -> Option<String> {
    value.map(str::trim).filter(|value| !value.is_empty()).map(ToOwned::to_owned)
}
