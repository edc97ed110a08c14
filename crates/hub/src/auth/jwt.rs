use anyhow::{anyhow, bail, Context};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

pub const ACCESS_TOKEN_TTL_SECONDS: i64 = 15 * 60;
pub const REFRESH_TOKEN_TTL_SECONDS: i64 = 30 * 24 * 60 * 60;
pub const SERVICE_TOKEN_TTL_SECONDS: i64 = 60 * 60;

/// Token class carried in the `token_type` claim.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenType {
    Access,
    Refresh,
    Service,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct TokenClaims {
    sub: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    name: Option<String>,
    token_type: TokenType,
    iat: i64,
    exp: i64,
}

/// Identity proven by a valid access token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessIdentity {
    pub user_id: String,
    pub display_name: Option<String>,
}

#[derive(Clone)]
pub struct JwtAccessTokenService {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    validation: Validation,
}

impl JwtAccessTokenService {
    pub fn new(secret: &str) -> anyhow::Result<Self> {
        if secret.len() < 32 {
            bail!("jwt secret must be at least 32 characters long");
        }

        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = true;
        validation.leeway = 0;
        validation.set_required_spec_claims(&["exp", "sub"]);

        Ok(Self {
            encoding_key: EncodingKey::from_secret(secret.as_bytes()),
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
            validation,
        })
    }

    pub fn issue_access_token(
        &self,
        user_id: &str,
        display_name: Option<&str>,
    ) -> anyhow::Result<String> {
        self.issue_at(
            user_id,
            display_name,
            TokenType::Access,
            current_unix_timestamp()?,
            ACCESS_TOKEN_TTL_SECONDS,
        )
    }

    pub fn issue_refresh_token(&self, user_id: &str) -> anyhow::Result<String> {
        self.issue_at(
            user_id,
            None,
            TokenType::Refresh,
            current_unix_timestamp()?,
            REFRESH_TOKEN_TTL_SECONDS,
        )
    }

    /// Token for backend collaborators pushing events through the ingress API.
    pub fn issue_service_token(&self, service_name: &str) -> anyhow::Result<String> {
        self.issue_at(
            service_name,
            None,
            TokenType::Service,
            current_unix_timestamp()?,
            SERVICE_TOKEN_TTL_SECONDS,
        )
    }

    fn issue_at(
        &self,
        subject: &str,
        display_name: Option<&str>,
        token_type: TokenType,
        issued_at: i64,
        ttl_seconds: i64,
    ) -> anyhow::Result<String> {
        if subject.trim().is_empty() {
            bail!("token subject must not be empty");
        }

        let claims = TokenClaims {
            sub: subject.to_string(),
            name: display_name.map(ToOwned::to_owned),
            token_type,
            iat: issued_at,
            exp: issued_at + ttl_seconds,
        };

        encode(&Header::new(Algorithm::HS256), &claims, &self.encoding_key)
            .context("failed to encode token")
    }

    /// Validate signature, expiry and class of a user access token.
    pub fn validate_access_token(&self, token: &str) -> anyhow::Result<AccessIdentity> {
        let claims = self.validate(token, TokenType::Access)?;
        let display_name = claims.name.filter(|name| !name.trim().is_empty());

        Ok(AccessIdentity { user_id: claims.sub, display_name })
    }

    /// Validate a service token and return the calling service's name.
    pub fn validate_service_token(&self, token: &str) -> anyhow::Result<String> {
        Ok(self.validate(token, TokenType::Service)?.sub)
    }

    fn validate(&self, token: &str, expected: TokenType) -> anyhow::Result<TokenClaims> {
        let claims = decode::<TokenClaims>(token, &self.decoding_key, &self.validation)
            .context("failed to decode token")?
            .claims;

        if claims.token_type != expected {
            bail!("expected a {expected:?} token, got {:?}", claims.token_type);
        }

        if claims.sub.trim().is_empty() {
            bail!("token subject is empty");
        }

        Ok(claims)
    }
}

fn current_unix_timestamp() -> anyhow::Result<i64> {
    let duration = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_err(|error| anyhow!("system clock is before unix epoch: {error}"))?;

    i64::try_from(duration.as_secs()).context("unix timestamp overflow")
}
