use std::time::Duration;

use axum::http::HeaderMap;
use fieldsync_core::services::Caller;
use fieldsync_core::Role;
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::Deserialize;

use crate::error::AppError;

#[derive(Debug, Clone)]
pub struct AuthenticatedUser {
    pub user_id: String,
    pub role: Role,
}

impl AuthenticatedUser {
    pub fn caller(&self) -> Caller<'_> {
        Caller::new(&self.user_id, self.role)
    }
}

/// Verifies HS256 bearer tokens signed with the shared server secret.
#[derive(Clone)]
pub struct JwtVerifier {
    key: DecodingKey,
    clock_skew: Duration,
}

impl JwtVerifier {
    pub fn new(secret: &str, clock_skew: Duration) -> Self {
        Self {
            key: DecodingKey::from_secret(secret.as_bytes()),
            clock_skew,
        }
    }

    pub fn verify_access_token(&self, token: &str) -> Result<AuthenticatedUser, AppError> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_aud = false;
        validation.leeway = self.clock_skew.as_secs();
        validation.set_required_spec_claims(&["exp", "sub"]);

        let decoded = decode::<AccessClaims>(token, &self.key, &validation).map_err(|error| {
            AppError::unauthorized(format!("Token validation failed: {}", sanitize(&error)))
        })?;

        let subject = decoded.claims.sub.trim();
        if subject.is_empty() {
            return Err(AppError::unauthorized("Token subject is missing"));
        }
        validate_temporal_claims(&decoded.claims, self.clock_skew)?;

        Ok(AuthenticatedUser {
            user_id: subject.to_string(),
            // Tokens minted before roles existed belong to field workers.
            role: decoded.claims.role.unwrap_or_default(),
        })
    }
}

pub fn extract_bearer_token(headers: &HeaderMap) -> Result<&str, AppError> {
    let header = headers
        .get("authorization")
        .ok_or_else(|| AppError::unauthorized("Missing Authorization header"))?
        .to_str()
        .map_err(|_| AppError::unauthorized("Authorization header is not valid UTF-8"))?;

    let (scheme, token) = header
        .split_once(' ')
        .ok_or_else(|| AppError::unauthorized("Authorization header must be `Bearer <token>`"))?;

    if !scheme.eq_ignore_ascii_case("bearer") {
        return Err(AppError::unauthorized(
            "Authorization scheme must be `Bearer`",
        ));
    }
    let token = token.trim();
    if token.is_empty() {
        return Err(AppError::unauthorized("Bearer token is empty"));
    }

    Ok(token)
}

#[derive(Debug, Deserialize)]
struct AccessClaims {
    sub: String,
    #[serde(default)]
    role: Option<Role>,
    exp: Option<i64>,
    iat: Option<i64>,
    nbf: Option<i64>,
}

fn validate_temporal_claims(claims: &AccessClaims, clock_skew: Duration) -> Result<(), AppError> {
    let now = chrono::Utc::now().timestamp();
    let skew = i64::try_from(clock_skew.as_secs()).unwrap_or(0);

    let exp = claims
        .exp
        .ok_or_else(|| AppError::unauthorized("Token missing `exp` claim"))?;
    if exp <= now.saturating_sub(skew) {
        return Err(AppError::unauthorized("Token is expired"));
    }

    if let Some(iat) = claims.iat {
        if iat > now.saturating_add(skew) {
            return Err(AppError::unauthorized("Token `iat` is in the future"));
        }
    }

    if let Some(nbf) = claims.nbf {
        if nbf > now.saturating_add(skew) {
            return Err(AppError::unauthorized("Token is not yet valid"));
        }
    }

    Ok(())
}

fn sanitize(error: &impl std::fmt::Display) -> String {
    error.to_string().replace('\n', " ").trim().to_string()
}
