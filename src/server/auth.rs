//! Password hashing, token minting and the bearer-token middleware.

use axum::{
    extract::{Request, State},
    http::header,
    middleware::Next,
    response::Response,
};
use bcrypt::{hash, verify, DEFAULT_COST};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};

use super::state::AppState;
use super::ApiError;
use crate::credential::Claims;

pub fn hash_password(password: &str) -> Result<String, bcrypt::BcryptError> {
    hash(password, DEFAULT_COST)
}

pub fn verify_password(password: &str, hash: &str) -> bool {
    verify(password, hash).unwrap_or(false)
}

pub fn create_jwt(
    user_id: &str,
    email: &str,
    is_admin: bool,
    secret: &str,
    ttl_secs: u64,
) -> Result<String, jsonwebtoken::errors::Error> {
    let claims = Claims {
        sub: user_id.to_owned(),
        email: email.to_owned(),
        is_admin,
        exp: chrono::Utc::now().timestamp() + ttl_secs as i64,
    };
    encode(&Header::default(), &claims, &EncodingKey::from_secret(secret.as_bytes()))
}

pub fn validate_jwt(token: &str, secret: &str) -> Result<Claims, jsonwebtoken::errors::Error> {
    let data = decode::<Claims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &Validation::new(Algorithm::HS256),
    )?;
    Ok(data.claims)
}

/// Authenticated caller, resolved against the user table on every request.
#[derive(Debug, Clone)]
pub struct AuthUser {
    pub id: String,
    pub email: String,
    pub is_admin: bool,
}

pub async fn auth_middleware(
    State(state): State<AppState>,
    mut req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let token = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .ok_or_else(|| ApiError::unauthorized("missing auth token"))?;

    let claims = validate_jwt(token, &state.config.jwt_secret).map_err(|e| {
        tracing::debug!(error = %e, "rejected bearer token");
        ApiError::unauthorized("invalid token")
    })?;
    let user = state
        .store
        .user(&claims.sub)
        .ok_or_else(|| ApiError::unauthorized("invalid token"))?;

    req.extensions_mut().insert(AuthUser {
        id: user.id,
        email: user.email,
        is_admin: user.is_admin,
    });
    Ok(next.run(req).await)
}

/// Admin routes trust the stored user record, never the token's claim.
pub async fn require_admin(req: Request, next: Next) -> Result<Response, ApiError> {
    match req.extensions().get::<AuthUser>() {
        Some(user) if user.is_admin => Ok(next.run(req).await),
        Some(_) => Err(ApiError::forbidden("admin only")),
        None => Err(ApiError::unauthorized("missing auth token")),
    }
}
