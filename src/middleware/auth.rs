use std::sync::Arc;

use axum::{
    extract::{FromRequestParts, Request, State},
    http::{header, request::Parts, HeaderMap},
    middleware::Next,
    response::Response,
};

use crate::{
    error::{AppError, AppResult},
    models::claims::ClaimsSet,
    services::claims::ClaimsValidator,
};

pub const ROLE_ADMIN: &str = "admin";
pub const ROLE_USER: &str = "user";

/// Caller identity established by [`require_auth`].
#[derive(Clone)]
pub struct AuthenticatedUser {
    pub claims: ClaimsSet,
    /// Raw bearer token, forwarded only to the provider's userinfo endpoint.
    pub token: String,
}

impl std::fmt::Debug for AuthenticatedUser {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthenticatedUser")
            .field("claims", &self.claims)
            .field("token", &"<redacted>")
            .finish()
    }
}

impl AuthenticatedUser {
    pub fn subject(&self) -> AppResult<&str> {
        self.claims.subject().ok_or(AppError::MissingSubject)
    }
}

impl<S> FromRequestParts<S> for AuthenticatedUser
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<AuthenticatedUser>()
            .cloned()
            .ok_or(AppError::MissingToken)
    }
}

pub fn bearer_token(headers: &HeaderMap) -> AppResult<&str> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .ok_or(AppError::MissingToken)
}

/// Verifies the bearer token and attaches the caller's claims to the request.
pub async fn require_auth(
    State(validator): State<Arc<ClaimsValidator>>,
    mut req: Request,
    next: Next,
) -> Result<Response, AppError> {
    let token = bearer_token(req.headers())?.to_string();
    let claims = validator.validate(&token).await?;
    req.extensions_mut().insert(AuthenticatedUser { claims, token });
    Ok(next.run(req).await)
}

/// Must run inside [`require_auth`].
pub async fn require_admin(req: Request, next: Next) -> Result<Response, AppError> {
    check_roles(&req, &[ROLE_ADMIN])?;
    Ok(next.run(req).await)
}

/// Customers are realm users or admins.
pub async fn require_customer(req: Request, next: Next) -> Result<Response, AppError> {
    check_roles(&req, &[ROLE_USER, ROLE_ADMIN])?;
    Ok(next.run(req).await)
}

fn check_roles(req: &Request, required: &[&str]) -> AppResult<()> {
    let user = req
        .extensions()
        .get::<AuthenticatedUser>()
        .ok_or(AppError::MissingToken)?;
    if user.claims.has_any_role(required) {
        Ok(())
    } else {
        Err(AppError::InsufficientRole(required.join(", ")))
    }
}
