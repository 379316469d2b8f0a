use axum::{extract::State, http::StatusCode, Json};
use serde_json::{json, Value};
use tracing::info;

use crate::{
    error::{AppError, AppResult},
    middleware::{
        auth::AuthenticatedUser,
        rate_limit::{check_rate_limit, login_key, LOGIN_MAX_ATTEMPTS, LOGIN_WINDOW_SECS},
    },
    models::{
        identity::{LoginRequest, ProviderUser, RefreshTokenRequest, RegisterRequest, TokenBundle},
        profile::ProfileResponse,
    },
    AppState,
};

pub async fn login(
    State(state): State<AppState>,
    Json(body): Json<LoginRequest>,
) -> AppResult<Json<TokenBundle>> {
    if body.username.trim().is_empty() || body.password.is_empty() {
        return Err(AppError::Validation("username and password are required".into()));
    }

    check_rate_limit(
        state.login_attempts.as_ref(),
        &login_key(&body.username),
        LOGIN_MAX_ATTEMPTS,
        LOGIN_WINDOW_SECS,
    )
    .await?;

    let bundle = state.identity.login(body.username.trim(), &body.password).await?;
    info!(username = %body.username.trim(), "login succeeded");
    Ok(Json(bundle))
}

pub async fn refresh(
    State(state): State<AppState>,
    Json(body): Json<RefreshTokenRequest>,
) -> AppResult<Json<TokenBundle>> {
    if body.refresh_token.is_empty() {
        return Err(AppError::Validation("refresh_token is required".into()));
    }
    Ok(Json(state.identity.refresh(&body.refresh_token).await?))
}

/// Creates the user at the identity provider only; the local profile appears
/// on the user's first authenticated profile fetch.
pub async fn register(
    State(state): State<AppState>,
    Json(body): Json<RegisterRequest>,
) -> AppResult<(StatusCode, Json<Value>)> {
    body.validate().map_err(AppError::InvalidUserData)?;

    let id = state.identity.create_user(&body).await?;
    Ok((
        StatusCode::CREATED,
        Json(json!({
            "id": id,
            "username": body.user_name.trim(),
            "email": body.email.trim(),
        })),
    ))
}

pub async fn profile(State(state): State<AppState>, user: AuthenticatedUser) -> AppResult<Json<ProfileResponse>> {
    let outcome = state.reconciler.reconcile(&user.claims).await?;
    Ok(Json(ProfileResponse {
        profile: outcome.profile,
        created: outcome.created,
        warnings: outcome.warnings,
    }))
}

pub async fn userinfo(State(state): State<AppState>, user: AuthenticatedUser) -> AppResult<Json<Value>> {
    Ok(Json(state.identity.user_info(&user.token).await?))
}

pub async fn list_users(State(state): State<AppState>) -> AppResult<Json<Vec<ProviderUser>>> {
    Ok(Json(state.identity.list_users().await?))
}
