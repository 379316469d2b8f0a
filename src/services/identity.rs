use std::{
    future::Future,
    time::{Duration, Instant},
};

use reqwest::{header, Client, Response, StatusCode};
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::{
    config::{AdminGrant, KeycloakConfig},
    error::{AppError, AppResult},
    models::identity::{
        AdminErrorBody, AdminSession, CreateUserPayload, PasswordCredential, ProviderErrorBody,
        ProviderUser, ProviderUserId, RegisterRequest, TokenBundle,
    },
    services::metrics::{ADMIN_GRANTS_COUNTER, LOGINS_COUNTER},
};

/// Admin tokens are dropped this long before the provider says they expire.
const ADMIN_TOKEN_MARGIN: Duration = Duration::from_secs(5);

/// Page size used when walking the admin users endpoint.
const USERS_PAGE_SIZE: usize = 100;

/// Upper bound on pages fetched by one `list_users` call.
const USERS_MAX_PAGES: usize = 1_000;

/// Single-flight cache of the administrative bearer token.
///
/// The slot lock is held across the grant request, so callers arriving while
/// a refresh is in flight wait for it and then reuse its result.
pub struct AdminTokenCache {
    slot: Mutex<Option<AdminSession>>,
}

impl AdminTokenCache {
    pub fn new() -> Self {
        Self { slot: Mutex::new(None) }
    }

    pub async fn get_or_refresh<F, Fut>(&self, grant: F) -> AppResult<AdminSession>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = AppResult<AdminSession>>,
    {
        let mut slot = self.slot.lock().await;
        if let Some(session) = slot.as_ref() {
            if session.is_valid_at(Instant::now()) {
                return Ok(session.clone());
            }
        }

        let fresh = grant().await?;
        *slot = Some(fresh.clone());
        Ok(fresh)
    }

    /// Drops the cached token, but only if it is still the one that was rejected.
    pub async fn invalidate(&self, rejected_token: &str) {
        let mut slot = self.slot.lock().await;
        if slot.as_ref().is_some_and(|s| s.token == rejected_token) {
            *slot = None;
        }
    }
}

impl Default for AdminTokenCache {
    fn default() -> Self {
        Self::new()
    }
}

/// Why a token-endpoint call failed before it could be mapped to an `AppError`.
#[derive(Debug)]
enum GrantFailure {
    Unreachable(String),
    Provider(ProviderErrorBody),
    Malformed { status: StatusCode, detail: String },
}

/// Typed wrapper over the provider's token, userinfo and admin user endpoints.
pub struct IdentityClient {
    http: Client,
    config: KeycloakConfig,
    admin_cache: AdminTokenCache,
}

impl IdentityClient {
    /// Every outbound call is bounded by `timeout`.
    pub fn new(config: KeycloakConfig, timeout: Duration) -> anyhow::Result<Self> {
        let http = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            config,
            admin_cache: AdminTokenCache::new(),
        })
    }

    pub fn config(&self) -> &KeycloakConfig {
        &self.config
    }

    /// Resource-owner password grant with the service's confidential client.
    pub async fn login(&self, username: &str, password: &str) -> AppResult<TokenBundle> {
        let form = [
            ("grant_type", "password"),
            ("client_id", self.config.client_id.as_str()),
            ("client_secret", self.config.client_secret.as_str()),
            ("username", username),
            ("password", password),
            ("scope", "openid"),
        ];

        let result = self.token_grant(&self.config.token_url(), &form).await;
        let status = if result.is_ok() { "success" } else { "failure" };
        LOGINS_COUNTER.with_label_values(&[status]).inc();

        result.map_err(|failure| match failure {
            GrantFailure::Provider(body) if is_bad_credentials(&body) => {
                info!(%username, "login rejected by identity provider");
                AppError::InvalidCredentials
            }
            other => map_grant_failure(other),
        })
    }

    /// Refresh-token grant; any `invalid_grant` means the refresh token is unusable.
    pub async fn refresh(&self, refresh_token: &str) -> AppResult<TokenBundle> {
        let form = [
            ("grant_type", "refresh_token"),
            ("client_id", self.config.client_id.as_str()),
            ("client_secret", self.config.client_secret.as_str()),
            ("refresh_token", refresh_token),
        ];

        self.token_grant(&self.config.token_url(), &form)
            .await
            .map_err(|failure| match failure {
                GrantFailure::Provider(body) if body.error == "invalid_grant" => AppError::InvalidRefreshToken,
                other => map_grant_failure(other),
            })
    }

    /// Cached admin token, re-acquired when expired.
    pub async fn admin_token(&self) -> AppResult<AdminSession> {
        self.admin_cache.get_or_refresh(|| self.admin_grant()).await
    }

    async fn admin_grant(&self) -> AppResult<AdminSession> {
        let url = self.config.admin_token_url();
        let result = match &self.config.admin {
            AdminGrant::ClientCredentials { client_id, client_secret } => {
                let form = [
                    ("grant_type", "client_credentials"),
                    ("client_id", client_id.as_str()),
                    ("client_secret", client_secret.as_str()),
                ];
                self.token_grant(&url, &form).await
            }
            AdminGrant::Password { username, password, .. } => {
                let form = [
                    ("grant_type", "password"),
                    ("client_id", "admin-cli"),
                    ("username", username.as_str()),
                    ("password", password.as_str()),
                ];
                self.token_grant(&url, &form).await
            }
        };

        match result {
            Ok(bundle) => {
                ADMIN_GRANTS_COUNTER.with_label_values(&["success"]).inc();
                info!(expires_in = bundle.expires_in, "acquired admin token");
                let lifetime = Duration::from_secs(bundle.expires_in).saturating_sub(ADMIN_TOKEN_MARGIN);
                Ok(AdminSession {
                    token: bundle.access_token,
                    expires_at: Instant::now() + lifetime,
                })
            }
            Err(failure) => {
                ADMIN_GRANTS_COUNTER.with_label_values(&["failure"]).inc();
                warn!(?failure, "admin token grant failed");
                Err(map_grant_failure(failure))
            }
        }
    }

    /// Creates an enabled provider user with a permanent password credential.
    pub async fn create_user(&self, input: &RegisterRequest) -> AppResult<ProviderUserId> {
        let session = self.admin_token().await?;
        let payload = CreateUserPayload {
            username: input.user_name.trim(),
            email: input.email.trim(),
            first_name: &input.first_name,
            last_name: &input.last_name,
            enabled: true,
            credentials: [PasswordCredential {
                kind: "password",
                value: &input.password,
                temporary: false,
            }],
        };

        let response = self
            .http
            .post(self.config.admin_users_url())
            .bearer_auth(&session.token)
            .json(&payload)
            .send()
            .await
            .map_err(unreachable)?;

        let status = response.status();
        if status.is_success() {
            let from_location = response
                .headers()
                .get(header::LOCATION)
                .and_then(|v| v.to_str().ok())
                .and_then(|loc| loc.trim_end_matches('/').rsplit('/').next())
                .filter(|id| !id.is_empty())
                .map(str::to_string);

            let id = match from_location {
                Some(id) => id,
                None => self.find_user_id(&session, payload.username).await?,
            };
            info!(username = %payload.username, provider_id = %id, "created identity provider user");
            return Ok(ProviderUserId(id));
        }

        let body = read_admin_error(response).await;
        let message = body.message().map(str::to_string);
        Err(match status {
            StatusCode::CONFLICT => {
                AppError::UserAlreadyExists(message.unwrap_or_else(|| payload.username.to_string()))
            }
            StatusCode::BAD_REQUEST => {
                AppError::InvalidUserData(message.unwrap_or_else(|| "Rejected by identity provider".into()))
            }
            _ => self.admin_failure(&session, status, message).await,
        })
    }

    async fn find_user_id(&self, session: &AdminSession, username: &str) -> AppResult<String> {
        let response = self
            .http
            .get(self.config.admin_users_url())
            .bearer_auth(&session.token)
            .query(&[("username", username), ("exact", "true")])
            .send()
            .await
            .map_err(unreachable)?;

        let status = response.status();
        if !status.is_success() {
            let message = read_admin_error(response).await.message().map(str::to_string);
            return Err(self.admin_failure(session, status, message).await);
        }

        let users: Vec<ProviderUser> = response.json().await.map_err(|e| AppError::AdminOperationFailed {
            status: status.as_u16(),
            message: format!("Unreadable user list: {e}"),
        })?;
        users
            .into_iter()
            .find(|u| u.username.eq_ignore_ascii_case(username))
            .map(|u| u.id)
            .ok_or_else(|| AppError::AdminOperationFailed {
                status: status.as_u16(),
                message: format!("User {username} was created but could not be found"),
            })
    }

    /// Every provider user, walked page by page.
    pub async fn list_users(&self) -> AppResult<Vec<ProviderUser>> {
        let session = self.admin_token().await?;
        let max = USERS_PAGE_SIZE.to_string();
        let mut users: Vec<ProviderUser> = Vec::new();

        for _ in 0..USERS_MAX_PAGES {
            let first = users.len().to_string();
            let response = self
                .http
                .get(self.config.admin_users_url())
                .bearer_auth(&session.token)
                .query(&[("first", first.as_str()), ("max", max.as_str())])
                .send()
                .await
                .map_err(unreachable)?;

            let status = response.status();
            if status == StatusCode::NOT_FOUND {
                break;
            }
            if !status.is_success() {
                let message = read_admin_error(response).await.message().map(str::to_string);
                return Err(self.admin_failure(&session, status, message).await);
            }

            let page: Vec<ProviderUser> = response.json().await.map_err(|e| AppError::AdminOperationFailed {
                status: status.as_u16(),
                message: format!("Unreadable user list: {e}"),
            })?;
            // A provider that ignores `first` keeps serving the same page.
            let repeated = match (users.last(), page.last()) {
                (Some(prev), Some(last)) => prev.id == last.id,
                _ => false,
            };
            if repeated {
                warn!(fetched = users.len(), "user listing repeated a page, stopping");
                return Ok(users);
            }

            let last_page = page.len() < USERS_PAGE_SIZE;
            users.extend(page);
            if last_page {
                return Ok(users);
            }
        }

        warn!(fetched = users.len(), "user listing hit the page limit");
        Ok(users)
    }

    /// Forwards the caller's own access token to the userinfo endpoint.
    pub async fn user_info(&self, access_token: &str) -> AppResult<serde_json::Value> {
        let response = self
            .http
            .get(self.config.userinfo_url())
            .bearer_auth(access_token)
            .send()
            .await
            .map_err(unreachable)?;

        let status = response.status();
        if status.is_success() {
            return response.json().await.map_err(|e| AppError::AuthBackendError {
                code: status.as_u16().to_string(),
                description: format!("Unreadable userinfo response: {e}"),
            });
        }

        Err(match response.json::<ProviderErrorBody>().await {
            Ok(body) => AppError::AuthBackendError {
                description: body.error_description.unwrap_or_else(|| body.error.clone()),
                code: body.error,
            },
            Err(_) => AppError::AuthBackendError {
                code: status.as_u16().to_string(),
                description: "Userinfo request rejected".into(),
            },
        })
    }

    /// Maps an admin-endpoint status that is not specific to the operation.
    async fn admin_failure(&self, session: &AdminSession, status: StatusCode, message: Option<String>) -> AppError {
        match status {
            StatusCode::FORBIDDEN => AppError::InsufficientAdminPermissions,
            StatusCode::UNAUTHORIZED => {
                self.admin_cache.invalidate(&session.token).await;
                AppError::AdminOperationFailed {
                    status: status.as_u16(),
                    message: message.unwrap_or_else(|| "Admin token rejected".into()),
                }
            }
            _ => AppError::AdminOperationFailed {
                status: status.as_u16(),
                message: message.unwrap_or_else(|| status.to_string()),
            },
        }
    }

    async fn token_grant(&self, url: &str, form: &[(&str, &str)]) -> Result<TokenBundle, GrantFailure> {
        let response = self
            .http
            .post(url)
            .form(form)
            .send()
            .await
            .map_err(|e| GrantFailure::Unreachable(e.without_url().to_string()))?;

        let status = response.status();
        if status.is_success() {
            return response.json::<TokenBundle>().await.map_err(|e| GrantFailure::Malformed {
                status,
                detail: format!("Unreadable token response: {e}"),
            });
        }

        let text = response.text().await.unwrap_or_default();
        match serde_json::from_str::<ProviderErrorBody>(&text) {
            Ok(body) => Err(GrantFailure::Provider(body)),
            Err(_) => Err(GrantFailure::Malformed {
                status,
                detail: if text.is_empty() { status.to_string() } else { text },
            }),
        }
    }
}

/// `invalid_grant` whose description points at the user's credentials or account state.
fn is_bad_credentials(body: &ProviderErrorBody) -> bool {
    if body.error != "invalid_grant" {
        return false;
    }
    let description = body.error_description.as_deref().unwrap_or_default().to_lowercase();
    description.contains("invalid user credentials")
        || description.contains("invalid credentials")
        || description.contains("disabled")
        || description.contains("not fully set up")
}

fn map_grant_failure(failure: GrantFailure) -> AppError {
    match failure {
        GrantFailure::Unreachable(reason) => AppError::AuthBackendUnreachable(reason),
        GrantFailure::Provider(body) => AppError::AuthBackendError {
            description: body.error_description.unwrap_or_default(),
            code: body.error,
        },
        GrantFailure::Malformed { status, detail } => AppError::AuthBackendError {
            code: status.as_u16().to_string(),
            description: detail,
        },
    }
}

fn unreachable(e: reqwest::Error) -> AppError {
    AppError::AuthBackendUnreachable(e.without_url().to_string())
}

async fn read_admin_error(response: Response) -> AdminErrorBody {
    response.json::<AdminErrorBody>().await.unwrap_or_default()
}
