//! Test doubles: an in-process identity provider, token minting, and
//! in-memory collaborators for the reconciler and notifier.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use async_trait::async_trait;
use axum::{
    extract::{Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Form, Json, Router,
};
use chrono::Utc;
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use serde_json::{json, Value};
use tokio::sync::Barrier;
use uuid::Uuid;

use crate::{
    config::{AdminGrant, Config, KeycloakConfig},
    middleware::rate_limit::AttemptCounter,
    models::{
        identity::ProviderUser,
        profile::{LocalProfile, NewProfile, ProfileChanges, UniqueField},
    },
    services::{
        identity::IdentityClient,
        notifier::EventPublisher,
        profile_store::{ProfileStore, StoreError},
    },
};

pub const REALM: &str = "test";
pub const CLIENT_ID: &str = "auth-service";
pub const CLIENT_SECRET: &str = "svc-secret";
pub const ADMIN_CLIENT_ID: &str = "svc-admin";
pub const ADMIN_CLIENT_SECRET: &str = "svc-admin-secret";

pub const TEST_KID: &str = "test-key";
pub const TEST_PRIVATE_PEM: &str = include_str!("../tests/fixtures/test_rsa_private.pem");
pub const OTHER_PRIVATE_PEM: &str = include_str!("../tests/fixtures/other_rsa_private.pem");

const TEST_MODULUS: &str = "sqtUPPBa_5LiUazqflwuiU3FweqT_jJKylu1T77PC2KVXnRmFj3p7H6mFA8HG0vmUDGQmzxCoxTVBuuVJGzpr_qoe7KwOP36iU8vmhUamwDg4VnId7qIFkmngrgVWK3L1oP0LIdsQSXEaI83dyTdldLvugVX3jE0AYjrQ92G8miCDb4U1pFKdGt0WQ7WcX1-yJygM6MJV9Pfyb9g10cTx1mACuXJpsMwAWU0F32vd39VnkukJ0b6xAnO6ovyyU-g6tRiL4TBJTCWQwk5IpOOsa30mdPvqOyV1j3R5pvPi3XP4duDe__sTmbT9dMftmQ2MiT9GxgOIl-hJP1RwC9fSQ";

/// Key set served by the mock provider: one signing key, one encryption key.
pub fn test_jwks() -> Value {
    json!({
        "keys": [
            { "kid": TEST_KID, "kty": "RSA", "use": "sig", "alg": "RS256", "n": TEST_MODULUS, "e": "AQAB" },
            { "kid": "enc-key", "kty": "RSA", "use": "enc", "alg": "RSA-OAEP", "n": TEST_MODULUS, "e": "AQAB" },
        ]
    })
}

pub fn sign_token(claims: &Value) -> String {
    sign_token_with(TEST_PRIVATE_PEM, Some(TEST_KID), claims)
}

pub fn sign_token_with(pem: &str, kid: Option<&str>, claims: &Value) -> String {
    let mut header = Header::new(Algorithm::RS256);
    header.kid = kid.map(str::to_string);
    let key = EncodingKey::from_rsa_pem(pem.as_bytes()).unwrap();
    jsonwebtoken::encode(&header, claims, &key).unwrap()
}

/// Claims of a well-formed token for `subject` issued by `issuer`.
pub fn default_claims(issuer: &str, subject: &str) -> Value {
    json!({
        "sub": subject,
        "iss": issuer,
        "exp": Utc::now().timestamp() + 300,
        "preferred_username": "ann",
        "email": "ann@example.com",
        "given_name": "Ann",
        "family_name": "Lee",
        "realm_access": { "roles": ["user"] },
    })
}

/// Service configuration pointing at `keycloak`; the connection strings are never dialled.
pub fn test_config(keycloak: KeycloakConfig) -> Config {
    Config {
        database_url: "postgres://authsync@127.0.0.1:1/authsync".into(),
        redis_url: "redis://127.0.0.1:1".into(),
        host: "127.0.0.1".into(),
        port: 0,
        cors_origins: Vec::new(),
        keycloak,
        jwt_algorithm: Algorithm::RS256,
        jwt_leeway_seconds: 0,
        jwks_min_refresh: Duration::from_secs(60),
        idp_timeout: Duration::from_secs(5),
        notify_timeout: Duration::from_secs(1),
        event_stream_maxlen: 1_000,
        event_consumer_group: "test-group".into(),
        event_consumer_enabled: false,
        event_consumer_name: "test-consumer".into(),
    }
}

// ---------------------------------------------------------------------------
// Mock identity provider
// ---------------------------------------------------------------------------

pub struct IdpState {
    pub admin_grants: AtomicUsize,
    pub admin_expires_in: AtomicU64,
    pub omit_location: AtomicBool,
    pub reject_admin_tokens: AtomicBool,
    pub created_payloads: Mutex<Vec<Value>>,
    pub jwks_fetches: AtomicUsize,
    pub users: Mutex<Vec<ProviderUser>>,
}

impl Default for IdpState {
    fn default() -> Self {
        Self {
            admin_grants: AtomicUsize::new(0),
            admin_expires_in: AtomicU64::new(300),
            omit_location: AtomicBool::new(false),
            reject_admin_tokens: AtomicBool::new(false),
            created_payloads: Mutex::new(Vec::new()),
            jwks_fetches: AtomicUsize::new(0),
            users: Mutex::new(Vec::new()),
        }
    }
}

pub struct MockIdp {
    pub base_url: String,
    pub state: Arc<IdpState>,
}

impl MockIdp {
    pub async fn start() -> Self {
        let state = Arc::new(IdpState::default());
        let app = Router::new()
            .route("/realms/{realm}/protocol/openid-connect/token", post(token))
            .route("/realms/{realm}/protocol/openid-connect/certs", get(certs))
            .route("/realms/{realm}/protocol/openid-connect/userinfo", get(userinfo))
            .route("/admin/realms/{realm}/users", post(create_user).get(list_users))
            .with_state(state.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            base_url: format!("http://{addr}"),
            state,
        }
    }

    pub fn keycloak_config_for(base_url: &str) -> KeycloakConfig {
        KeycloakConfig {
            server_url: base_url.to_string(),
            realm: REALM.into(),
            client_id: CLIENT_ID.into(),
            client_secret: CLIENT_SECRET.into(),
            audience: None,
            admin: AdminGrant::ClientCredentials {
                client_id: ADMIN_CLIENT_ID.into(),
                client_secret: ADMIN_CLIENT_SECRET.into(),
            },
        }
    }

    pub fn keycloak_config(&self) -> KeycloakConfig {
        Self::keycloak_config_for(&self.base_url)
    }

    pub fn identity_client(&self) -> IdentityClient {
        IdentityClient::new(self.keycloak_config(), Duration::from_secs(5)).unwrap()
    }

    pub fn seed_users(&self, n: usize) {
        let mut users = self.state.users.lock().unwrap();
        for i in 0..n {
            users.push(ProviderUser {
                id: format!("seed-{i}"),
                username: format!("seed-user-{i}"),
                email: Some(format!("seed-{i}@example.com")),
                first_name: None,
                last_name: None,
                enabled: true,
            });
        }
    }
}

fn oauth_error(status: StatusCode, error: &str, description: &str) -> Response {
    (status, Json(json!({ "error": error, "error_description": description }))).into_response()
}

fn token_response(access: &str, refresh: Option<&str>, expires_in: u64) -> Response {
    Json(json!({
        "access_token": access,
        "refresh_token": refresh,
        "expires_in": expires_in,
        "refresh_expires_in": 1800,
        "token_type": "Bearer",
    }))
    .into_response()
}

async fn token(
    State(state): State<Arc<IdpState>>,
    Path(_realm): Path<String>,
    Form(form): Form<HashMap<String, String>>,
) -> Response {
    let field = |k: &str| form.get(k).map(String::as_str).unwrap_or_default();
    let is_admin_grant = match field("grant_type") {
        "client_credentials" => field("client_id") == ADMIN_CLIENT_ID && field("client_secret") == ADMIN_CLIENT_SECRET,
        "password" => field("client_id") == "admin-cli",
        _ => false,
    };

    if is_admin_grant {
        let n = state.admin_grants.fetch_add(1, Ordering::SeqCst) + 1;
        tokio::time::sleep(Duration::from_millis(50)).await;
        let expires_in = state.admin_expires_in.load(Ordering::SeqCst);
        return token_response(&format!("admin-token-{n}"), None, expires_in);
    }

    if field("client_id") != CLIENT_ID || field("client_secret") != CLIENT_SECRET {
        return oauth_error(StatusCode::UNAUTHORIZED, "invalid_client", "Invalid client credentials");
    }

    match field("grant_type") {
        "password" => match (field("username"), field("password")) {
            ("alice", "correct-horse") => token_response("user-access", Some("user-refresh"), 300),
            ("disabled", _) => oauth_error(StatusCode::BAD_REQUEST, "invalid_grant", "Account disabled"),
            ("weird", _) => oauth_error(StatusCode::BAD_REQUEST, "invalid_request", "Missing parameter: scope"),
            _ => oauth_error(StatusCode::UNAUTHORIZED, "invalid_grant", "Invalid user credentials"),
        },
        "refresh_token" if field("refresh_token") == "user-refresh" => {
            token_response("user-access", Some("user-refresh"), 300)
        }
        "refresh_token" => oauth_error(StatusCode::BAD_REQUEST, "invalid_grant", "Token is not active"),
        _ => oauth_error(StatusCode::BAD_REQUEST, "unsupported_grant_type", "Unsupported grant type"),
    }
}

async fn certs(State(state): State<Arc<IdpState>>) -> Json<Value> {
    state.jwks_fetches.fetch_add(1, Ordering::SeqCst);
    Json(test_jwks())
}

fn bearer(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
}

async fn userinfo(headers: HeaderMap) -> Response {
    match bearer(&headers) {
        Some("user-access") => Json(json!({
            "sub": "alice-sub",
            "preferred_username": "alice",
            "email": "alice@example.com",
        }))
        .into_response(),
        _ => oauth_error(StatusCode::UNAUTHORIZED, "invalid_token", "Token verification failed"),
    }
}

fn check_admin(state: &IdpState, headers: &HeaderMap) -> Option<Response> {
    let authorized = bearer(headers).is_some_and(|t| t.starts_with("admin-token"))
        && !state.reject_admin_tokens.load(Ordering::SeqCst);
    if authorized {
        None
    } else {
        Some((StatusCode::UNAUTHORIZED, Json(json!({ "error": "HTTP 401 Unauthorized" }))).into_response())
    }
}

async fn create_user(
    State(state): State<Arc<IdpState>>,
    Path(realm): Path<String>,
    headers: HeaderMap,
    Json(payload): Json<Value>,
) -> Response {
    if let Some(rejection) = check_admin(&state, &headers) {
        return rejection;
    }
    if realm == "empty" {
        return StatusCode::NOT_FOUND.into_response();
    }

    let username = payload["username"].as_str().unwrap_or_default().to_string();
    match username.as_str() {
        "forbidden" => return StatusCode::FORBIDDEN.into_response(),
        "invalid" => {
            return (StatusCode::BAD_REQUEST, Json(json!({ "errorMessage": "Password policy not met" })))
                .into_response()
        }
        "teapot" => return StatusCode::IM_A_TEAPOT.into_response(),
        _ => {}
    }

    let mut users = state.users.lock().unwrap();
    if users.iter().any(|u| u.username == username) {
        return (StatusCode::CONFLICT, Json(json!({ "errorMessage": "User exists with same username" })))
            .into_response();
    }

    let id = format!("id-{username}");
    users.push(ProviderUser {
        id: id.clone(),
        username,
        email: payload["email"].as_str().map(str::to_string),
        first_name: payload["firstName"].as_str().map(str::to_string),
        last_name: payload["lastName"].as_str().map(str::to_string),
        enabled: payload["enabled"].as_bool().unwrap_or(false),
    });
    state.created_payloads.lock().unwrap().push(payload);

    if state.omit_location.load(Ordering::SeqCst) {
        StatusCode::CREATED.into_response()
    } else {
        (
            StatusCode::CREATED,
            [(header::LOCATION, format!("/admin/realms/{realm}/users/{id}"))],
        )
            .into_response()
    }
}

async fn list_users(
    State(state): State<Arc<IdpState>>,
    Path(realm): Path<String>,
    headers: HeaderMap,
    Query(query): Query<HashMap<String, String>>,
) -> Response {
    if let Some(rejection) = check_admin(&state, &headers) {
        return rejection;
    }
    match realm.as_str() {
        "empty" => return StatusCode::NOT_FOUND.into_response(),
        "locked" => return StatusCode::FORBIDDEN.into_response(),
        _ => {}
    }

    let users = state.users.lock().unwrap();
    let filtered: Vec<&ProviderUser> = match query.get("username") {
        Some(name) => users.iter().filter(|u| &u.username == name).collect(),
        None => users.iter().collect(),
    };
    // The "sticky" realm ignores paging and always serves the first page.
    let first: usize = match realm.as_str() {
        "sticky" => 0,
        _ => query.get("first").and_then(|v| v.parse().ok()).unwrap_or(0),
    };
    let max: usize = query.get("max").and_then(|v| v.parse().ok()).unwrap_or(100);
    let page: Vec<&ProviderUser> = filtered.into_iter().skip(first).take(max).collect();
    Json(json!(page)).into_response()
}

// ---------------------------------------------------------------------------
// In-memory collaborators
// ---------------------------------------------------------------------------

/// Profile store with the same unique keys as the `profiles` table.
#[derive(Default)]
pub struct MemoryProfileStore {
    rows: Mutex<Vec<LocalProfile>>,
    writes: AtomicUsize,
    race_gate: Option<Arc<Barrier>>,
    gated_reads: AtomicUsize,
}

impl MemoryProfileStore {
    /// The first two lookups both read, then wait for each other before
    /// returning, so two reconciliations see the same missing row.
    pub fn with_race_gate() -> Self {
        Self {
            race_gate: Some(Arc::new(Barrier::new(2))),
            ..Self::default()
        }
    }

    pub fn rows(&self) -> Vec<LocalProfile> {
        self.rows.lock().unwrap().clone()
    }

    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    fn conflict_with(
        rows: &[LocalProfile],
        skip: Option<Uuid>,
        username: &str,
        email: Option<&str>,
    ) -> Option<UniqueField> {
        let others = || rows.iter().filter(move |r| Some(r.id) != skip);
        if others().any(|r| r.username == username) {
            return Some(UniqueField::Username);
        }
        // NULL emails never collide, as with the SQL UNIQUE constraint.
        if email.is_some() && others().any(|r| r.email.as_deref() == email) {
            return Some(UniqueField::Email);
        }
        None
    }
}

#[async_trait]
impl ProfileStore for MemoryProfileStore {
    async fn find_by_subject(&self, subject_id: &str) -> Result<Option<LocalProfile>, StoreError> {
        let found = self.rows.lock().unwrap().iter().find(|r| r.subject_id == subject_id).cloned();
        if let Some(gate) = &self.race_gate {
            if self.gated_reads.fetch_add(1, Ordering::SeqCst) < 2 {
                gate.wait().await;
            }
        }
        Ok(found)
    }

    async fn insert(&self, profile: &NewProfile) -> Result<LocalProfile, StoreError> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        let mut rows = self.rows.lock().unwrap();
        if rows.iter().any(|r| r.subject_id == profile.subject_id) {
            return Err(StoreError::Conflict(UniqueField::SubjectId));
        }
        if let Some(field) = Self::conflict_with(&rows, None, &profile.username, profile.email.as_deref()) {
            return Err(StoreError::Conflict(field));
        }

        let now = Utc::now();
        let row = LocalProfile {
            id: Uuid::new_v4(),
            subject_id: profile.subject_id.clone(),
            username: profile.username.clone(),
            email: profile.email.clone(),
            first_name: profile.first_name.clone(),
            last_name: profile.last_name.clone(),
            roles: profile.roles.clone(),
            is_active: true,
            created_at: now,
            updated_at: now,
        };
        rows.push(row.clone());
        Ok(row)
    }

    async fn update(&self, id: Uuid, changes: &ProfileChanges) -> Result<LocalProfile, StoreError> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        let mut rows = self.rows.lock().unwrap();
        let Some(current) = rows.iter().find(|r| r.id == id).cloned() else {
            return Err(StoreError::Database(format!("no profile with id {id}")));
        };

        let username = changes.username.clone().unwrap_or(current.username.clone());
        let email = changes.email.clone().or(current.email.clone());
        if let Some(field) = Self::conflict_with(&rows, Some(id), &username, email.as_deref()) {
            return Err(StoreError::Conflict(field));
        }

        let row = rows.iter_mut().find(|r| r.id == id).unwrap();
        row.username = username;
        row.email = email;
        if let Some(v) = &changes.first_name {
            row.first_name = v.clone();
        }
        if let Some(v) = &changes.last_name {
            row.last_name = v.clone();
        }
        row.updated_at = Utc::now();
        Ok(row.clone())
    }
}

/// Attempt counter without expiry, keyed like the Redis one.
#[derive(Default)]
pub struct MemoryAttemptCounter {
    counts: Mutex<HashMap<String, u64>>,
}

#[async_trait]
impl AttemptCounter for MemoryAttemptCounter {
    async fn hit(&self, key: &str, _window_secs: u64) -> anyhow::Result<u64> {
        let mut counts = self.counts.lock().unwrap();
        let count = counts.entry(key.to_string()).or_insert(0);
        *count += 1;
        Ok(*count)
    }
}

pub struct UnavailableAttemptCounter;

#[async_trait]
impl AttemptCounter for UnavailableAttemptCounter {
    async fn hit(&self, _key: &str, _window_secs: u64) -> anyhow::Result<u64> {
        anyhow::bail!("connection refused")
    }
}

/// Publisher that keeps every `(topic, key, payload)` it receives.
#[derive(Default)]
pub struct RecordingPublisher {
    events: Mutex<Vec<(String, String, Value)>>,
}

impl RecordingPublisher {
    pub fn events(&self) -> Vec<(String, String, Value)> {
        self.events.lock().unwrap().clone()
    }
}

#[async_trait]
impl EventPublisher for RecordingPublisher {
    async fn publish(&self, topic: &str, key: &str, payload: &Value) -> anyhow::Result<()> {
        self.events
            .lock()
            .unwrap()
            .push((topic.to_string(), key.to_string(), payload.clone()));
        Ok(())
    }
}

pub struct FailingPublisher;

#[async_trait]
impl EventPublisher for FailingPublisher {
    async fn publish(&self, _topic: &str, _key: &str, _payload: &Value) -> anyhow::Result<()> {
        anyhow::bail!("broker down")
    }
}

pub struct HangingPublisher;

#[async_trait]
impl EventPublisher for HangingPublisher {
    async fn publish(&self, _topic: &str, _key: &str, _payload: &Value) -> anyhow::Result<()> {
        std::future::pending::<()>().await;
        Ok(())
    }
}
