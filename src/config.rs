use std::{env, fmt, time::Duration};

use jsonwebtoken::Algorithm;

#[derive(Clone)]
pub struct Config {
    pub database_url: String,
    pub redis_url: String,
    pub host: String,
    pub port: u16,
    /// Browser origins allowed besides localhost.
    pub cors_origins: Vec<String>,
    pub keycloak: KeycloakConfig,
    pub jwt_algorithm: Algorithm,
    pub jwt_leeway_seconds: u64,
    pub jwks_min_refresh: Duration,
    pub idp_timeout: Duration,
    pub notify_timeout: Duration,
    pub event_stream_maxlen: usize,
    pub event_consumer_group: String,
    /// Runs the background stream reader when set.
    pub event_consumer_enabled: bool,
    pub event_consumer_name: String,
}

/// Identity-provider coordinates and service credentials.
#[derive(Clone)]
pub struct KeycloakConfig {
    pub server_url: String,
    pub realm: String,
    pub client_id: String,
    pub client_secret: String,
    pub audience: Option<String>,
    pub admin: AdminGrant,
}

/// How the service obtains its administrative bearer token.
#[derive(Clone)]
pub enum AdminGrant {
    /// `client_credentials` grant against the service realm with a service-account client.
    ClientCredentials { client_id: String, client_secret: String },
    /// `password` grant through `admin-cli` in the admin realm (usually `master`).
    Password { realm: String, username: String, password: String },
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        Ok(Self {
            database_url: required("DATABASE_URL")?,
            redis_url: env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".into()),
            host: env::var("HOST").unwrap_or_else(|_| "0.0.0.0".into()),
            port: env::var("PORT")
                .unwrap_or_else(|_| "3000".into())
                .parse()?,
            cors_origins: env::var("CORS_ALLOWED_ORIGINS")
                .unwrap_or_default()
                .split(',')
                .map(|o| o.trim().trim_end_matches('/').to_string())
                .filter(|o| !o.is_empty())
                .collect(),
            keycloak: KeycloakConfig::from_env()?,
            jwt_algorithm: env::var("JWT_ALGORITHM")
                .unwrap_or_else(|_| "RS256".into())
                .parse()
                .map_err(|_| anyhow::anyhow!("Unsupported JWT_ALGORITHM"))?,
            jwt_leeway_seconds: env::var("JWT_LEEWAY_SECONDS")
                .unwrap_or_else(|_| "30".into())
                .parse()?,
            jwks_min_refresh: Duration::from_secs(
                env::var("JWKS_MIN_REFRESH_SECONDS")
                    .unwrap_or_else(|_| "6".into())
                    .parse()?,
            ),
            idp_timeout: Duration::from_secs(
                env::var("IDP_TIMEOUT_SECONDS")
                    .unwrap_or_else(|_| "10".into())
                    .parse()?,
            ),
            notify_timeout: Duration::from_secs(
                env::var("NOTIFY_TIMEOUT_SECONDS")
                    .unwrap_or_else(|_| "5".into())
                    .parse()?,
            ),
            event_stream_maxlen: env::var("EVENT_STREAM_MAXLEN")
                .unwrap_or_else(|_| "10000".into())
                .parse()?,
            event_consumer_group: env::var("EVENT_CONSUMER_GROUP")
                .unwrap_or_else(|_| "user-management-group".into()),
            event_consumer_enabled: env::var("EVENT_CONSUMER_ENABLED")
                .map(|v| v != "false" && v != "0")
                .unwrap_or(true),
            event_consumer_name: env::var("EVENT_CONSUMER_NAME")
                .unwrap_or_else(|_| format!("authsync-{}", std::process::id())),
        })
    }
}

impl KeycloakConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let admin = match (
            optional("KEYCLOAK_ADMIN_CLIENT_ID"),
            optional("KEYCLOAK_ADMIN_CLIENT_SECRET"),
        ) {
            (Some(client_id), Some(client_secret)) => AdminGrant::ClientCredentials { client_id, client_secret },
            _ => AdminGrant::Password {
                realm: env::var("KEYCLOAK_ADMIN_REALM").unwrap_or_else(|_| "master".into()),
                username: env::var("KEYCLOAK_ADMIN_USERNAME").unwrap_or_else(|_| "admin".into()),
                password: env::var("KEYCLOAK_ADMIN_PASSWORD").unwrap_or_else(|_| "admin".into()),
            },
        };

        Ok(Self {
            server_url: required("KEYCLOAK_SERVER_URL")?.trim_end_matches('/').to_string(),
            realm: required("KEYCLOAK_REALM")?,
            client_id: required("KEYCLOAK_CLIENT_ID")?,
            client_secret: required("KEYCLOAK_CLIENT_SECRET")?,
            audience: optional("KEYCLOAK_AUDIENCE"),
            admin,
        })
    }

    /// Expected `iss` of every token minted for the service realm.
    pub fn issuer(&self) -> String {
        format!("{}/realms/{}", self.server_url, self.realm)
    }

    pub fn token_url(&self) -> String {
        realm_token_url(&self.server_url, &self.realm)
    }

    pub fn userinfo_url(&self) -> String {
        format!("{}/protocol/openid-connect/userinfo", self.issuer())
    }

    pub fn certs_url(&self) -> String {
        format!("{}/protocol/openid-connect/certs", self.issuer())
    }

    pub fn admin_users_url(&self) -> String {
        format!("{}/admin/realms/{}/users", self.server_url, self.realm)
    }

    /// Token endpoint used for the administrative grant.
    pub fn admin_token_url(&self) -> String {
        match &self.admin {
            AdminGrant::ClientCredentials { .. } => self.token_url(),
            AdminGrant::Password { realm, .. } => realm_token_url(&self.server_url, realm),
        }
    }
}

fn realm_token_url(server_url: &str, realm: &str) -> String {
    format!("{server_url}/realms/{realm}/protocol/openid-connect/token")
}

impl fmt::Debug for KeycloakConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeycloakConfig")
            .field("server_url", &self.server_url)
            .field("realm", &self.realm)
            .field("client_id", &self.client_id)
            .field("client_secret", &"<redacted>")
            .field("audience", &self.audience)
            .field("admin", &self.admin)
            .finish()
    }
}

impl fmt::Debug for AdminGrant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AdminGrant::ClientCredentials { client_id, .. } => f
                .debug_struct("ClientCredentials")
                .field("client_id", client_id)
                .field("client_secret", &"<redacted>")
                .finish(),
            AdminGrant::Password { realm, username, .. } => f
                .debug_struct("Password")
                .field("realm", realm)
                .field("username", username)
                .field("password", &"<redacted>")
                .finish(),
        }
    }
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // The connection strings may embed credentials.
        f.debug_struct("Config")
            .field("database_url", &"<redacted>")
            .field("redis_url", &"<redacted>")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("cors_origins", &self.cors_origins)
            .field("keycloak", &self.keycloak)
            .field("jwt_algorithm", &self.jwt_algorithm)
            .field("jwt_leeway_seconds", &self.jwt_leeway_seconds)
            .field("jwks_min_refresh", &self.jwks_min_refresh)
            .field("idp_timeout", &self.idp_timeout)
            .field("notify_timeout", &self.notify_timeout)
            .field("event_stream_maxlen", &self.event_stream_maxlen)
            .field("event_consumer_group", &self.event_consumer_group)
            .field("event_consumer_enabled", &self.event_consumer_enabled)
            .field("event_consumer_name", &self.event_consumer_name)
            .finish()
    }
}

fn required(key: &str) -> anyhow::Result<String> {
    env::var(key).map_err(|_| anyhow::anyhow!("Missing required env var: {}", key))
}

fn optional(key: &str) -> Option<String> {
    env::var(key).ok().filter(|s| !s.is_empty())
}
