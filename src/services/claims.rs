use jsonwebtoken::{decode, decode_header, errors::ErrorKind, Algorithm, Validation};
use reqwest::Client;
use tracing::debug;

use crate::{
    config::Config,
    error::{AppError, AppResult},
    models::claims::{ClaimsSet, RawClaims},
    services::jwks::JwksCache,
};

/// Verifies bearer tokens against the provider's published keys.
pub struct ClaimsValidator {
    jwks: JwksCache,
    algorithm: Algorithm,
    issuer: String,
    audience: Option<String>,
    leeway_seconds: u64,
}

impl ClaimsValidator {
    pub fn new(
        jwks: JwksCache,
        algorithm: Algorithm,
        issuer: String,
        audience: Option<String>,
        leeway_seconds: u64,
    ) -> Self {
        Self {
            jwks,
            algorithm,
            issuer,
            audience,
            leeway_seconds,
        }
    }

    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        let http = Client::builder().timeout(config.idp_timeout).build()?;
        let jwks = JwksCache::new(http, config.keycloak.certs_url(), config.jwks_min_refresh);
        Ok(Self::new(
            jwks,
            config.jwt_algorithm,
            config.keycloak.issuer(),
            config.keycloak.audience.clone(),
            config.jwt_leeway_seconds,
        ))
    }

    /// Signature, algorithm, issuer and expiry are all checked before any
    /// payload field is read; any failure rejects the token outright.
    pub async fn validate(&self, token: &str) -> AppResult<ClaimsSet> {
        let header = decode_header(token).map_err(|e| AppError::SignatureInvalid(e.to_string()))?;
        if header.alg != self.algorithm {
            return Err(AppError::SignatureInvalid(format!(
                "Unexpected algorithm {:?}",
                header.alg
            )));
        }
        let kid = header
            .kid
            .ok_or_else(|| AppError::KeyResolutionFailed("Token header has no key id".into()))?;

        let key = self.jwks.key(&kid).await?;

        let mut validation = Validation::new(self.algorithm);
        validation.leeway = self.leeway_seconds;
        validation.set_issuer(&[self.issuer.as_str()]);
        validation.set_required_spec_claims(&["exp", "iss"]);
        match &self.audience {
            Some(audience) => validation.set_audience(&[audience.as_str()]),
            None => validation.validate_aud = false,
        }

        let data = decode::<RawClaims>(token, &key, &validation).map_err(|e| {
            debug!(error = %e, "token rejected");
            map_jwt_error(e)
        })?;
        Ok(ClaimsSet::from_verified(data.claims))
    }
}

fn map_jwt_error(e: jsonwebtoken::errors::Error) -> AppError {
    match e.kind() {
        ErrorKind::ExpiredSignature => AppError::TokenExpired,
        ErrorKind::InvalidIssuer => AppError::IssuerMismatch,
        ErrorKind::MissingRequiredClaim(claim) if claim == "iss" => AppError::IssuerMismatch,
        _ => AppError::SignatureInvalid(e.to_string()),
    }
}
