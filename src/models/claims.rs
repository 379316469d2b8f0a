use serde::Deserialize;

/// Token payload as signed by the identity provider.
///
/// Only ever deserialized by `jsonwebtoken::decode` after the signature, issuer
/// and expiry checks pass; nothing outside the claims validator sees it.
#[derive(Debug, Deserialize)]
pub(crate) struct RawClaims {
    #[serde(default)]
    pub sub: Option<String>,
    #[serde(default)]
    pub preferred_username: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub given_name: Option<String>,
    #[serde(default)]
    pub family_name: Option<String>,
    #[serde(default)]
    pub realm_access: Option<RealmAccess>,
    pub exp: i64,
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct RealmAccess {
    #[serde(default)]
    pub roles: Vec<String>,
}

/// Verified identity attributes extracted from a bearer token.
///
/// Immutable: fields are private and the only constructor is crate-private,
/// so a `ClaimsSet` always comes from a validated token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimsSet {
    subject: Option<String>,
    preferred_username: Option<String>,
    email: Option<String>,
    given_name: Option<String>,
    family_name: Option<String>,
    roles: Vec<String>,
    expires_at: i64,
}

impl ClaimsSet {
    pub(crate) fn from_verified(raw: RawClaims) -> Self {
        Self {
            subject: raw.sub,
            preferred_username: raw.preferred_username,
            email: raw.email,
            given_name: raw.given_name,
            family_name: raw.family_name,
            roles: raw.realm_access.map(|r| r.roles).unwrap_or_default(),
            expires_at: raw.exp,
        }
    }

    /// Subject identifier, `None` when absent or blank.
    pub fn subject(&self) -> Option<&str> {
        non_blank(&self.subject)
    }

    pub fn preferred_username(&self) -> Option<&str> {
        non_blank(&self.preferred_username)
    }

    pub fn email(&self) -> Option<&str> {
        non_blank(&self.email)
    }

    pub fn given_name(&self) -> Option<&str> {
        non_blank(&self.given_name)
    }

    pub fn family_name(&self) -> Option<&str> {
        non_blank(&self.family_name)
    }

    pub fn roles(&self) -> &[String] {
        &self.roles
    }

    pub fn has_any_role(&self, required: &[&str]) -> bool {
        required.iter().any(|r| self.roles.iter().any(|have| have == r))
    }

    /// Raw `exp` claim (seconds since the epoch).
    pub fn expires_at(&self) -> i64 {
        self.expires_at
    }
}

fn non_blank(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|s| !s.is_empty())
}

#[cfg(test)]
impl ClaimsSet {
    /// Test-only builder; production code gets claims from the validator.
    pub(crate) fn for_test(subject: Option<&str>) -> Self {
        Self {
            subject: subject.map(str::to_string),
            preferred_username: None,
            email: None,
            given_name: None,
            family_name: None,
            roles: Vec::new(),
            expires_at: 0,
        }
    }

    pub(crate) fn with_username(mut self, v: &str) -> Self {
        self.preferred_username = Some(v.to_string());
        self
    }

    pub(crate) fn with_email(mut self, v: &str) -> Self {
        self.email = Some(v.to_string());
        self
    }

    pub(crate) fn with_names(mut self, given: &str, family: &str) -> Self {
        self.given_name = Some(given.to_string());
        self.family_name = Some(family.to_string());
        self
    }

    pub(crate) fn with_roles(mut self, roles: &[&str]) -> Self {
        self.roles = roles.iter().map(|r| r.to_string()).collect();
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_realm_roles_default_to_empty() {
        let raw: RawClaims = serde_json::from_value(serde_json::json!({
            "sub": "u1",
            "exp": 1_900_000_000i64,
        }))
        .unwrap();
        let claims = ClaimsSet::from_verified(raw);
        assert!(claims.roles().is_empty());
        assert_eq!(claims.subject(), Some("u1"));
    }

    #[test]
    fn test_blank_claims_read_as_absent() {
        let claims = ClaimsSet::for_test(Some("  ")).with_names("", "Smith");
        assert_eq!(claims.subject(), None);
        assert_eq!(claims.given_name(), None);
        assert_eq!(claims.family_name(), Some("Smith"));
    }

    #[test]
    fn test_has_any_role() {
        let claims = ClaimsSet::for_test(Some("u1")).with_roles(&["user", "offline_access"]);
        assert!(claims.has_any_role(&["admin", "user"]));
        assert!(!claims.has_any_role(&["admin"]));
    }
}
