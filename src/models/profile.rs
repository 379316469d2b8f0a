use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Placeholder stored when the token carries no given/family name.
pub const NAME_PLACEHOLDER: &str = "N/A";

/// The service's own user record, correlated to the provider by `subject_id`.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow, PartialEq)]
pub struct LocalProfile {
    pub id: Uuid,
    pub subject_id: String,
    pub username: String,
    pub email: Option<String>,
    pub first_name: String,
    pub last_name: String,
    pub roles: Vec<String>,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Row to insert on first reconciliation of a subject.
#[derive(Debug, Clone)]
pub struct NewProfile {
    pub subject_id: String,
    pub username: String,
    pub email: Option<String>,
    pub first_name: String,
    pub last_name: String,
    pub roles: Vec<String>,
}

/// Display fields refreshed from the latest claims; `None` keeps the stored value.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProfileChanges {
    pub username: Option<String>,
    pub email: Option<String>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
}

/// Unique keys of the profile collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UniqueField {
    SubjectId,
    Username,
    Email,
}

impl std::fmt::Display for UniqueField {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            UniqueField::SubjectId => "subject id",
            UniqueField::Username => "username",
            UniqueField::Email => "email",
        };
        write!(f, "{s}")
    }
}

/// Lower-cases and trims an address before it is stored or compared.
pub fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

#[derive(Debug, Serialize)]
pub struct ProfileResponse {
    pub profile: LocalProfile,
    pub created: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}
