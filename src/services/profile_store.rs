use async_trait::async_trait;
use sqlx::PgPool;
use thiserror::Error;
use uuid::Uuid;

use crate::models::profile::{LocalProfile, NewProfile, ProfileChanges, UniqueField};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("unique constraint on {0} violated")]
    Conflict(UniqueField),
    #[error("{0}")]
    Database(String),
}

/// Persistence seam used by the profile reconciler.
#[async_trait]
pub trait ProfileStore: Send + Sync {
    async fn find_by_subject(&self, subject_id: &str) -> Result<Option<LocalProfile>, StoreError>;

    async fn insert(&self, profile: &NewProfile) -> Result<LocalProfile, StoreError>;

    /// Applies the non-`None` fields of `changes` and bumps `updated_at`.
    async fn update(&self, id: Uuid, changes: &ProfileChanges) -> Result<LocalProfile, StoreError>;
}

const PROFILE_COLUMNS: &str =
    "id, subject_id, username, email, first_name, last_name, roles, is_active, created_at, updated_at";

pub struct PgProfileStore {
    pool: PgPool,
}

impl PgProfileStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ProfileStore for PgProfileStore {
    async fn find_by_subject(&self, subject_id: &str) -> Result<Option<LocalProfile>, StoreError> {
        sqlx::query_as::<_, LocalProfile>(&format!(
            "SELECT {PROFILE_COLUMNS} FROM profiles WHERE subject_id = $1"
        ))
        .bind(subject_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx)
    }

    async fn insert(&self, profile: &NewProfile) -> Result<LocalProfile, StoreError> {
        sqlx::query_as::<_, LocalProfile>(&format!(
            "INSERT INTO profiles (subject_id, username, email, first_name, last_name, roles)
             VALUES ($1, $2, $3, $4, $5, $6)
             RETURNING {PROFILE_COLUMNS}"
        ))
        .bind(&profile.subject_id)
        .bind(&profile.username)
        .bind(&profile.email)
        .bind(&profile.first_name)
        .bind(&profile.last_name)
        .bind(&profile.roles)
        .fetch_one(&self.pool)
        .await
        .map_err(map_sqlx)
    }

    async fn update(&self, id: Uuid, changes: &ProfileChanges) -> Result<LocalProfile, StoreError> {
        sqlx::query_as::<_, LocalProfile>(&format!(
            "UPDATE profiles SET
                username   = COALESCE($2, username),
                email      = COALESCE($3, email),
                first_name = COALESCE($4, first_name),
                last_name  = COALESCE($5, last_name),
                updated_at = NOW()
             WHERE id = $1
             RETURNING {PROFILE_COLUMNS}"
        ))
        .bind(id)
        .bind(&changes.username)
        .bind(&changes.email)
        .bind(&changes.first_name)
        .bind(&changes.last_name)
        .fetch_one(&self.pool)
        .await
        .map_err(map_sqlx)
    }
}

fn map_sqlx(e: sqlx::Error) -> StoreError {
    if let sqlx::Error::Database(db) = &e {
        if db.is_unique_violation() {
            if let Some(field) = db.constraint().and_then(field_for_constraint) {
                return StoreError::Conflict(field);
            }
        }
    }
    StoreError::Database(e.to_string())
}

fn field_for_constraint(name: &str) -> Option<UniqueField> {
    match name {
        "profiles_subject_id_key" => Some(UniqueField::SubjectId),
        "profiles_username_key" => Some(UniqueField::Username),
        "profiles_email_key" => Some(UniqueField::Email),
        _ => None,
    }
}
