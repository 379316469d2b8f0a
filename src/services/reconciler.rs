use std::sync::Arc;

use tracing::{info, warn};

use crate::{
    error::{AppError, AppResult},
    models::{
        claims::ClaimsSet,
        event::UserCreatedEvent,
        profile::{normalize_email, LocalProfile, NewProfile, ProfileChanges, NAME_PLACEHOLDER},
    },
    services::{
        metrics::RECONCILE_COUNTER,
        notifier::Notifier,
        profile_store::{ProfileStore, StoreError},
    },
};

#[derive(Debug, Clone)]
pub struct ReconcileOutcome {
    pub profile: LocalProfile,
    pub created: bool,
    /// Non-fatal problems, e.g. an event that could not be published.
    pub warnings: Vec<String>,
}

/// Maps verified claims onto the local profile of their subject.
///
/// The first call for a subject creates the profile and emits `user.created`;
/// later calls refresh display fields from non-blank claims and emit nothing.
pub struct ProfileReconciler {
    store: Arc<dyn ProfileStore>,
    notifier: Arc<Notifier>,
}

impl ProfileReconciler {
    pub fn new(store: Arc<dyn ProfileStore>, notifier: Arc<Notifier>) -> Self {
        Self { store, notifier }
    }

    pub async fn reconcile(&self, claims: &ClaimsSet) -> AppResult<ReconcileOutcome> {
        let subject = claims.subject().ok_or(AppError::MissingSubject)?;

        let result = match self.store.find_by_subject(subject).await.map_err(store_error)? {
            Some(existing) => self.refresh(existing, claims).await.map(|profile| ReconcileOutcome {
                profile,
                created: false,
                warnings: Vec::new(),
            }),
            None => self.create(subject, claims).await,
        };

        let outcome = match &result {
            Ok(o) if o.created => "created",
            Ok(_) => "updated",
            Err(AppError::ProfileConflict(_)) => "conflict",
            Err(_) => "error",
        };
        RECONCILE_COUNTER.with_label_values(&[outcome]).inc();
        result
    }

    /// Pure read by subject id.
    pub async fn get_profile(&self, subject_id: &str) -> AppResult<Option<LocalProfile>> {
        self.store.find_by_subject(subject_id).await.map_err(store_error)
    }

    async fn create(&self, subject: &str, claims: &ClaimsSet) -> AppResult<ReconcileOutcome> {
        let new = new_profile(subject, claims);

        let profile = match self.store.insert(&new).await {
            Ok(profile) => profile,
            Err(StoreError::Conflict(field)) => {
                // A concurrent first reconciliation of the same subject wins the insert;
                // anything else is an identity collision.
                return match self.store.find_by_subject(subject).await.map_err(store_error)? {
                    Some(existing) => {
                        info!(subject_id = %subject, "profile created concurrently, updating instead");
                        let profile = self.refresh(existing, claims).await?;
                        Ok(ReconcileOutcome {
                            profile,
                            created: false,
                            warnings: Vec::new(),
                        })
                    }
                    None => {
                        warn!(subject_id = %subject, %field, "profile creation conflicts with another subject");
                        Err(AppError::ProfileConflict(field.to_string()))
                    }
                };
            }
            Err(e) => return Err(store_error(e)),
        };

        info!(subject_id = %subject, profile_id = %profile.id, username = %profile.username, "created local profile");

        let event = UserCreatedEvent {
            local_profile_id: profile.id,
            subject_id: profile.subject_id.clone(),
            email: profile.email.clone(),
            username: profile.username.clone(),
        };
        let warnings = match self.notifier.publish(&event).await {
            Ok(()) => Vec::new(),
            Err(e) => vec![e.to_string()],
        };

        Ok(ReconcileOutcome {
            profile,
            created: true,
            warnings,
        })
    }

    async fn refresh(&self, existing: LocalProfile, claims: &ClaimsSet) -> AppResult<LocalProfile> {
        let changes = changes_from(claims);
        match self.store.update(existing.id, &changes).await {
            Ok(profile) => Ok(profile),
            Err(StoreError::Conflict(field)) => {
                warn!(subject_id = %existing.subject_id, %field, "profile refresh conflicts with another subject");
                Err(AppError::ProfileConflict(field.to_string()))
            }
            Err(e) => Err(store_error(e)),
        }
    }
}

/// Username precedence: `preferred_username`, then the email, then the subject id.
fn new_profile(subject: &str, claims: &ClaimsSet) -> NewProfile {
    let email = claims.email().map(normalize_email);
    let username = claims
        .preferred_username()
        .map(str::to_string)
        .or_else(|| email.clone())
        .unwrap_or_else(|| subject.to_string());

    NewProfile {
        subject_id: subject.to_string(),
        username,
        email,
        first_name: claims.given_name().unwrap_or(NAME_PLACEHOLDER).to_string(),
        last_name: claims.family_name().unwrap_or(NAME_PLACEHOLDER).to_string(),
        roles: claims.roles().to_vec(),
    }
}

/// Blank or missing claims leave the stored value untouched.
fn changes_from(claims: &ClaimsSet) -> ProfileChanges {
    ProfileChanges {
        username: claims.preferred_username().map(str::to_string),
        email: claims.email().map(normalize_email),
        first_name: claims.given_name().map(str::to_string),
        last_name: claims.family_name().map(str::to_string),
    }
}

fn store_error(e: StoreError) -> AppError {
    match e {
        StoreError::Conflict(field) => AppError::ProfileConflict(field.to_string()),
        StoreError::Database(msg) => AppError::Database(msg),
    }
}
