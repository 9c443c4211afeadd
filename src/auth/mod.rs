//! Session and identity gate.
//!
//! Resolves who is acting and whether they hold the admin role. Reads never
//! mutate: an expired session simply reads as absent until [`Gate::reap`] removes
//! it. Callers pass the resolved [`Session`] explicitly into privileged
//! operations.

pub mod password;

use chrono::{Duration, Utc};
use once_cell::sync::Lazy;
use rand::Rng;
use regex::Regex;
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::model::{Role, Session, TwoFactorChallenge, User};
use crate::store::{Collection, Store, StoreError};

pub use password::{hash_secret, verify_secret};

const MIN_PASSWORD_LEN: usize = 8;
const TWO_FACTOR_TTL_MINUTES: i64 = 10;
const MAX_TWO_FACTOR_ATTEMPTS: u32 = 5;

static EMAIL_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").expect("valid email regex"));

#[derive(Debug, Error)]
pub enum AuthError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("invalid email or password")]
    InvalidCredentials,
    #[error("email address has not been verified")]
    Unverified,
    #[error("account is blocked")]
    Blacklisted,
    #[error("an account with this email already exists")]
    DuplicateEmail,
    #[error("invalid email address")]
    InvalidEmail,
    #[error("password must be at least 8 characters")]
    WeakPassword,
    #[error("invalid or expired two-factor code")]
    InvalidCode,
    #[error("no active session")]
    Unauthenticated,
    #[error("admin role required")]
    Forbidden,
    #[error("{0}")]
    Hash(String),
}

/// Result of a password check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignInOutcome {
    SignedIn(Session),
    /// A code was delivered; finish with [`Gate::verify_two_factor`].
    TwoFactorRequired,
}

/// Out-of-band delivery of verification codes.
pub trait CodeDelivery: Send + Sync {
    fn deliver(&self, email: &str, code: &str);
}

/// Writes codes to the log; stands in for an SMS/email sender.
#[derive(Debug, Default)]
pub struct LogDelivery;

impl CodeDelivery for LogDelivery {
    fn deliver(&self, email: &str, code: &str) {
        info!(to = email, code, "two-factor code issued");
    }
}

pub fn is_expired(session: &Session) -> bool {
    Utc::now() > session.expires_at
}

pub fn has_role(session: &Session, role: Role) -> bool {
    session.user.role == role
}

/// The session, if it is present, unexpired and carries the admin role.
pub fn require_admin(session: Option<&Session>) -> Result<&Session, AuthError> {
    let session = session.ok_or(AuthError::Unauthenticated)?;
    if is_expired(session) {
        return Err(AuthError::Unauthenticated);
    }
    if !has_role(session, Role::Admin) {
        return Err(AuthError::Forbidden);
    }
    Ok(session)
}

fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

#[derive(Clone)]
pub struct Gate {
    store: Store,
    session_ttl: Duration,
    master_email: String,
    delivery: Arc<dyn CodeDelivery>,
}

impl std::fmt::Debug for Gate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Gate")
            .field("session_ttl", &self.session_ttl)
            .field("master_email", &self.master_email)
            .finish_non_exhaustive()
    }
}

impl Gate {
    pub fn new(store: Store, session_ttl: Duration, master_email: impl Into<String>) -> Self {
        Self {
            store,
            session_ttl,
            master_email: normalize_email(&master_email.into()),
            delivery: Arc::new(LogDelivery),
        }
    }

    pub fn from_config(store: Store, cfg: &Config) -> Self {
        Self::new(
            store,
            Duration::hours(cfg.app.session_ttl_hours as i64),
            cfg.admin.email.clone(),
        )
    }

    pub fn with_delivery(mut self, delivery: Arc<dyn CodeDelivery>) -> Self {
        self.delivery = delivery;
        self
    }

    /// Active, unexpired session. Never mutates the store.
    pub async fn current_session(&self) -> Result<Option<Session>, AuthError> {
        let session: Option<Session> = self.store.get_value(Collection::Session).await?;
        Ok(session.filter(|s| !is_expired(s)))
    }

    /// Drop the stored session if it has expired. Returns whether one was removed.
    #[instrument(skip_all)]
    pub async fn reap(&self) -> Result<bool, AuthError> {
        let session: Option<Session> = self.store.get_value(Collection::Session).await?;
        match session {
            Some(s) if is_expired(&s) => {
                self.store.delete_value(Collection::Session).await?;
                info!(user = %s.user.email, "expired session reaped");
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    pub async fn users(&self) -> Result<Vec<User>, AuthError> {
        Ok(self.store.list(Collection::Users).await?)
    }

    async fn find_user(&self, email: &str) -> Result<Option<User>, AuthError> {
        let email = normalize_email(email);
        Ok(self
            .users()
            .await?
            .into_iter()
            .find(|u| normalize_email(&u.email) == email))
    }

    /// Seed the configured master admin if it does not exist yet.
    #[instrument(skip_all)]
    pub async fn ensure_master_admin(&self, password: &str) -> Result<User, AuthError> {
        if let Some(existing) = self.find_user(&self.master_email).await? {
            return Ok(existing);
        }
        let admin = User {
            id: Uuid::new_v4().to_string(),
            email: self.master_email.clone(),
            password_hash: hash_secret(password)?,
            role: Role::Admin,
            is_verified: true,
            is_2fa_enabled: true,
            created_at: Utc::now(),
        };
        self.store.append(Collection::Users, &admin).await?;
        info!(email = %admin.email, "master admin created");
        Ok(admin)
    }

    #[instrument(skip_all)]
    pub async fn sign_up(&self, email: &str, password: &str) -> Result<User, AuthError> {
        let email = email.trim();
        if !EMAIL_RE.is_match(email) {
            return Err(AuthError::InvalidEmail);
        }
        if password.len() < MIN_PASSWORD_LEN {
            return Err(AuthError::WeakPassword);
        }
        if self.is_blacklisted(email).await? {
            return Err(AuthError::Blacklisted);
        }
        if self.find_user(email).await?.is_some() {
            return Err(AuthError::DuplicateEmail);
        }
        let user = User {
            id: Uuid::new_v4().to_string(),
            email: email.to_string(),
            password_hash: hash_secret(password)?,
            role: Role::User,
            is_verified: false,
            is_2fa_enabled: true,
            created_at: Utc::now(),
        };
        self.store.append(Collection::Users, &user).await?;
        info!(email = %user.email, "account created; awaiting verification");
        Ok(user)
    }

    /// Mark an account's email as verified. Returns `false` for unknown emails.
    pub async fn verify_email(&self, email: &str) -> Result<bool, AuthError> {
        let Some(mut user) = self.find_user(email).await? else {
            return Ok(false);
        };
        user.is_verified = true;
        Ok(self.store.replace(Collection::Users, &user).await?)
    }

    #[instrument(skip_all)]
    pub async fn sign_in(&self, email: &str, password: &str) -> Result<SignInOutcome, AuthError> {
        let user = self
            .find_user(email)
            .await?
            .ok_or(AuthError::InvalidCredentials)?;
        if !verify_secret(password, &user.password_hash).unwrap_or(false) {
            warn!(email = %user.email, "rejected sign-in");
            return Err(AuthError::InvalidCredentials);
        }
        if self.is_blacklisted(&user.email).await? {
            return Err(AuthError::Blacklisted);
        }
        if !user.is_verified {
            return Err(AuthError::Unverified);
        }
        if user.is_2fa_enabled {
            let code = format!("{:06}", rand::thread_rng().gen_range(100_000..1_000_000));
            let challenge = TwoFactorChallenge {
                user_id: user.id.clone(),
                code_hash: hash_secret(&code)?,
                expires_at: Utc::now() + Duration::minutes(TWO_FACTOR_TTL_MINUTES),
                attempts: 0,
            };
            self.store
                .put_value(Collection::PendingTwoFactor, &challenge)
                .await?;
            self.delivery.deliver(&user.email, &code);
            return Ok(SignInOutcome::TwoFactorRequired);
        }
        Ok(SignInOutcome::SignedIn(self.create_session(&user).await?))
    }

    #[instrument(skip_all)]
    pub async fn verify_two_factor(&self, code: &str) -> Result<Session, AuthError> {
        let challenge: TwoFactorChallenge = self
            .store
            .get_value(Collection::PendingTwoFactor)
            .await?
            .ok_or(AuthError::InvalidCode)?;
        if Utc::now() > challenge.expires_at {
            self.store.delete_value(Collection::PendingTwoFactor).await?;
            return Err(AuthError::InvalidCode);
        }
        if !verify_secret(code.trim(), &challenge.code_hash)? {
            let attempts = challenge.attempts + 1;
            if attempts >= MAX_TWO_FACTOR_ATTEMPTS {
                self.store.delete_value(Collection::PendingTwoFactor).await?;
                warn!(user_id = %challenge.user_id, "two-factor challenge revoked after repeated misses");
            } else {
                let challenge = TwoFactorChallenge {
                    attempts,
                    ..challenge
                };
                self.store
                    .put_value(Collection::PendingTwoFactor, &challenge)
                    .await?;
            }
            return Err(AuthError::InvalidCode);
        }
        let user: User = self
            .store
            .get(Collection::Users, &challenge.user_id)
            .await?
            .ok_or(AuthError::InvalidCode)?;
        self.store.delete_value(Collection::PendingTwoFactor).await?;
        self.create_session(&user).await
    }

    /// Issue and persist a session for `user`, replacing any active one.
    pub async fn create_session(&self, user: &User) -> Result<Session, AuthError> {
        let session = Session {
            user: user.clone(),
            token: Uuid::new_v4().to_string(),
            expires_at: Utc::now() + self.session_ttl,
        };
        self.store.put_value(Collection::Session, &session).await?;
        info!(email = %user.email, role = user.role.as_str(), "session started");
        Ok(session)
    }

    pub async fn logout(&self) -> Result<(), AuthError> {
        self.store.delete_value(Collection::Session).await?;
        Ok(())
    }

    /// Change a user's role. The master admin's role is fixed.
    #[instrument(skip_all, fields(user_id = %user_id, role = role.as_str()))]
    pub async fn update_user_role(
        &self,
        session: Option<&Session>,
        user_id: &str,
        role: Role,
    ) -> Result<bool, AuthError> {
        require_admin(session)?;
        let Some(mut user) = self.store.get::<User>(Collection::Users, user_id).await? else {
            return Ok(false);
        };
        if normalize_email(&user.email) == self.master_email {
            warn!("refusing to change the master admin's role");
            return Ok(false);
        }
        user.role = role;
        if !self.store.replace(Collection::Users, &user).await? {
            return Ok(false);
        }
        // A signed-in session carries a copy of the user; keep its role current.
        let stored: Option<Session> = self.store.get_value(Collection::Session).await?;
        if let Some(mut stored) = stored.filter(|s| s.user.id == user.id) {
            stored.user.role = role;
            self.store.put_value(Collection::Session, &stored).await?;
            info!(email = %user.email, "signed-in session updated with new role");
        }
        Ok(true)
    }

    pub async fn blacklist(&self) -> Result<Vec<String>, AuthError> {
        Ok(self.store.list(Collection::Blacklist).await?)
    }

    pub async fn is_blacklisted(&self, email: &str) -> Result<bool, AuthError> {
        let email = normalize_email(email);
        Ok(self.blacklist().await?.iter().any(|e| normalize_email(e) == email))
    }

    /// Block an email. The master admin cannot be blocked.
    pub async fn add_to_blacklist(
        &self,
        session: Option<&Session>,
        email: &str,
    ) -> Result<bool, AuthError> {
        require_admin(session)?;
        let email = normalize_email(email);
        if email == self.master_email {
            return Ok(false);
        }
        let inserted = self
            .store
            .upsert(Collection::Blacklist, &email, |e: &String| {
                normalize_email(e) == email
            })
            .await?;
        Ok(inserted)
    }

    pub async fn remove_from_blacklist(
        &self,
        session: Option<&Session>,
        email: &str,
    ) -> Result<bool, AuthError> {
        require_admin(session)?;
        let email = normalize_email(email);
        let removed = self
            .store
            .remove_where(Collection::Blacklist, |e: &String| normalize_email(e) == email)
            .await?;
        Ok(removed > 0)
    }
}
