//! Registration key model - one-time codes that grant time-limited access.

use chrono::{DateTime, Duration, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use service_core::error::AppError;
use sqlx::FromRow;
use thiserror::Error;

/// Characters used in generated keys; no 0/O or 1/I/L.
const KEY_ALPHABET: &[u8] = b"ABCDEFGHJKMNPQRSTUVWXYZ23456789";
const KEY_GROUPS: usize = 3;
const KEY_GROUP_LEN: usize = 4;

pub const MAX_DURATION_DAYS: i32 = 3650;

/// Lifecycle state derived from the row's timestamps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyStatus {
    Unused,
    Active,
    Expired,
    Revoked,
}

impl KeyStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            KeyStatus::Unused => "unused",
            KeyStatus::Active => "active",
            KeyStatus::Expired => "expired",
            KeyStatus::Revoked => "revoked",
        }
    }
}

/// Registration key entity.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct RegistrationKey {
    pub key: String,
    pub duration_days: i32,
    pub note: Option<String>,
    pub created_at: DateTime<Utc>,
    pub redeemed_by: Option<String>,
    pub redeemed_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
    pub revoked_at: Option<DateTime<Utc>>,
}

impl RegistrationKey {
    pub fn new(key: String, duration_days: i32, note: Option<String>, now: DateTime<Utc>) -> Self {
        Self {
            key,
            duration_days,
            note,
            created_at: now,
            redeemed_by: None,
            redeemed_at: None,
            expires_at: None,
            revoked_at: None,
        }
    }

    pub fn status(&self, now: DateTime<Utc>) -> KeyStatus {
        if self.revoked_at.is_some() {
            return KeyStatus::Revoked;
        }
        match self.expires_at {
            None => KeyStatus::Unused,
            Some(expires) if expires > now => KeyStatus::Active,
            Some(_) => KeyStatus::Expired,
        }
    }
}

/// Dashboard filter over key status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyFilter {
    #[default]
    All,
    Unused,
    Active,
    Expired,
    Revoked,
}

impl KeyFilter {
    pub fn as_str(&self) -> &'static str {
        match self {
            KeyFilter::All => "all",
            KeyFilter::Unused => "unused",
            KeyFilter::Active => "active",
            KeyFilter::Expired => "expired",
            KeyFilter::Revoked => "revoked",
        }
    }

    pub fn matches(&self, key: &RegistrationKey, now: DateTime<Utc>) -> bool {
        let status = key.status(now);
        match self {
            KeyFilter::All => true,
            KeyFilter::Unused => status == KeyStatus::Unused,
            KeyFilter::Active => status == KeyStatus::Active,
            KeyFilter::Expired => status == KeyStatus::Expired,
            KeyFilter::Revoked => status == KeyStatus::Revoked,
        }
    }
}

/// A request to issue `count` keys with the same duration and note.
#[derive(Debug, Clone)]
pub struct NewKeyBatch {
    pub count: usize,
    pub duration_days: i32,
    pub note: Option<String>,
    pub prefix: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct KeyStats {
    pub total: i64,
    pub unused: i64,
    pub active: i64,
    pub expired: i64,
    pub revoked: i64,
}

/// Outcome of a successful redemption.
#[derive(Debug, Clone, Serialize)]
pub struct Redemption {
    pub key: String,
    pub user_id: String,
    pub redeemed_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// A user's access window.
#[derive(Debug, Clone, Serialize)]
pub struct Subscription {
    pub user_id: String,
    pub expires_at: DateTime<Utc>,
}

impl Subscription {
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        self.expires_at > now
    }

    pub fn days_remaining(&self, now: DateTime<Utc>) -> i64 {
        let remaining = self.expires_at - now;
        if remaining <= Duration::zero() {
            0
        } else {
            // Round partial days up so "expires in 3h" shows as 1 day.
            (remaining.num_seconds() + 86_399) / 86_400
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RedeemError {
    #[error("Invalid registration key")]
    NotFound,

    #[error("This registration key has been revoked")]
    Revoked,

    #[error("This registration key has already been used")]
    AlreadyRedeemed,
}

impl From<RedeemError> for AppError {
    fn from(err: RedeemError) -> Self {
        match err {
            RedeemError::NotFound => AppError::NotFound(anyhow::anyhow!(err)),
            RedeemError::Revoked | RedeemError::AlreadyRedeemed => {
                AppError::Conflict(anyhow::anyhow!(err))
            }
        }
    }
}

/// Decide the new expiry for redeeming `key`.
///
/// Access stacks: time is added on top of an active subscription rather than
/// starting from `now`.
pub fn plan_redemption(
    key: &RegistrationKey,
    current_expiry: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> Result<DateTime<Utc>, RedeemError> {
    if key.revoked_at.is_some() {
        return Err(RedeemError::Revoked);
    }
    if key.redeemed_by.is_some() {
        return Err(RedeemError::AlreadyRedeemed);
    }
    let base = current_expiry.filter(|e| *e > now).unwrap_or(now);
    Ok(base + Duration::days(i64::from(key.duration_days)))
}

/// Canonical form used for storage and lookup.
pub fn normalize_key(input: &str) -> String {
    input.trim().to_ascii_uppercase()
}

/// Generate `PREFIX-XXXX-XXXX-XXXX`.
pub fn generate_key(prefix: &str) -> String {
    let mut rng = rand::thread_rng();
    let groups: Vec<String> = (0..KEY_GROUPS)
        .map(|_| {
            (0..KEY_GROUP_LEN)
                .map(|_| KEY_ALPHABET[rng.gen_range(0..KEY_ALPHABET.len())] as char)
                .collect()
        })
        .collect();

    let prefix = normalize_key(prefix);
    if prefix.is_empty() {
        groups.join("-")
    } else {
        format!("{}-{}", prefix, groups.join("-"))
    }
}
