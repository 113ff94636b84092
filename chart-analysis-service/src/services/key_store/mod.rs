//! Storage for registration keys and the subscriptions they grant.

pub mod memory;
pub mod postgres;

use crate::models::{KeyFilter, KeyStats, NewKeyBatch, Redemption, RegistrationKey, Subscription};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use service_core::error::AppError;

pub use memory::MemoryKeyStore;
pub use postgres::PgKeyStore;

/// How many times key generation is retried on a primary-key collision.
pub(crate) const MAX_KEY_COLLISIONS: usize = 5;

#[async_trait]
pub trait KeyStore: Send + Sync {
    /// Backend name for logs and readiness output.
    fn backend(&self) -> &'static str;

    /// Issue `batch.count` fresh keys.
    async fn create_keys(&self, batch: &NewKeyBatch) -> Result<Vec<RegistrationKey>, AppError>;

    /// Keys matching `filter`, newest first.
    async fn list_keys(
        &self,
        filter: KeyFilter,
        limit: i64,
        offset: i64,
        now: DateTime<Utc>,
    ) -> Result<Vec<RegistrationKey>, AppError>;

    async fn key_stats(&self, now: DateTime<Utc>) -> Result<KeyStats, AppError>;

    /// Revoke a key. Returns `NotFound` for unknown keys; revoking twice is a no-op.
    async fn revoke_key(&self, key: &str, now: DateTime<Utc>) -> Result<RegistrationKey, AppError>;

    /// Redeem `key` for `user_id`, atomically with respect to other redemptions.
    async fn redeem_key(
        &self,
        key: &str,
        user_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Redemption, AppError>;

    /// The user's latest access window, if any key was ever redeemed.
    async fn subscription(&self, user_id: &str) -> Result<Option<Subscription>, AppError>;

    async fn health_check(&self) -> Result<(), AppError>;
}
