//! In-process key store for tests and local runs without Postgres.

use super::{KeyStore, MAX_KEY_COLLISIONS};
use crate::models::{
    generate_key, normalize_key, plan_redemption, KeyFilter, KeyStats, KeyStatus, NewKeyBatch,
    RedeemError, Redemption, RegistrationKey, Subscription,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use service_core::error::AppError;
use std::collections::HashMap;
use tokio::sync::Mutex;

#[derive(Default)]
pub struct MemoryKeyStore {
    keys: Mutex<HashMap<String, RegistrationKey>>,
}

impl MemoryKeyStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a key with a known value.
    pub async fn insert(&self, key: RegistrationKey) {
        self.keys.lock().await.insert(normalize_key(&key.key), key);
    }
}

fn latest_expiry<'a>(
    keys: impl Iterator<Item = &'a RegistrationKey>,
    user_id: &str,
) -> Option<DateTime<Utc>> {
    keys.filter(|k| k.revoked_at.is_none() && k.redeemed_by.as_deref() == Some(user_id))
        .filter_map(|k| k.expires_at)
        .max()
}

#[async_trait]
impl KeyStore for MemoryKeyStore {
    fn backend(&self) -> &'static str {
        "memory"
    }

    async fn create_keys(&self, batch: &NewKeyBatch) -> Result<Vec<RegistrationKey>, AppError> {
        let now = Utc::now();
        let mut keys = self.keys.lock().await;
        let mut created = Vec::with_capacity(batch.count);

        for _ in 0..batch.count {
            let value = (0..MAX_KEY_COLLISIONS)
                .map(|_| generate_key(&batch.prefix))
                .find(|candidate| !keys.contains_key(candidate))
                .ok_or_else(|| {
                    AppError::InternalError(anyhow::anyhow!("Could not generate a unique key"))
                })?;

            let key = RegistrationKey::new(value.clone(), batch.duration_days, batch.note.clone(), now);
            keys.insert(value, key.clone());
            created.push(key);
        }

        Ok(created)
    }

    async fn list_keys(
        &self,
        filter: KeyFilter,
        limit: i64,
        offset: i64,
        now: DateTime<Utc>,
    ) -> Result<Vec<RegistrationKey>, AppError> {
        let keys = self.keys.lock().await;
        let mut matching: Vec<RegistrationKey> = keys
            .values()
            .filter(|k| filter.matches(k, now))
            .cloned()
            .collect();
        matching.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(a.key.cmp(&b.key)));

        Ok(matching
            .into_iter()
            .skip(offset.max(0) as usize)
            .take(limit.max(0) as usize)
            .collect())
    }

    async fn key_stats(&self, now: DateTime<Utc>) -> Result<KeyStats, AppError> {
        let keys = self.keys.lock().await;
        let mut stats = KeyStats::default();
        for key in keys.values() {
            stats.total += 1;
            match key.status(now) {
                KeyStatus::Unused => stats.unused += 1,
                KeyStatus::Active => stats.active += 1,
                KeyStatus::Expired => stats.expired += 1,
                KeyStatus::Revoked => stats.revoked += 1,
            }
        }
        Ok(stats)
    }

    async fn revoke_key(&self, key: &str, now: DateTime<Utc>) -> Result<RegistrationKey, AppError> {
        let mut keys = self.keys.lock().await;
        let entry = keys
            .get_mut(&normalize_key(key))
            .ok_or(RedeemError::NotFound)?;
        if entry.revoked_at.is_none() {
            entry.revoked_at = Some(now);
        }
        Ok(entry.clone())
    }

    async fn redeem_key(
        &self,
        key: &str,
        user_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Redemption, AppError> {
        let mut keys = self.keys.lock().await;
        let normalized = normalize_key(key);

        let current_expiry = latest_expiry(keys.values(), user_id);
        let entry = keys.get_mut(&normalized).ok_or(RedeemError::NotFound)?;
        let expires_at = plan_redemption(entry, current_expiry, now)?;

        entry.redeemed_by = Some(user_id.to_string());
        entry.redeemed_at = Some(now);
        entry.expires_at = Some(expires_at);

        Ok(Redemption {
            key: normalized,
            user_id: user_id.to_string(),
            redeemed_at: now,
            expires_at,
        })
    }

    async fn subscription(&self, user_id: &str) -> Result<Option<Subscription>, AppError> {
        let keys = self.keys.lock().await;
        Ok(
            latest_expiry(keys.values(), user_id).map(|expires_at| Subscription {
                user_id: user_id.to_string(),
                expires_at,
            }),
        )
    }

    async fn health_check(&self) -> Result<(), AppError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use std::sync::Arc;

    fn batch(count: usize, days: i32) -> NewKeyBatch {
        NewKeyBatch {
            count,
            duration_days: days,
            note: Some("test".into()),
            prefix: "TRD".into(),
        }
    }

    #[tokio::test]
    async fn test_create_and_redeem() {
        let store = MemoryKeyStore::new();
        let keys = store.create_keys(&batch(2, 30)).await.unwrap();
        assert_eq!(keys.len(), 2);
        assert_ne!(keys[0].key, keys[1].key);

        let now = Utc::now();
        let lower = keys[0].key.to_lowercase();
        let redemption = store.redeem_key(&format!("  {} ", lower), "user-1", now).await.unwrap();
        assert_eq!(redemption.key, keys[0].key);
        assert_eq!(redemption.expires_at, now + Duration::days(30));

        let sub = store.subscription("user-1").await.unwrap().unwrap();
        assert!(sub.is_active(now));
        assert!(store.subscription("user-2").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_second_key_stacks() {
        let store = MemoryKeyStore::new();
        let keys = store.create_keys(&batch(2, 10)).await.unwrap();
        let now = Utc::now();

        store.redeem_key(&keys[0].key, "u", now).await.unwrap();
        let second = store.redeem_key(&keys[1].key, "u", now).await.unwrap();
        assert_eq!(second.expires_at, now + Duration::days(20));
    }

    #[tokio::test]
    async fn test_redeem_errors() {
        let store = MemoryKeyStore::new();
        let keys = store.create_keys(&batch(2, 10)).await.unwrap();
        let now = Utc::now();

        let err = store.redeem_key("NOPE", "u", now).await.unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));

        store.redeem_key(&keys[0].key, "u", now).await.unwrap();
        let err = store.redeem_key(&keys[0].key, "other", now).await.unwrap_err();
        assert!(matches!(err, AppError::Conflict(_)));

        store.revoke_key(&keys[1].key, now).await.unwrap();
        let err = store.redeem_key(&keys[1].key, "u", now).await.unwrap_err();
        assert!(matches!(err, AppError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_revoked_key_ends_subscription() {
        let store = MemoryKeyStore::new();
        let keys = store.create_keys(&batch(1, 10)).await.unwrap();
        let now = Utc::now();

        store.redeem_key(&keys[0].key, "u", now).await.unwrap();
        store.revoke_key(&keys[0].key, now).await.unwrap();
        assert!(store.subscription("u").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_concurrent_redemption_single_winner() {
        let store = Arc::new(MemoryKeyStore::new());
        let key = store.create_keys(&batch(1, 10)).await.unwrap().remove(0).key;

        let mut handles = Vec::new();
        for i in 0..8 {
            let store = store.clone();
            let key = key.clone();
            handles.push(tokio::spawn(async move {
                store.redeem_key(&key, &format!("user-{}", i), Utc::now()).await
            }));
        }

        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap().is_ok() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn test_stats_and_filters() {
        let store = MemoryKeyStore::new();
        let keys = store.create_keys(&batch(3, 10)).await.unwrap();
        let now = Utc::now();
        store.redeem_key(&keys[0].key, "u", now).await.unwrap();
        store.revoke_key(&keys[1].key, now).await.unwrap();

        let stats = store.key_stats(now).await.unwrap();
        assert_eq!(
            stats,
            KeyStats {
                total: 3,
                unused: 1,
                active: 1,
                expired: 0,
                revoked: 1,
            }
        );

        let unused = store.list_keys(KeyFilter::Unused, 50, 0, now).await.unwrap();
        assert_eq!(unused.len(), 1);
        assert_eq!(unused[0].key, keys[2].key);

        let later = now + Duration::days(11);
        let expired = store.list_keys(KeyFilter::Expired, 50, 0, later).await.unwrap();
        assert_eq!(expired.len(), 1);

        let page = store.list_keys(KeyFilter::All, 2, 2, now).await.unwrap();
        assert_eq!(page.len(), 1);
    }
}
