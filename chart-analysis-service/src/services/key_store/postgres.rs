//! PostgreSQL key store.

use super::{KeyStore, MAX_KEY_COLLISIONS};
use crate::config::DatabaseConfig;
use crate::models::{
    generate_key, normalize_key, plan_redemption, KeyFilter, KeyStats, NewKeyBatch, RedeemError,
    Redemption, RegistrationKey, Subscription,
};
use crate::services::metrics;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use secrecy::ExposeSecret;
use service_core::error::AppError;
use sqlx::postgres::{PgPool, PgPoolOptions};
use std::time::Duration;
use tracing::{info, instrument};

const KEY_COLUMNS: &str =
    "key, duration_days, note, created_at, redeemed_by, redeemed_at, expires_at, revoked_at";

/// SQL predicate for each filter; `$1` is the current time.
fn filter_clause(filter: KeyFilter) -> &'static str {
    match filter {
        KeyFilter::All => "TRUE",
        KeyFilter::Unused => "revoked_at IS NULL AND redeemed_by IS NULL",
        KeyFilter::Active => "revoked_at IS NULL AND expires_at > $1",
        KeyFilter::Expired => "revoked_at IS NULL AND expires_at <= $1",
        KeyFilter::Revoked => "revoked_at IS NOT NULL",
    }
}

fn db_error(context: &str, e: sqlx::Error) -> AppError {
    AppError::DatabaseError(anyhow::anyhow!("{}: {}", context, e))
}

#[derive(Clone)]
pub struct PgKeyStore {
    pool: PgPool,
}

impl PgKeyStore {
    /// Connect and build the pool.
    #[instrument(skip(config))]
    pub async fn connect(config: &DatabaseConfig) -> Result<Self, AppError> {
        let url = config.url.as_ref().ok_or_else(|| {
            AppError::ConfigError(anyhow::anyhow!("DATABASE_URL is required but not set"))
        })?;

        info!(
            max_connections = config.max_connections,
            min_connections = config.min_connections,
            "Connecting to PostgreSQL"
        );

        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(Duration::from_secs(30))
            .idle_timeout(Duration::from_secs(600))
            .max_lifetime(Duration::from_secs(1800))
            .connect(url.expose_secret())
            .await
            .map_err(|e| db_error("Failed to connect", e))?;

        info!("PostgreSQL connection pool established");

        Ok(Self { pool })
    }

    #[instrument(skip(self))]
    pub async fn run_migrations(&self) -> Result<(), AppError> {
        info!("Running database migrations");
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Migration failed: {}", e)))?;
        info!("Database migrations completed");
        Ok(())
    }
}

#[async_trait]
impl KeyStore for PgKeyStore {
    fn backend(&self) -> &'static str {
        "postgres"
    }

    #[instrument(skip(self, batch), fields(count = batch.count, duration_days = batch.duration_days))]
    async fn create_keys(&self, batch: &NewKeyBatch) -> Result<Vec<RegistrationKey>, AppError> {
        let _timer = metrics::db_timer("create_keys");
        let now = Utc::now();
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| db_error("Failed to begin transaction", e))?;
        let mut created = Vec::with_capacity(batch.count);

        for _ in 0..batch.count {
            let mut inserted = None;
            for _ in 0..MAX_KEY_COLLISIONS {
                let key = RegistrationKey::new(
                    generate_key(&batch.prefix),
                    batch.duration_days,
                    batch.note.clone(),
                    now,
                );
                let result = sqlx::query(
                    r#"
                    INSERT INTO registration_keys (key, duration_days, note, created_at)
                    VALUES ($1, $2, $3, $4)
                    ON CONFLICT (key) DO NOTHING
                    "#,
                )
                .bind(&key.key)
                .bind(key.duration_days)
                .bind(&key.note)
                .bind(key.created_at)
                .execute(&mut *tx)
                .await
                .map_err(|e| db_error("Failed to insert key", e))?;

                if result.rows_affected() == 1 {
                    inserted = Some(key);
                    break;
                }
                tracing::warn!("Registration key collision, regenerating");
            }

            let key = inserted.ok_or_else(|| {
                AppError::InternalError(anyhow::anyhow!("Could not generate a unique key"))
            })?;
            created.push(key);
        }

        tx.commit()
            .await
            .map_err(|e| db_error("Failed to commit transaction", e))?;

        Ok(created)
    }

    #[instrument(skip(self))]
    async fn list_keys(
        &self,
        filter: KeyFilter,
        limit: i64,
        offset: i64,
        now: DateTime<Utc>,
    ) -> Result<Vec<RegistrationKey>, AppError> {
        let _timer = metrics::db_timer("list_keys");
        let sql = format!(
            "SELECT {} FROM registration_keys WHERE ($1::timestamptz IS NOT NULL) AND {} \
             ORDER BY created_at DESC, key ASC LIMIT $2 OFFSET $3",
            KEY_COLUMNS,
            filter_clause(filter)
        );

        sqlx::query_as::<_, RegistrationKey>(&sql)
            .bind(now)
            .bind(limit)
            .bind(offset)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| db_error("Failed to list keys", e))
    }

    #[instrument(skip(self))]
    async fn key_stats(&self, now: DateTime<Utc>) -> Result<KeyStats, AppError> {
        let _timer = metrics::db_timer("key_stats");
        let row: (i64, i64, i64, i64, i64) = sqlx::query_as(
            r#"
            SELECT
                COUNT(*),
                COUNT(*) FILTER (WHERE revoked_at IS NULL AND redeemed_by IS NULL),
                COUNT(*) FILTER (WHERE revoked_at IS NULL AND expires_at > $1),
                COUNT(*) FILTER (WHERE revoked_at IS NULL AND expires_at <= $1),
                COUNT(*) FILTER (WHERE revoked_at IS NOT NULL)
            FROM registration_keys
            "#,
        )
        .bind(now)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| db_error("Failed to count keys", e))?;

        Ok(KeyStats {
            total: row.0,
            unused: row.1,
            active: row.2,
            expired: row.3,
            revoked: row.4,
        })
    }

    #[instrument(skip(self), fields(key = %key))]
    async fn revoke_key(&self, key: &str, now: DateTime<Utc>) -> Result<RegistrationKey, AppError> {
        let _timer = metrics::db_timer("revoke_key");
        let sql = format!(
            "UPDATE registration_keys SET revoked_at = COALESCE(revoked_at, $2) \
             WHERE key = $1 RETURNING {}",
            KEY_COLUMNS
        );

        sqlx::query_as::<_, RegistrationKey>(&sql)
            .bind(normalize_key(key))
            .bind(now)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| db_error("Failed to revoke key", e))?
            .ok_or_else(|| RedeemError::NotFound.into())
    }

    /// Take a per-user advisory lock, lock the key row, read the user's
    /// current expiry, then mark the key redeemed, all in one transaction.
    /// The advisory lock keeps two keys redeemed at once by the same user
    /// from stacking onto the same base expiry.
    #[instrument(skip(self, key), fields(user_id = %user_id))]
    async fn redeem_key(
        &self,
        key: &str,
        user_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Redemption, AppError> {
        let _timer = metrics::db_timer("redeem_key");
        let normalized = normalize_key(key);

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| db_error("Failed to begin transaction", e))?;

        sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1))")
            .bind(user_id)
            .execute(&mut *tx)
            .await
            .map_err(|e| db_error("Failed to lock subscription", e))?;

        let select = format!(
            "SELECT {} FROM registration_keys WHERE key = $1 FOR UPDATE",
            KEY_COLUMNS
        );
        let row = sqlx::query_as::<_, RegistrationKey>(&select)
            .bind(&normalized)
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| db_error("Failed to load key", e))?;

        let Some(row) = row else {
            tx.rollback().await.ok();
            return Err(RedeemError::NotFound.into());
        };

        let current_expiry: Option<DateTime<Utc>> = sqlx::query_scalar(
            r#"
            SELECT MAX(expires_at) FROM registration_keys
            WHERE redeemed_by = $1 AND revoked_at IS NULL
            "#,
        )
        .bind(user_id)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| db_error("Failed to read subscription", e))?;

        let expires_at = match plan_redemption(&row, current_expiry, now) {
            Ok(expires_at) => expires_at,
            Err(e) => {
                tx.rollback().await.ok();
                return Err(e.into());
            }
        };

        sqlx::query(
            r#"
            UPDATE registration_keys
            SET redeemed_by = $2, redeemed_at = $3, expires_at = $4
            WHERE key = $1
            "#,
        )
        .bind(&normalized)
        .bind(user_id)
        .bind(now)
        .bind(expires_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| db_error("Failed to redeem key", e))?;

        tx.commit()
            .await
            .map_err(|e| db_error("Failed to commit transaction", e))?;

        info!(key = %normalized, expires_at = %expires_at, "Registration key redeemed");

        Ok(Redemption {
            key: normalized,
            user_id: user_id.to_string(),
            redeemed_at: now,
            expires_at,
        })
    }

    #[instrument(skip(self))]
    async fn subscription(&self, user_id: &str) -> Result<Option<Subscription>, AppError> {
        let _timer = metrics::db_timer("subscription");
        let expires_at: Option<DateTime<Utc>> = sqlx::query_scalar(
            r#"
            SELECT MAX(expires_at) FROM registration_keys
            WHERE redeemed_by = $1 AND revoked_at IS NULL
            "#,
        )
        .bind(user_id)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| db_error("Failed to read subscription", e))?;

        Ok(expires_at.map(|expires_at| Subscription {
            user_id: user_id.to_string(),
            expires_at,
        }))
    }

    async fn health_check(&self) -> Result<(), AppError> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| {
                tracing::error!("Database health check failed: {}", e);
                AppError::DatabaseError(anyhow::anyhow!("Database health check failed: {}", e))
            })?;
        Ok(())
    }
}
