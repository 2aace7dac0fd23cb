use anyhow::Result;
use chrono::{DateTime, Utc};
use sessionward_core::{DeviceInfo, DeviceType, Location, Session};
use sqlx::FromRow;
use uuid::Uuid;

use crate::StoragePool;

/// Flat row shape of `refresh_sessions`.
#[derive(Debug, Clone, FromRow)]
pub struct RefreshSessionRecord {
    pub session_id: Uuid,
    pub user_id: Uuid,
    pub secret_hash: String,
    pub device_name: String,
    pub device_type: String,
    pub browser: String,
    pub os: String,
    pub user_agent: String,
    pub ip_address: String,
    pub country: Option<String>,
    pub region: Option<String>,
    pub city: Option<String>,
    pub timezone: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_used_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub is_revoked: bool,
    pub is_suspicious: bool,
    pub suspicion_reason: Option<String>,
}

impl From<RefreshSessionRecord> for Session {
    fn from(record: RefreshSessionRecord) -> Self {
        let location = record.country.map(|country| Location {
            country,
            region: record.region.unwrap_or_default(),
            city: record.city.unwrap_or_default(),
            timezone: record.timezone.unwrap_or_default(),
        });
        Session {
            session_id: record.session_id,
            user_id: record.user_id,
            secret_hash: record.secret_hash,
            device: DeviceInfo {
                device_name: record.device_name,
                device_type: DeviceType::from(record.device_type.as_str()),
                browser: record.browser,
                os: record.os,
                user_agent: record.user_agent,
            },
            ip_address: record.ip_address,
            location,
            created_at: record.created_at,
            last_used_at: record.last_used_at,
            expires_at: record.expires_at,
            is_revoked: record.is_revoked,
            is_suspicious: record.is_suspicious,
            suspicion_reason: record.suspicion_reason,
        }
    }
}

const SESSION_COLUMNS: &str = r#"session_id,
       user_id,
       secret_hash,
       device_name,
       device_type,
       browser,
       os,
       user_agent,
       ip_address,
       country,
       region,
       city,
       timezone,
       created_at,
       last_used_at,
       expires_at,
       is_revoked,
       is_suspicious,
       suspicion_reason"#;

#[derive(Clone)]
pub struct RefreshSessionStore {
    pool: StoragePool,
}

impl RefreshSessionStore {
    pub fn new(pool: StoragePool) -> Self {
        Self { pool }
    }

    pub async fn insert(&self, session: &Session) -> Result<()> {
        let location = session.location.as_ref();
        sqlx::query(
            r#"
            INSERT INTO refresh_sessions (
                session_id,
                user_id,
                secret_hash,
                device_name,
                device_type,
                browser,
                os,
                user_agent,
                ip_address,
                country,
                region,
                city,
                timezone,
                created_at,
                last_used_at,
                expires_at,
                is_revoked,
                is_suspicious,
                suspicion_reason
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $19)
            "#,
        )
        .bind(session.session_id)
        .bind(session.user_id)
        .bind(&session.secret_hash)
        .bind(&session.device.device_name)
        .bind(session.device.device_type.as_str())
        .bind(&session.device.browser)
        .bind(&session.device.os)
        .bind(&session.device.user_agent)
        .bind(&session.ip_address)
        .bind(location.map(|loc| loc.country.as_str()))
        .bind(location.map(|loc| loc.region.as_str()))
        .bind(location.map(|loc| loc.city.as_str()))
        .bind(location.map(|loc| loc.timezone.as_str()))
        .bind(session.created_at)
        .bind(session.last_used_at)
        .bind(session.expires_at)
        .bind(session.is_revoked)
        .bind(session.is_suspicious)
        .bind(session.suspicion_reason.as_deref())
        .execute(self.pool.pool())
        .await?;
        Ok(())
    }

    pub async fn find(&self, session_id: Uuid) -> Result<Option<Session>> {
        let query = format!("SELECT {SESSION_COLUMNS} FROM refresh_sessions WHERE session_id = $1");
        let record = sqlx::query_as::<_, RefreshSessionRecord>(&query)
            .bind(session_id)
            .fetch_optional(self.pool.pool())
            .await?;
        Ok(record.map(Session::from))
    }

    /// Look up an unrevoked, unexpired session by the digest of its secret.
    pub async fn find_valid_by_hash(
        &self,
        secret_hash: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<Session>> {
        let query = format!(
            r#"
            SELECT {SESSION_COLUMNS}
            FROM refresh_sessions
            WHERE secret_hash = $1
              AND is_revoked = FALSE
              AND expires_at > $2
            "#
        );
        let record = sqlx::query_as::<_, RefreshSessionRecord>(&query)
            .bind(secret_hash)
            .bind(now)
            .fetch_optional(self.pool.pool())
            .await?;
        Ok(record.map(Session::from))
    }

    pub async fn record_use(&self, session_id: Uuid, used_at: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE refresh_sessions
            SET last_used_at = $2
            WHERE session_id = $1
            "#,
        )
        .bind(session_id)
        .bind(used_at)
        .execute(self.pool.pool())
        .await?;
        Ok(())
    }

    /// Returns whether the row moved from valid to revoked.
    pub async fn revoke(&self, session_id: Uuid) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE refresh_sessions
            SET is_revoked = TRUE
            WHERE session_id = $1 AND is_revoked = FALSE
            "#,
        )
        .bind(session_id)
        .execute(self.pool.pool())
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn revoke_all_for_user(&self, user_id: Uuid) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE refresh_sessions
            SET is_revoked = TRUE
            WHERE user_id = $1 AND is_revoked = FALSE
            "#,
        )
        .bind(user_id)
        .execute(self.pool.pool())
        .await?;
        Ok(result.rows_affected())
    }

    pub async fn revoke_all_other_for_user(&self, user_id: Uuid, keep: Uuid) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE refresh_sessions
            SET is_revoked = TRUE
            WHERE user_id = $1 AND session_id <> $2 AND is_revoked = FALSE
            "#,
        )
        .bind(user_id)
        .bind(keep)
        .execute(self.pool.pool())
        .await?;
        Ok(result.rows_affected())
    }

    pub async fn count_valid_for_user(&self, user_id: Uuid, now: DateTime<Utc>) -> Result<usize> {
        let (count,): (i64,) = sqlx::query_as(
            r#"
            SELECT COUNT(*)
            FROM refresh_sessions
            WHERE user_id = $1 AND is_revoked = FALSE AND expires_at > $2
            "#,
        )
        .bind(user_id)
        .bind(now)
        .fetch_one(self.pool.pool())
        .await?;
        Ok(usize::try_from(count).unwrap_or_default())
    }

    /// The least recently used valid session, ties broken by creation time.
    pub async fn oldest_valid_for_user(
        &self,
        user_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Option<Session>> {
        let query = format!(
            r#"
            SELECT {SESSION_COLUMNS}
            FROM refresh_sessions
            WHERE user_id = $1 AND is_revoked = FALSE AND expires_at > $2
            ORDER BY last_used_at ASC, created_at ASC
            LIMIT 1
            "#
        );
        let record = sqlx::query_as::<_, RefreshSessionRecord>(&query)
            .bind(user_id)
            .bind(now)
            .fetch_optional(self.pool.pool())
            .await?;
        Ok(record.map(Session::from))
    }

    /// Most recent sessions regardless of state, newest first.
    pub async fn recent_for_user(&self, user_id: Uuid, limit: usize) -> Result<Vec<Session>> {
        let query = format!(
            r#"
            SELECT {SESSION_COLUMNS}
            FROM refresh_sessions
            WHERE user_id = $1
            ORDER BY created_at DESC
            LIMIT $2
            "#
        );
        let records = sqlx::query_as::<_, RefreshSessionRecord>(&query)
            .bind(user_id)
            .bind(i64::try_from(limit).unwrap_or(i64::MAX))
            .fetch_all(self.pool.pool())
            .await?;
        Ok(records.into_iter().map(Session::from).collect())
    }

    pub async fn list_valid_for_user(
        &self,
        user_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Vec<Session>> {
        let query = format!(
            r#"
            SELECT {SESSION_COLUMNS}
            FROM refresh_sessions
            WHERE user_id = $1 AND is_revoked = FALSE AND expires_at > $2
            ORDER BY last_used_at DESC
            "#
        );
        let records = sqlx::query_as::<_, RefreshSessionRecord>(&query)
            .bind(user_id)
            .bind(now)
            .fetch_all(self.pool.pool())
            .await?;
        Ok(records.into_iter().map(Session::from).collect())
    }

    /// Delete sessions whose expiry has passed. Revoked but unexpired rows are
    /// kept so they still feed suspicion history.
    pub async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query("DELETE FROM refresh_sessions WHERE expires_at <= $1")
            .bind(now)
            .execute(self.pool.pool())
            .await?;
        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::test_pool;
    use chrono::{Duration, SubsecRound};
    use sessionward_core::{parse_device, NewSession};

    fn new_session(user_id: Uuid, now: DateTime<Utc>, location: Option<Location>) -> Session {
        let secret_hash = format!("{:064x}", Uuid::new_v4().as_u128());
        NewSession {
            user_id,
            secret_hash,
            device: parse_device(
                "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7; rv:121.0) Gecko/20100101 Firefox/121.0",
                None,
            ),
            ip_address: "203.0.113.10".into(),
            location,
            ttl: Duration::days(7),
            is_suspicious: false,
            suspicion_reason: None,
        }
        .into_session(Uuid::new_v4(), now)
    }

    #[tokio::test]
    async fn insert_find_touch_and_revoke() -> anyhow::Result<()> {
        let Some(pool) = test_pool("refresh session persistence test").await? else {
            return Ok(());
        };
        let store = RefreshSessionStore::new(pool.clone());
        let user_id = Uuid::new_v4();
        let now = Utc::now().trunc_subsecs(6);
        let session = new_session(
            user_id,
            now,
            Some(Location::new("US", "CA", "San Francisco", "America/Los_Angeles")),
        );

        store.insert(&session).await?;
        let fetched = store.find(session.session_id).await?.expect("record exists");
        assert_eq!(fetched, session);

        let by_hash = store
            .find_valid_by_hash(&session.secret_hash, now)
            .await?
            .expect("valid session");
        assert_eq!(by_hash.session_id, session.session_id);
        assert!(store
            .find_valid_by_hash(&session.secret_hash, session.expires_at)
            .await?
            .is_none());

        let later = now + Duration::minutes(5);
        store.record_use(session.session_id, later).await?;
        let touched = store.find(session.session_id).await?.expect("record exists");
        assert_eq!(touched.last_used_at, later);
        assert_eq!(touched.expires_at, session.expires_at);

        assert!(store.revoke(session.session_id).await?);
        assert!(!store.revoke(session.session_id).await?);
        assert!(store
            .find_valid_by_hash(&session.secret_hash, now)
            .await?
            .is_none());
        assert_eq!(store.recent_for_user(user_id, 20).await?.len(), 1);

        sqlx::query("DELETE FROM refresh_sessions WHERE user_id = $1")
            .bind(user_id)
            .execute(pool.pool())
            .await?;
        Ok(())
    }

    #[tokio::test]
    async fn oldest_valid_is_least_recently_used() -> anyhow::Result<()> {
        let Some(pool) = test_pool("refresh session ordering test").await? else {
            return Ok(());
        };
        let store = RefreshSessionStore::new(pool.clone());
        let user_id = Uuid::new_v4();
        let now = Utc::now().trunc_subsecs(6);

        let first = new_session(user_id, now, None);
        let second = new_session(user_id, now + Duration::seconds(1), None);
        let third = new_session(user_id, now + Duration::seconds(2), None);
        for session in [&first, &second, &third] {
            store.insert(session).await?;
        }
        store
            .record_use(first.session_id, now + Duration::seconds(10))
            .await?;

        let later = now + Duration::seconds(20);
        assert_eq!(store.count_valid_for_user(user_id, later).await?, 3);
        let oldest = store
            .oldest_valid_for_user(user_id, later)
            .await?
            .expect("valid sessions");
        assert_eq!(oldest.session_id, second.session_id);

        assert_eq!(
            store
                .revoke_all_other_for_user(user_id, third.session_id)
                .await?,
            2
        );
        let remaining = store.list_valid_for_user(user_id, later).await?;
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].session_id, third.session_id);

        assert_eq!(store.revoke_all_for_user(user_id).await?, 1);
        assert_eq!(store.count_valid_for_user(user_id, later).await?, 0);

        let purged = store.purge_expired(now + Duration::days(8)).await?;
        assert!(purged >= 3);
        assert!(store.recent_for_user(user_id, 20).await?.is_empty());
        Ok(())
    }
}
