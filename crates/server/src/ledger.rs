//! The authoritative set of refresh-token sessions.
//!
//! Every decision (validity, device cap, eviction order) is re-derived from
//! the stored records on each call; nothing is cached in-process.

use std::collections::HashMap;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sessionward_core::{NewSession, Session};
use sessionward_crypto::{hash_refresh_secret, refresh_secret_matches};
use sessionward_storage::{RefreshSessionStore, StoragePool};
use tokio::sync::RwLock;
use uuid::Uuid;

#[async_trait]
pub trait SessionLedger: Send + Sync {
    async fn create(&self, session: NewSession, now: DateTime<Utc>) -> Result<Session>;

    async fn find(&self, session_id: Uuid) -> Result<Option<Session>>;

    /// A session that is unrevoked and unexpired at `now` and whose stored
    /// digest matches `secret`.
    async fn find_valid_by_secret(&self, secret: &str, now: DateTime<Utc>)
        -> Result<Option<Session>>;

    async fn touch_usage(&self, session_id: Uuid, now: DateTime<Utc>) -> Result<()>;

    /// Returns whether this call revoked the session. Revoking twice is a
    /// no-op.
    async fn revoke(&self, session_id: Uuid) -> Result<bool>;

    async fn revoke_all_for_user(&self, user_id: Uuid) -> Result<u64>;

    async fn revoke_all_other_for_user(&self, user_id: Uuid, keep: Uuid) -> Result<u64>;

    async fn count_valid_for_user(&self, user_id: Uuid, now: DateTime<Utc>) -> Result<usize>;

    /// Least recently used valid session, creation time breaking ties.
    async fn oldest_valid_for_user(
        &self,
        user_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Option<Session>>;

    /// Newest-first, revoked and expired sessions included.
    async fn recent_history_for_user(&self, user_id: Uuid, limit: usize) -> Result<Vec<Session>>;

    /// Valid sessions, most recently used first.
    async fn list_valid_for_user(&self, user_id: Uuid, now: DateTime<Utc>)
        -> Result<Vec<Session>>;

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64>;
}

#[derive(Default)]
pub struct InMemorySessionLedger {
    sessions: RwLock<HashMap<Uuid, Session>>,
}

impl InMemorySessionLedger {
    pub fn new() -> Self {
        Self::default()
    }

    #[cfg(test)]
    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }
}

#[async_trait]
impl SessionLedger for InMemorySessionLedger {
    async fn create(&self, session: NewSession, now: DateTime<Utc>) -> Result<Session> {
        let session = session.into_session(Uuid::new_v4(), now);
        let mut sessions = self.sessions.write().await;
        sessions.insert(session.session_id, session.clone());
        Ok(session)
    }

    async fn find(&self, session_id: Uuid) -> Result<Option<Session>> {
        Ok(self.sessions.read().await.get(&session_id).cloned())
    }

    async fn find_valid_by_secret(
        &self,
        secret: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<Session>> {
        let sessions = self.sessions.read().await;
        Ok(sessions
            .values()
            .filter(|session| session.is_valid_at(now))
            .find(|session| refresh_secret_matches(secret, &session.secret_hash))
            .cloned())
    }

    async fn touch_usage(&self, session_id: Uuid, now: DateTime<Utc>) -> Result<()> {
        if let Some(session) = self.sessions.write().await.get_mut(&session_id) {
            session.last_used_at = now;
        }
        Ok(())
    }

    async fn revoke(&self, session_id: Uuid) -> Result<bool> {
        let mut sessions = self.sessions.write().await;
        match sessions.get_mut(&session_id) {
            Some(session) if !session.is_revoked => {
                session.is_revoked = true;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn revoke_all_for_user(&self, user_id: Uuid) -> Result<u64> {
        let mut sessions = self.sessions.write().await;
        let mut revoked = 0;
        for session in sessions
            .values_mut()
            .filter(|session| session.user_id == user_id && !session.is_revoked)
        {
            session.is_revoked = true;
            revoked += 1;
        }
        Ok(revoked)
    }

    async fn revoke_all_other_for_user(&self, user_id: Uuid, keep: Uuid) -> Result<u64> {
        let mut sessions = self.sessions.write().await;
        let mut revoked = 0;
        for session in sessions.values_mut().filter(|session| {
            session.user_id == user_id && session.session_id != keep && !session.is_revoked
        }) {
            session.is_revoked = true;
            revoked += 1;
        }
        Ok(revoked)
    }

    async fn count_valid_for_user(&self, user_id: Uuid, now: DateTime<Utc>) -> Result<usize> {
        let sessions = self.sessions.read().await;
        Ok(sessions
            .values()
            .filter(|session| session.user_id == user_id && session.is_valid_at(now))
            .count())
    }

    async fn oldest_valid_for_user(
        &self,
        user_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Option<Session>> {
        let sessions = self.sessions.read().await;
        Ok(sessions
            .values()
            .filter(|session| session.user_id == user_id && session.is_valid_at(now))
            .min_by_key(|session| (session.last_used_at, session.created_at))
            .cloned())
    }

    async fn recent_history_for_user(&self, user_id: Uuid, limit: usize) -> Result<Vec<Session>> {
        let sessions = self.sessions.read().await;
        let mut history: Vec<Session> = sessions
            .values()
            .filter(|session| session.user_id == user_id)
            .cloned()
            .collect();
        history.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        history.truncate(limit);
        Ok(history)
    }

    async fn list_valid_for_user(
        &self,
        user_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Vec<Session>> {
        let sessions = self.sessions.read().await;
        let mut valid: Vec<Session> = sessions
            .values()
            .filter(|session| session.user_id == user_id && session.is_valid_at(now))
            .cloned()
            .collect();
        valid.sort_by(|a, b| b.last_used_at.cmp(&a.last_used_at));
        Ok(valid)
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64> {
        let mut sessions = self.sessions.write().await;
        let before = sessions.len();
        sessions.retain(|_, session| !session.is_expired_at(now));
        Ok((before - sessions.len()) as u64)
    }
}

pub struct PostgresSessionLedger {
    store: RefreshSessionStore,
}

impl PostgresSessionLedger {
    pub fn new(pool: StoragePool) -> Self {
        Self {
            store: RefreshSessionStore::new(pool),
        }
    }
}

#[async_trait]
impl SessionLedger for PostgresSessionLedger {
    async fn create(&self, session: NewSession, now: DateTime<Utc>) -> Result<Session> {
        let session = session.into_session(Uuid::new_v4(), now);
        self.store.insert(&session).await?;
        Ok(session)
    }

    async fn find(&self, session_id: Uuid) -> Result<Option<Session>> {
        self.store.find(session_id).await
    }

    async fn find_valid_by_secret(
        &self,
        secret: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<Session>> {
        // The digest index narrows to one row; the match is still confirmed
        // with the constant-time comparison.
        let candidate = self
            .store
            .find_valid_by_hash(&hash_refresh_secret(secret), now)
            .await?;
        Ok(candidate.filter(|session| refresh_secret_matches(secret, &session.secret_hash)))
    }

    async fn touch_usage(&self, session_id: Uuid, now: DateTime<Utc>) -> Result<()> {
        self.store.record_use(session_id, now).await
    }

    async fn revoke(&self, session_id: Uuid) -> Result<bool> {
        self.store.revoke(session_id).await
    }

    async fn revoke_all_for_user(&self, user_id: Uuid) -> Result<u64> {
        self.store.revoke_all_for_user(user_id).await
    }

    async fn revoke_all_other_for_user(&self, user_id: Uuid, keep: Uuid) -> Result<u64> {
        self.store.revoke_all_other_for_user(user_id, keep).await
    }

    async fn count_valid_for_user(&self, user_id: Uuid, now: DateTime<Utc>) -> Result<usize> {
        self.store.count_valid_for_user(user_id, now).await
    }

    async fn oldest_valid_for_user(
        &self,
        user_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Option<Session>> {
        self.store.oldest_valid_for_user(user_id, now).await
    }

    async fn recent_history_for_user(&self, user_id: Uuid, limit: usize) -> Result<Vec<Session>> {
        self.store.recent_for_user(user_id, limit).await
    }

    async fn list_valid_for_user(
        &self,
        user_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Vec<Session>> {
        self.store.list_valid_for_user(user_id, now).await
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64> {
        self.store.purge_expired(now).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use sessionward_core::parse_device;
    use sessionward_crypto::generate_refresh_secret;

    fn new_session(user_id: Uuid, secret: &str) -> NewSession {
        NewSession {
            user_id,
            secret_hash: hash_refresh_secret(secret),
            device: parse_device("curl/8.4.0", None),
            ip_address: "203.0.113.5".into(),
            location: None,
            ttl: Duration::days(7),
            is_suspicious: false,
            suspicion_reason: None,
        }
    }

    #[tokio::test]
    async fn finds_sessions_by_secret_only_while_valid() {
        let ledger = InMemorySessionLedger::new();
        let user_id = Uuid::new_v4();
        let secret = generate_refresh_secret();
        let now = Utc::now();

        let session = ledger
            .create(new_session(user_id, &secret), now)
            .await
            .unwrap();
        let found = ledger
            .find_valid_by_secret(&secret, now)
            .await
            .unwrap()
            .expect("valid session");
        assert_eq!(found.session_id, session.session_id);

        assert!(ledger
            .find_valid_by_secret(&generate_refresh_secret(), now)
            .await
            .unwrap()
            .is_none());
        assert!(ledger
            .find_valid_by_secret(&secret, session.expires_at)
            .await
            .unwrap()
            .is_none());

        assert!(ledger.revoke(session.session_id).await.unwrap());
        assert!(ledger
            .find_valid_by_secret(&secret, now)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn revocation_is_idempotent_and_permanent() {
        let ledger = InMemorySessionLedger::new();
        let user_id = Uuid::new_v4();
        let now = Utc::now();
        let session = ledger
            .create(new_session(user_id, "secret"), now)
            .await
            .unwrap();

        assert!(ledger.revoke(session.session_id).await.unwrap());
        assert!(!ledger.revoke(session.session_id).await.unwrap());
        assert!(!ledger.revoke(Uuid::new_v4()).await.unwrap());

        ledger
            .touch_usage(session.session_id, now + Duration::minutes(1))
            .await
            .unwrap();
        assert_eq!(ledger.revoke_all_for_user(user_id).await.unwrap(), 0);
        let stored = ledger.find(session.session_id).await.unwrap().unwrap();
        assert!(stored.is_revoked);
    }

    #[tokio::test]
    async fn oldest_valid_is_least_recently_used_not_oldest_created() {
        let ledger = InMemorySessionLedger::new();
        let user_id = Uuid::new_v4();
        let start = Utc::now();

        let first = ledger
            .create(new_session(user_id, "one"), start)
            .await
            .unwrap();
        let second = ledger
            .create(new_session(user_id, "two"), start + Duration::minutes(1))
            .await
            .unwrap();
        ledger
            .touch_usage(first.session_id, start + Duration::minutes(5))
            .await
            .unwrap();

        let now = start + Duration::minutes(10);
        let oldest = ledger
            .oldest_valid_for_user(user_id, now)
            .await
            .unwrap()
            .expect("valid sessions");
        assert_eq!(oldest.session_id, second.session_id);

        let listed = ledger.list_valid_for_user(user_id, now).await.unwrap();
        assert_eq!(listed[0].session_id, first.session_id);
    }

    #[tokio::test]
    async fn history_includes_revoked_and_is_newest_first() {
        let ledger = InMemorySessionLedger::new();
        let user_id = Uuid::new_v4();
        let start = Utc::now();
        let mut ids = Vec::new();
        for offset in 0..4 {
            let session = ledger
                .create(
                    new_session(user_id, &format!("s{offset}")),
                    start + Duration::minutes(offset),
                )
                .await
                .unwrap();
            ids.push(session.session_id);
        }
        ledger.revoke(ids[3]).await.unwrap();
        ledger
            .create(new_session(Uuid::new_v4(), "other"), start)
            .await
            .unwrap();

        let history = ledger.recent_history_for_user(user_id, 3).await.unwrap();
        let history_ids: Vec<Uuid> = history.iter().map(|session| session.session_id).collect();
        assert_eq!(history_ids, vec![ids[3], ids[2], ids[1]]);
    }

    #[tokio::test]
    async fn revoke_others_keeps_current_and_other_users() {
        let ledger = InMemorySessionLedger::new();
        let user_id = Uuid::new_v4();
        let stranger = Uuid::new_v4();
        let now = Utc::now();
        let current = ledger.create(new_session(user_id, "a"), now).await.unwrap();
        ledger.create(new_session(user_id, "b"), now).await.unwrap();
        ledger.create(new_session(user_id, "c"), now).await.unwrap();
        ledger.create(new_session(stranger, "d"), now).await.unwrap();

        assert_eq!(
            ledger
                .revoke_all_other_for_user(user_id, current.session_id)
                .await
                .unwrap(),
            2
        );
        assert_eq!(ledger.count_valid_for_user(user_id, now).await.unwrap(), 1);
        assert_eq!(ledger.count_valid_for_user(stranger, now).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn purge_drops_only_expired_sessions() {
        let ledger = InMemorySessionLedger::new();
        let user_id = Uuid::new_v4();
        let now = Utc::now();
        let old = ledger
            .create(new_session(user_id, "old"), now - Duration::days(8))
            .await
            .unwrap();
        let revoked = ledger.create(new_session(user_id, "rev"), now).await.unwrap();
        ledger.revoke(revoked.session_id).await.unwrap();

        assert_eq!(ledger.purge_expired(now).await.unwrap(), 1);
        assert!(ledger.find(old.session_id).await.unwrap().is_none());
        assert!(ledger.find(revoked.session_id).await.unwrap().is_some());
        assert_eq!(ledger.session_count().await, 1);
    }
}
