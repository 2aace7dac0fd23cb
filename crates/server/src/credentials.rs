use std::collections::HashMap;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sessionward_core::{normalize_username, User};
use sessionward_storage::{CreateUserError, StoragePool, UserRepository};
use thiserror::Error;
use tokio::sync::RwLock;
use uuid::Uuid;

/// A user record together with its password hash.
#[derive(Debug, Clone)]
pub struct StoredCredentials {
    pub user: User,
    pub password_hash: String,
}

#[derive(Debug, Error)]
pub enum InsertUserError {
    #[error("username already exists")]
    UsernameTaken,
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl From<CreateUserError> for InsertUserError {
    fn from(err: CreateUserError) -> Self {
        match err {
            CreateUserError::UsernameTaken => InsertUserError::UsernameTaken,
            CreateUserError::Other(err) => InsertUserError::Other(err),
        }
    }
}

#[async_trait]
pub trait CredentialStore: Send + Sync {
    /// Case-insensitive lookup.
    async fn find_by_username(&self, username: &str) -> Result<Option<StoredCredentials>>;

    async fn find_by_id(&self, user_id: Uuid) -> Result<Option<User>>;

    /// Insert a new user; uniqueness is enforced atomically by the store.
    async fn insert_user(&self, user: &User, password_hash: &str) -> Result<(), InsertUserError>;

    async fn grant_role(&self, user_id: Uuid, role: &str, now: DateTime<Utc>)
        -> Result<Option<User>>;

    async fn revoke_role(
        &self,
        user_id: Uuid,
        role: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<User>>;
}

#[derive(Default)]
pub struct InMemoryCredentialStore {
    users: RwLock<HashMap<Uuid, StoredCredentials>>,
}

impl InMemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CredentialStore for InMemoryCredentialStore {
    async fn find_by_username(&self, username: &str) -> Result<Option<StoredCredentials>> {
        let wanted = normalize_username(username);
        let users = self.users.read().await;
        Ok(users
            .values()
            .find(|stored| normalize_username(&stored.user.username) == wanted)
            .cloned())
    }

    async fn find_by_id(&self, user_id: Uuid) -> Result<Option<User>> {
        let users = self.users.read().await;
        Ok(users.get(&user_id).map(|stored| stored.user.clone()))
    }

    async fn insert_user(&self, user: &User, password_hash: &str) -> Result<(), InsertUserError> {
        // Check and insert under one write lock, like a unique index would.
        let wanted = normalize_username(&user.username);
        let mut users = self.users.write().await;
        if users
            .values()
            .any(|stored| normalize_username(&stored.user.username) == wanted)
        {
            return Err(InsertUserError::UsernameTaken);
        }
        users.insert(
            user.user_id,
            StoredCredentials {
                user: user.clone(),
                password_hash: password_hash.to_string(),
            },
        );
        Ok(())
    }

    async fn grant_role(
        &self,
        user_id: Uuid,
        role: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<User>> {
        let mut users = self.users.write().await;
        Ok(users.get_mut(&user_id).map(|stored| {
            if !stored.user.roles.iter().any(|held| held == role) {
                stored.user.roles.push(role.to_string());
            }
            stored.user.updated_at = now;
            stored.user.clone()
        }))
    }

    async fn revoke_role(
        &self,
        user_id: Uuid,
        role: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<User>> {
        let mut users = self.users.write().await;
        Ok(users.get_mut(&user_id).map(|stored| {
            stored.user.roles.retain(|held| held != role);
            stored.user.updated_at = now;
            stored.user.clone()
        }))
    }
}

pub struct PostgresCredentialStore {
    pool: StoragePool,
}

impl PostgresCredentialStore {
    pub fn new(pool: StoragePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl CredentialStore for PostgresCredentialStore {
    async fn find_by_username(&self, username: &str) -> Result<Option<StoredCredentials>> {
        let record = UserRepository::find_by_username(self.pool.pool(), username).await?;
        Ok(record.map(|record| {
            let (user, password_hash) = record.into_parts();
            StoredCredentials {
                user,
                password_hash,
            }
        }))
    }

    async fn find_by_id(&self, user_id: Uuid) -> Result<Option<User>> {
        let record = UserRepository::find_by_id(self.pool.pool(), user_id).await?;
        Ok(record.map(|record| record.into_parts().0))
    }

    async fn insert_user(&self, user: &User, password_hash: &str) -> Result<(), InsertUserError> {
        UserRepository::create_user(self.pool.pool(), user, password_hash)
            .await
            .map_err(InsertUserError::from)
    }

    async fn grant_role(
        &self,
        user_id: Uuid,
        role: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<User>> {
        let record = UserRepository::grant_role(self.pool.pool(), user_id, role, now).await?;
        Ok(record.map(|record| record.into_parts().0))
    }

    async fn revoke_role(
        &self,
        user_id: Uuid,
        role: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<User>> {
        let record = UserRepository::revoke_role(self.pool.pool(), user_id, role, now).await?;
        Ok(record.map(|record| record.into_parts().0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn usernames_collide_case_insensitively() {
        let store = InMemoryCredentialStore::new();
        let now = Utc::now();
        let alice = User::new("alice", now);
        store.insert_user(&alice, "hash").await.expect("inserted");

        let mut shouting = User::new("alice", now);
        shouting.username = "ALICE".into();
        let err = store.insert_user(&shouting, "hash").await.unwrap_err();
        assert!(matches!(err, InsertUserError::UsernameTaken));

        let found = store
            .find_by_username(" Alice ")
            .await
            .unwrap()
            .expect("found");
        assert_eq!(found.user.user_id, alice.user_id);
        assert_eq!(found.password_hash, "hash");
    }

    #[tokio::test]
    async fn roles_are_granted_once_and_revoked() {
        let store = InMemoryCredentialStore::new();
        let now = Utc::now();
        let user = User::new("bob", now);
        store.insert_user(&user, "hash").await.unwrap();

        store.grant_role(user.user_id, "Admin", now).await.unwrap();
        let granted = store
            .grant_role(user.user_id, "Admin", now)
            .await
            .unwrap()
            .expect("user exists");
        assert_eq!(granted.roles, vec!["User".to_string(), "Admin".to_string()]);

        let revoked = store
            .revoke_role(user.user_id, "Admin", now)
            .await
            .unwrap()
            .expect("user exists");
        assert_eq!(revoked.roles, vec!["User".to_string()]);
        assert!(store
            .grant_role(Uuid::new_v4(), "Admin", now)
            .await
            .unwrap()
            .is_none());
    }
}
