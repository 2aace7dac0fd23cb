use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use sessionward_core::User;
use sqlx::{FromRow, PgPool};
use thiserror::Error;
use uuid::Uuid;

use crate::is_unique_violation;

/// Repository utilities for user persistence.
pub struct UserRepository;

#[derive(Debug, Error)]
pub enum CreateUserError {
    #[error("username already exists")]
    UsernameTaken,
    #[error("failed to create user: {0}")]
    Other(#[from] anyhow::Error),
}

#[derive(Debug, Clone, FromRow)]
pub struct UserRecord {
    pub user_id: Uuid,
    pub username: String,
    pub email: Option<String>,
    pub password_hash: String,
    pub roles: Vec<String>,
    pub email_verified: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl UserRecord {
    /// Split the record into the public user and its password hash.
    pub fn into_parts(self) -> (User, String) {
        let user = User {
            user_id: self.user_id,
            username: self.username,
            email: self.email,
            roles: self.roles,
            email_verified: self.email_verified,
            created_at: self.created_at,
            updated_at: self.updated_at,
        };
        (user, self.password_hash)
    }
}

const USER_COLUMNS: &str =
    "user_id, username, email, password_hash, roles, email_verified, created_at, updated_at";

impl UserRepository {
    /// Insert a user whose password has already been hashed.
    ///
    /// Username uniqueness is case-insensitive and enforced by the
    /// `users_username_lower_idx` index.
    pub async fn create_user(
        pool: &PgPool,
        user: &User,
        password_hash: &str,
    ) -> Result<(), CreateUserError> {
        sqlx::query(
            r#"
            INSERT INTO users (user_id, username, email, password_hash, roles, email_verified, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(user.user_id)
        .bind(&user.username)
        .bind(user.email.as_deref())
        .bind(password_hash)
        .bind(&user.roles)
        .bind(user.email_verified)
        .bind(user.created_at)
        .bind(user.updated_at)
        .execute(pool)
        .await
        .map_err(|err| {
            if is_unique_violation(&err) {
                CreateUserError::UsernameTaken
            } else {
                CreateUserError::Other(
                    anyhow!(err).context(format!("creating user '{}'", user.username)),
                )
            }
        })?;

        Ok(())
    }

    pub async fn find_by_username(pool: &PgPool, username: &str) -> Result<Option<UserRecord>> {
        let query = format!("SELECT {USER_COLUMNS} FROM users WHERE lower(username) = lower($1)");
        sqlx::query_as::<_, UserRecord>(&query)
            .bind(username)
            .fetch_optional(pool)
            .await
            .with_context(|| format!("querying user '{username}'"))
    }

    pub async fn find_by_id(pool: &PgPool, user_id: Uuid) -> Result<Option<UserRecord>> {
        let query = format!("SELECT {USER_COLUMNS} FROM users WHERE user_id = $1");
        sqlx::query_as::<_, UserRecord>(&query)
            .bind(user_id)
            .fetch_optional(pool)
            .await
            .with_context(|| format!("querying user {user_id}"))
    }

    /// Add a role if the user does not already hold it. Returns the updated
    /// record, or `None` when the user does not exist.
    pub async fn grant_role(
        pool: &PgPool,
        user_id: Uuid,
        role: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<UserRecord>> {
        let query = format!(
            r#"
            UPDATE users
            SET roles = CASE WHEN $2 = ANY(roles) THEN roles ELSE array_append(roles, $2) END,
                updated_at = $3
            WHERE user_id = $1
            RETURNING {USER_COLUMNS}
            "#
        );
        sqlx::query_as::<_, UserRecord>(&query)
            .bind(user_id)
            .bind(role)
            .bind(now)
            .fetch_optional(pool)
            .await
            .with_context(|| format!("granting role '{role}' to {user_id}"))
    }

    pub async fn revoke_role(
        pool: &PgPool,
        user_id: Uuid,
        role: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<UserRecord>> {
        let query = format!(
            r#"
            UPDATE users
            SET roles = array_remove(roles, $2),
                updated_at = $3
            WHERE user_id = $1
            RETURNING {USER_COLUMNS}
            "#
        );
        sqlx::query_as::<_, UserRecord>(&query)
            .bind(user_id)
            .bind(role)
            .bind(now)
            .fetch_optional(pool)
            .await
            .with_context(|| format!("revoking role '{role}' from {user_id}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::test_pool;
    use chrono::SubsecRound;

    #[tokio::test]
    async fn usernames_are_unique_case_insensitively() -> anyhow::Result<()> {
        let Some(pool) = test_pool("user uniqueness test").await? else {
            return Ok(());
        };
        let now = Utc::now().trunc_subsecs(6);
        let name = format!("user_{}", &Uuid::new_v4().simple().to_string()[..12]);
        let user = User::new(&name, now);

        UserRepository::create_user(pool.pool(), &user, "$argon2id$test").await?;

        let mut shouted = User::new(&name, now);
        shouted.username = name.to_uppercase();
        let err = UserRepository::create_user(pool.pool(), &shouted, "$argon2id$test")
            .await
            .unwrap_err();
        assert!(matches!(err, CreateUserError::UsernameTaken));

        let found = UserRepository::find_by_username(pool.pool(), &name.to_uppercase())
            .await?
            .expect("user exists");
        let (loaded, hash) = found.into_parts();
        assert_eq!(loaded.user_id, user.user_id);
        assert_eq!(loaded.roles, vec!["User".to_string()]);
        assert_eq!(hash, "$argon2id$test");

        sqlx::query("DELETE FROM users WHERE user_id = $1")
            .bind(user.user_id)
            .execute(pool.pool())
            .await?;
        Ok(())
    }

    #[tokio::test]
    async fn roles_are_granted_once_and_revoked() -> anyhow::Result<()> {
        let Some(pool) = test_pool("user role test").await? else {
            return Ok(());
        };
        let now = Utc::now().trunc_subsecs(6);
        let name = format!("roles_{}", &Uuid::new_v4().simple().to_string()[..12]);
        let user = User::new(&name, now);
        UserRepository::create_user(pool.pool(), &user, "$argon2id$test").await?;

        UserRepository::grant_role(pool.pool(), user.user_id, "Admin", now).await?;
        let granted = UserRepository::grant_role(pool.pool(), user.user_id, "Admin", now)
            .await?
            .expect("user exists");
        assert_eq!(granted.roles, vec!["User".to_string(), "Admin".to_string()]);

        let revoked = UserRepository::revoke_role(pool.pool(), user.user_id, "Admin", now)
            .await?
            .expect("user exists");
        assert_eq!(revoked.roles, vec!["User".to_string()]);

        assert!(
            UserRepository::grant_role(pool.pool(), Uuid::new_v4(), "Admin", now)
                .await?
                .is_none()
        );

        sqlx::query("DELETE FROM users WHERE user_id = $1")
            .bind(user.user_id)
            .execute(pool.pool())
            .await?;
        Ok(())
    }
}
