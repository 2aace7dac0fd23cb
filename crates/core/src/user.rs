use std::{fmt, str::FromStr};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identity record as seen outside the credential store.
///
/// The password hash is deliberately absent; only the store holds it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct User {
    pub user_id: Uuid,
    pub username: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    pub roles: Vec<String>,
    pub email_verified: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl User {
    /// Build a freshly registered user with the default role set.
    pub fn new(username: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            user_id: Uuid::new_v4(),
            username: normalize_username(&username.into()),
            email: None,
            roles: vec![Role::User.as_str().to_string()],
            email_verified: false,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn has_role(&self, role: Role) -> bool {
        self.roles
            .iter()
            .any(|candidate| Role::from_str(candidate).ok() == Some(role))
    }

    pub fn can(&self, permission: Permission) -> bool {
        has_permission(&self.roles, permission)
    }
}

/// Usernames are unique case-insensitively and stored lowercased.
pub fn normalize_username(raw: &str) -> String {
    raw.trim().to_lowercase()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    User,
    Admin,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "User",
            Role::Admin => "Admin",
        }
    }

    pub fn grants(&self, permission: Permission) -> bool {
        match self {
            Role::Admin => true,
            Role::User => matches!(
                permission,
                Permission::ReadOwnProfile | Permission::ManageOwnSessions
            ),
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "user" => Ok(Role::User),
            "admin" => Ok(Role::Admin),
            other => Err(format!("unsupported role '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Permission {
    ReadOwnProfile,
    ManageOwnSessions,
    ReadAnyUser,
    ManageAnySessions,
    ManageRoles,
}

/// Unknown role strings grant nothing.
pub fn has_permission<S: AsRef<str>>(roles: &[S], permission: Permission) -> bool {
    roles
        .iter()
        .filter_map(|role| Role::from_str(role.as_ref()).ok())
        .any(|role| role.grants(permission))
}
