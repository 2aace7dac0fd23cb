use std::str::FromStr;

use axum::{
    extract::State,
    response::{IntoResponse, Response},
    Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sessionward_core::{Permission, Role, User};
use uuid::Uuid;

use crate::{
    auth::{finish, Principal, RevokedResponse, SessionListResponse},
    error::{AuthError, FieldError, ValidatedJson, ValidatedPath},
    AppState,
};

#[derive(Debug, Serialize)]
pub struct ProfileResponse {
    pub user_id: Uuid,
    pub username: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    pub roles: Vec<String>,
    pub email_verified: bool,
    pub created_at: DateTime<Utc>,
}

impl From<User> for ProfileResponse {
    fn from(user: User) -> Self {
        Self {
            user_id: user.user_id,
            username: user.username,
            email: user.email,
            roles: user.roles,
            email_verified: user.email_verified,
            created_at: user.created_at,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct GrantRoleRequest {
    pub role: String,
}

impl GrantRoleRequest {
    fn validate(&self) -> Result<Role, AuthError> {
        Role::from_str(&self.role).map_err(|_| {
            AuthError::Validation(vec![FieldError::new("role", "must be one of User, Admin")])
        })
    }
}

pub async fn me(State(state): State<AppState>, principal: Principal) -> Response {
    let response = async {
        principal.require(Permission::ReadOwnProfile)?;
        let user = state.session().profile(principal.user_id()).await?;
        Ok::<_, AuthError>(Json(ProfileResponse::from(user)))
    }
    .await
    .into_response();
    finish(&state, "users.me", response)
}

pub async fn user_sessions(
    State(state): State<AppState>,
    principal: Principal,
    ValidatedPath(user_id): ValidatedPath<Uuid>,
) -> Response {
    let response = async {
        principal.require(Permission::ManageAnySessions)?;
        let session = state.session();
        session.profile(user_id).await?;
        let sessions = session.list_sessions(user_id, None).await?;
        Ok::<_, AuthError>(Json(SessionListResponse { sessions }))
    }
    .await
    .into_response();
    finish(&state, "users.sessions.list", response)
}

pub async fn revoke_user_sessions(
    State(state): State<AppState>,
    principal: Principal,
    ValidatedPath(user_id): ValidatedPath<Uuid>,
) -> Response {
    let response = async {
        principal.require(Permission::ManageAnySessions)?;
        let session = state.session();
        session.profile(user_id).await?;
        let revoked = session.revoke_all_sessions(user_id).await?;
        tracing::info!(admin_id = %principal.user_id(), %user_id, revoked, "admin revoked user sessions");
        Ok::<_, AuthError>(Json(RevokedResponse { revoked }))
    }
    .await
    .into_response();
    finish(&state, "users.sessions.revoke_all", response)
}

pub async fn grant_role(
    State(state): State<AppState>,
    principal: Principal,
    ValidatedPath(user_id): ValidatedPath<Uuid>,
    ValidatedJson(payload): ValidatedJson<GrantRoleRequest>,
) -> Response {
    let response = async {
        principal.require(Permission::ManageRoles)?;
        let role = payload.validate()?;
        let user = state.session().grant_role(user_id, role).await?;
        Ok::<_, AuthError>(Json(ProfileResponse::from(user)))
    }
    .await
    .into_response();
    finish(&state, "users.roles.grant", response)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn role_names_are_case_insensitive() {
        let request = GrantRoleRequest {
            role: " admin ".into(),
        };
        assert_eq!(request.validate().unwrap(), Role::Admin);
    }

    #[test]
    fn unknown_roles_fail_validation() {
        let request = GrantRoleRequest {
            role: "owner".into(),
        };
        let Err(AuthError::Validation(errors)) = request.validate() else {
            panic!("expected validation error");
        };
        assert_eq!(errors[0].field, "role");
    }

    #[test]
    fn profile_omits_missing_email() {
        let user = User::new("alice", Utc::now());
        let json = serde_json::to_value(ProfileResponse::from(user)).unwrap();
        assert!(json.get("email").is_none());
        assert_eq!(json["roles"][0], "User");
        assert_eq!(json["email_verified"], false);
    }
}
