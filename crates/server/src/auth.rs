use std::convert::Infallible;

use anyhow::anyhow;
use axum::{
    body::Bytes,
    extract::{FromRequest, FromRequestParts, Request, State},
    http::{
        header::{AUTHORIZATION, COOKIE, SET_COOKIE},
        request::Parts,
        HeaderMap, HeaderValue, StatusCode,
    },
    response::{IntoResponse, Response},
    Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sessionward_core::{Permission, SessionSummary};
use uuid::Uuid;

use crate::{
    config::SessionConfig,
    error::{AuthError, FieldError, ValidatedJson, ValidatedPath},
    fingerprint::ClientInfo,
    session::DeviceContext,
    tokens::{AccessClaims, AccessToken},
    AppState,
};

pub const SUSPICIOUS_LOGIN_MESSAGE: &str =
    "This login appears unusual. If this wasn't you, please secure your account.";

const USERNAME_MIN: usize = 3;
const USERNAME_MAX: usize = 30;
const PASSWORD_MIN: usize = 8;
const PASSWORD_MAX: usize = 100;
const DEVICE_NAME_MAX: usize = 100;

#[derive(Debug, Deserialize)]
pub struct RegisterRequest {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
    #[serde(default)]
    pub device_name: Option<String>,
}

/// Body fallback for clients that cannot hold the refresh cookie.
#[derive(Debug, Default, Deserialize)]
pub struct RefreshRequest {
    #[serde(default)]
    pub refresh_token: Option<String>,
}

/// Optional refresh body. An empty or unreadable body counts as absent so
/// the cookie alone can carry the secret regardless of content type.
#[derive(Debug, Default)]
pub struct RefreshBody(pub Option<RefreshRequest>);

impl<S> FromRequest<S> for RefreshBody
where
    S: Send + Sync,
{
    type Rejection = Infallible;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let parsed = Bytes::from_request(req, state)
            .await
            .ok()
            .filter(|bytes| !bytes.is_empty())
            .and_then(|bytes| serde_json::from_slice::<RefreshRequest>(&bytes).ok());
        Ok(Self(parsed))
    }
}

#[derive(Debug, PartialEq, Eq)]
struct Credentials {
    username: String,
    password: String,
    device_name: Option<String>,
}

impl RegisterRequest {
    fn validate(self) -> Result<Credentials, AuthError> {
        let mut errors = Vec::new();

        let username = self.username.trim().to_string();
        let length = username.chars().count();
        if !(USERNAME_MIN..=USERNAME_MAX).contains(&length) {
            errors.push(FieldError::new(
                "username",
                "must be between 3 and 30 characters long",
            ));
        } else if !username
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || ch == '_')
        {
            errors.push(FieldError::new(
                "username",
                "may only contain letters, numbers and underscores",
            ));
        }

        check_password(&self.password, &mut errors);

        if errors.is_empty() {
            Ok(Credentials {
                username,
                password: self.password,
                device_name: None,
            })
        } else {
            Err(AuthError::Validation(errors))
        }
    }
}

impl LoginRequest {
    /// Login only checks presence and bounds; the username format rules are
    /// a registration concern.
    fn validate(self) -> Result<Credentials, AuthError> {
        let mut errors = Vec::new();

        let username = self.username.trim().to_string();
        if username.is_empty() {
            errors.push(FieldError::new("username", "must be provided"));
        }
        if self.password.is_empty() {
            errors.push(FieldError::new("password", "must be provided"));
        } else if self.password.chars().count() > PASSWORD_MAX {
            errors.push(FieldError::new(
                "password",
                "must be at most 100 characters long",
            ));
        }

        let device_name = self
            .device_name
            .map(|name| name.trim().to_string())
            .filter(|name| !name.is_empty());
        if device_name
            .as_ref()
            .is_some_and(|name| name.chars().count() > DEVICE_NAME_MAX)
        {
            errors.push(FieldError::new(
                "device_name",
                "must be at most 100 characters long",
            ));
        }

        if errors.is_empty() {
            Ok(Credentials {
                username,
                password: self.password,
                device_name,
            })
        } else {
            Err(AuthError::Validation(errors))
        }
    }
}

fn check_password(password: &str, errors: &mut Vec<FieldError>) {
    let length = password.chars().count();
    if length < PASSWORD_MIN {
        errors.push(FieldError::new(
            "password",
            "must be at least 8 characters long",
        ));
    } else if length > PASSWORD_MAX {
        errors.push(FieldError::new(
            "password",
            "must be at most 100 characters long",
        ));
    }
}

#[derive(Debug, Serialize)]
pub struct TokenResponse {
    pub access_token: String,
    pub access_expires_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub warning: Option<LoginWarning>,
}

impl From<AccessToken> for TokenResponse {
    fn from(token: AccessToken) -> Self {
        Self {
            access_token: token.token,
            access_expires_at: token.expires_at,
            warning: None,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct LoginWarning {
    pub is_suspicious: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub message: &'static str,
}

#[derive(Debug, Serialize)]
pub struct AckResponse {
    pub status: &'static str,
}

#[derive(Debug, Serialize)]
pub struct RevokedResponse {
    pub revoked: u64,
}

#[derive(Debug, Serialize)]
pub struct SessionListResponse {
    pub sessions: Vec<SessionSummary>,
}

/// `Set-Cookie` value carrying a refresh secret.
pub fn refresh_cookie(config: &SessionConfig, secret: &str) -> Result<HeaderValue, AuthError> {
    let max_age = i64::from(config.refresh_ttl_days) * 24 * 60 * 60;
    build_cookie(config, secret, max_age)
}

/// `Set-Cookie` value that makes the browser drop the refresh cookie.
pub fn cleared_refresh_cookie(config: &SessionConfig) -> Result<HeaderValue, AuthError> {
    build_cookie(config, "", 0)
}

fn build_cookie(config: &SessionConfig, value: &str, max_age: i64) -> Result<HeaderValue, AuthError> {
    let mut cookie = format!(
        "{}={}; HttpOnly; SameSite=Strict; Path=/; Max-Age={}",
        config.cookie_name, value, max_age
    );
    if config.cookie_secure {
        cookie.push_str("; Secure");
    }
    HeaderValue::from_str(&cookie)
        .map_err(|err| AuthError::Internal(anyhow!("invalid refresh cookie: {err}")))
}

/// Read the refresh secret from the named cookie.
pub fn refresh_secret_from_cookies(headers: &HeaderMap, cookie_name: &str) -> Option<String> {
    headers
        .get_all(COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(name, _)| *name == cookie_name)
        .map(|(_, value)| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn presented_secret(
    headers: &HeaderMap,
    config: &SessionConfig,
    body: RefreshBody,
) -> Option<String> {
    refresh_secret_from_cookies(headers, &config.cookie_name).or_else(|| {
        body.0
            .and_then(|body| body.refresh_token)
            .map(|token| token.trim().to_string())
            .filter(|token| !token.is_empty())
    })
}

/// Validate the `Authorization: Bearer` header. A missing credential is
/// `Unauthorized`; one that fails verification is `Forbidden`.
pub fn authenticate_bearer(state: &AppState, headers: &HeaderMap) -> Result<AccessClaims, AuthError> {
    let token = headers
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|token| !token.is_empty())
        .ok_or(AuthError::Unauthorized)?;
    state.session().authenticate(token)
}

/// The caller identified by a valid access token.
#[derive(Debug, Clone)]
pub struct Principal {
    pub claims: AccessClaims,
}

impl Principal {
    pub fn user_id(&self) -> Uuid {
        self.claims.user_id
    }

    pub fn require(&self, permission: Permission) -> Result<(), AuthError> {
        if sessionward_core::has_permission(&self.claims.roles, permission) {
            Ok(())
        } else {
            Err(AuthError::Forbidden)
        }
    }
}

impl FromRequestParts<AppState> for Principal {
    type Rejection = AuthError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let claims = authenticate_bearer(state, &parts.headers)?;
        Ok(Self { claims })
    }
}

/// Record the response status for `route` and hand the response back.
pub(crate) fn finish(state: &AppState, route: &'static str, response: Response) -> Response {
    #[cfg(feature = "metrics")]
    state.record_http_request(route, response.status().as_u16());
    #[cfg(not(feature = "metrics"))]
    let _ = (state, route);
    response
}

fn with_cookie(cookie: HeaderValue, response: impl IntoResponse) -> Response {
    let mut response = response.into_response();
    response.headers_mut().append(SET_COOKIE, cookie);
    response
}

pub async fn register(
    State(state): State<AppState>,
    client: ClientInfo,
    ValidatedJson(payload): ValidatedJson<RegisterRequest>,
) -> Response {
    let response = register_inner(&state, client, payload).await.into_response();
    finish(&state, "auth.register", response)
}

async fn register_inner(
    state: &AppState,
    client: ClientInfo,
    payload: RegisterRequest,
) -> Result<Response, AuthError> {
    let request = payload.validate()?;
    let outcome = state
        .session()
        .register(
            &request.username,
            &request.password,
            DeviceContext {
                user_agent: client.user_agent,
                ip_address: client.ip_address,
                device_name: None,
            },
        )
        .await?;

    let cookie = refresh_cookie(state.session_config(), &outcome.tokens.refresh_secret)?;
    Ok(with_cookie(
        cookie,
        (
            StatusCode::CREATED,
            Json(TokenResponse::from(outcome.tokens.access_token)),
        ),
    ))
}

pub async fn login(
    State(state): State<AppState>,
    client: ClientInfo,
    ValidatedJson(payload): ValidatedJson<LoginRequest>,
) -> Response {
    let response = login_inner(&state, client, payload).await.into_response();
    finish(&state, "auth.login", response)
}

async fn login_inner(
    state: &AppState,
    client: ClientInfo,
    payload: LoginRequest,
) -> Result<Response, AuthError> {
    let request = payload.validate()?;
    let result = state
        .session()
        .login(
            &request.username,
            &request.password,
            DeviceContext {
                user_agent: client.user_agent,
                ip_address: client.ip_address,
                device_name: request.device_name,
            },
        )
        .await;

    let outcome = match result {
        Ok(outcome) => outcome,
        Err(err) => {
            if matches!(err, AuthError::InvalidCredentials) {
                state.record_login("invalid_credentials");
            }
            return Err(err);
        }
    };

    if outcome.evicted.is_some() {
        state.record_device_cap_eviction();
    }
    let warning = if outcome.verdict.is_suspicious {
        state.record_login("suspicious");
        Some(LoginWarning {
            is_suspicious: true,
            reason: outcome.verdict.reason.clone(),
            message: SUSPICIOUS_LOGIN_MESSAGE,
        })
    } else {
        state.record_login("success");
        None
    };

    let cookie = refresh_cookie(state.session_config(), &outcome.tokens.refresh_secret)?;
    let mut body = TokenResponse::from(outcome.tokens.access_token);
    body.warning = warning;
    Ok(with_cookie(cookie, (StatusCode::OK, Json(body))))
}

pub async fn refresh(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: RefreshBody,
) -> Response {
    let secret = presented_secret(&headers, state.session_config(), body);
    let response = match state.session().refresh(secret.as_deref()).await {
        Ok(token) => (StatusCode::OK, Json(TokenResponse::from(token))).into_response(),
        Err(err) => err.into_response(),
    };
    finish(&state, "auth.refresh", response)
}

pub async fn logout(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: RefreshBody,
) -> Response {
    let Some(secret) = presented_secret(&headers, state.session_config(), body) else {
        return finish(&state, "auth.logout", StatusCode::NO_CONTENT.into_response());
    };

    state.session().logout(Some(&secret)).await;
    let ack = (
        StatusCode::OK,
        Json(AckResponse {
            status: "logged_out",
        }),
    );
    let response = match cleared_refresh_cookie(state.session_config()) {
        Ok(cookie) => with_cookie(cookie, ack),
        Err(_) => ack.into_response(),
    };
    finish(&state, "auth.logout", response)
}

pub async fn list_sessions(
    State(state): State<AppState>,
    principal: Principal,
    headers: HeaderMap,
) -> Response {
    let response = async {
        principal.require(Permission::ManageOwnSessions)?;
        let current = refresh_secret_from_cookies(&headers, &state.session_config().cookie_name);
        let sessions = state
            .session()
            .list_sessions(principal.user_id(), current.as_deref())
            .await?;
        Ok::<_, AuthError>(Json(SessionListResponse { sessions }))
    }
    .await
    .into_response();
    finish(&state, "auth.sessions.list", response)
}

pub async fn revoke_session(
    State(state): State<AppState>,
    principal: Principal,
    ValidatedPath(session_id): ValidatedPath<Uuid>,
) -> Response {
    let response = async {
        principal.require(Permission::ManageOwnSessions)?;
        state
            .session()
            .revoke_session(principal.user_id(), session_id)
            .await?;
        Ok::<_, AuthError>(Json(RevokedResponse { revoked: 1 }))
    }
    .await
    .into_response();
    finish(&state, "auth.sessions.revoke", response)
}

pub async fn revoke_other_sessions(
    State(state): State<AppState>,
    principal: Principal,
    headers: HeaderMap,
    body: RefreshBody,
) -> Response {
    let secret = presented_secret(&headers, state.session_config(), body);
    let response = async {
        principal.require(Permission::ManageOwnSessions)?;
        let revoked = state
            .session()
            .revoke_other_sessions(principal.user_id(), secret.as_deref())
            .await?;
        Ok::<_, AuthError>(Json(RevokedResponse { revoked }))
    }
    .await
    .into_response();
    finish(&state, "auth.sessions.revoke_others", response)
}

pub async fn revoke_all_sessions(State(state): State<AppState>, principal: Principal) -> Response {
    let response = async {
        principal.require(Permission::ManageOwnSessions)?;
        let revoked = state
            .session()
            .revoke_all_sessions(principal.user_id())
            .await?;
        let cookie = cleared_refresh_cookie(state.session_config())?;
        Ok::<_, AuthError>(with_cookie(cookie, Json(RevokedResponse { revoked })))
    }
    .await
    .into_response();
    finish(&state, "auth.sessions.revoke_all", response)
}
