use std::sync::Arc;

use chrono::Duration;
use once_cell::sync::Lazy;
use sessionward_core::{
    locate, parse_device, score, DeviceInfo, GeoLocator, GeoTable, Location, NewSession, Role,
    Session, SessionSummary, SuspicionVerdict, User,
};
use sessionward_crypto::{hash_password, hash_refresh_secret, verify_password};
use tracing::{info, warn};
use uuid::Uuid;

use crate::{
    clock::Clock,
    config::SessionConfig,
    credentials::{CredentialStore, InsertUserError},
    error::AuthError,
    ledger::SessionLedger,
    tokens::{AccessClaims, AccessToken, TokenCodec},
};

/// Verified against when the username is unknown so both login failures cost
/// one Argon2 verification.
static UNKNOWN_USER_HASH: Lazy<Option<String>> =
    Lazy::new(|| hash_password("sessionward-unknown-user").ok());

/// Tunables that shape session lifetime, the device cap and scoring context.
#[derive(Debug, Clone)]
pub struct SessionPolicy {
    pub refresh_ttl: Duration,
    pub max_devices_per_user: usize,
    pub history_window: usize,
}

impl SessionPolicy {
    pub fn from_config(config: &SessionConfig) -> Self {
        Self {
            refresh_ttl: Duration::days(i64::from(config.refresh_ttl_days)),
            max_devices_per_user: config.max_devices_per_user,
            history_window: config.history_window,
        }
    }
}

impl Default for SessionPolicy {
    fn default() -> Self {
        Self::from_config(&SessionConfig::default())
    }
}

/// Ambient request facts a session is opened with.
#[derive(Debug, Clone, Default)]
pub struct DeviceContext {
    pub user_agent: String,
    pub ip_address: String,
    pub device_name: Option<String>,
}

#[derive(Debug, Clone)]
pub struct IssuedTokens {
    pub access_token: AccessToken,
    pub refresh_secret: String,
    pub session_id: Uuid,
}

#[derive(Debug, Clone)]
pub struct RegisterOutcome {
    pub user: User,
    pub tokens: IssuedTokens,
}

#[derive(Debug, Clone)]
pub struct LoginOutcome {
    pub user: User,
    pub tokens: IssuedTokens,
    pub verdict: SuspicionVerdict,
    /// Session revoked to make room under the device cap, if any.
    pub evicted: Option<Uuid>,
}

#[derive(Clone)]
pub struct SessionContext {
    codec: TokenCodec,
    credentials: Arc<dyn CredentialStore>,
    ledger: Arc<dyn SessionLedger>,
    geo: Arc<dyn GeoLocator>,
    clock: Arc<dyn Clock>,
    policy: SessionPolicy,
}

impl SessionContext {
    pub fn new(
        codec: TokenCodec,
        credentials: Arc<dyn CredentialStore>,
        ledger: Arc<dyn SessionLedger>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            codec,
            credentials,
            ledger,
            geo: Arc::new(GeoTable::new()),
            clock,
            policy: SessionPolicy::default(),
        }
    }

    pub fn with_geo(mut self, geo: Arc<dyn GeoLocator>) -> Self {
        self.geo = geo;
        self
    }

    pub fn with_policy(mut self, policy: SessionPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn codec(&self) -> &TokenCodec {
        &self.codec
    }

    pub fn policy(&self) -> &SessionPolicy {
        &self.policy
    }

    /// Create the account and open its first session. The first session is
    /// never suspicious.
    pub async fn register(
        &self,
        username: &str,
        password: &str,
        device: DeviceContext,
    ) -> Result<RegisterOutcome, AuthError> {
        // The unique index is the real guarantee; this only gives a cheaper
        // early answer.
        if self.credentials.find_by_username(username).await?.is_some() {
            return Err(AuthError::DuplicateUser);
        }

        let password_hash = hash_password(password)?;
        let user = User::new(username, self.clock.now());
        match self.credentials.insert_user(&user, &password_hash).await {
            Ok(()) => {}
            Err(InsertUserError::UsernameTaken) => return Err(AuthError::DuplicateUser),
            Err(InsertUserError::Other(err)) => return Err(AuthError::Internal(err)),
        }

        let device = self.resolve_device(device);
        let tokens = self
            .open_session(&user, device, SuspicionVerdict::clear())
            .await?;
        info!(user_id = %user.user_id, username = %user.username, "registered user");
        Ok(RegisterOutcome { user, tokens })
    }

    pub async fn login(
        &self,
        username: &str,
        password: &str,
        device: DeviceContext,
    ) -> Result<LoginOutcome, AuthError> {
        let Some(stored) = self.credentials.find_by_username(username).await? else {
            if let Some(hash) = UNKNOWN_USER_HASH.as_deref() {
                let _ = verify_password(password, hash);
            }
            return Err(AuthError::InvalidCredentials);
        };
        if !verify_password(password, &stored.password_hash)? {
            return Err(AuthError::InvalidCredentials);
        }
        let user = stored.user;

        let history = self
            .ledger
            .recent_history_for_user(user.user_id, self.policy.history_window)
            .await?;
        let device = self.resolve_device(device);
        let verdict = score(&device.info, device.location.as_ref(), &history);

        let evicted = match self.enforce_device_cap(user.user_id).await {
            Ok(evicted) => evicted,
            Err(err) => {
                warn!(?err, user_id = %user.user_id, "device cap enforcement failed; continuing login");
                None
            }
        };

        let tokens = self.open_session(&user, device, verdict.clone()).await?;
        if verdict.is_suspicious {
            warn!(
                user_id = %user.user_id,
                session_id = %tokens.session_id,
                reason = verdict.reason.as_deref().unwrap_or_default(),
                "suspicious login"
            );
        } else {
            info!(user_id = %user.user_id, session_id = %tokens.session_id, "login succeeded");
        }

        Ok(LoginOutcome {
            user,
            tokens,
            verdict,
            evicted,
        })
    }

    /// Mint a new access token for a valid refresh secret. The secret itself
    /// is not rotated.
    pub async fn refresh(&self, secret: Option<&str>) -> Result<AccessToken, AuthError> {
        let secret = present(secret).ok_or(AuthError::Unauthorized)?;
        let now = self.clock.now();

        let session = self
            .ledger
            .find_valid_by_secret(secret, now)
            .await?
            .ok_or(AuthError::Forbidden)?;
        let user = self
            .credentials
            .find_by_id(session.user_id)
            .await?
            .ok_or(AuthError::Forbidden)?;

        self.ledger.touch_usage(session.session_id, now).await?;
        let token = self
            .codec
            .issue_access_token(user.user_id, &user.username, &user.roles, now)?;
        Ok(token)
    }

    /// Revoke the session behind `secret`, if any. Never fails: an unknown,
    /// expired or already revoked secret counts as logged out.
    pub async fn logout(&self, secret: Option<&str>) -> bool {
        let Some(secret) = present(secret) else {
            return false;
        };
        let now = self.clock.now();
        let session = match self.ledger.find_valid_by_secret(secret, now).await {
            Ok(Some(session)) => session,
            Ok(None) => return false,
            Err(err) => {
                warn!(?err, "session lookup failed during logout");
                return false;
            }
        };
        match self.ledger.revoke(session.session_id).await {
            Ok(revoked) => {
                info!(user_id = %session.user_id, session_id = %session.session_id, "logged out");
                revoked
            }
            Err(err) => {
                warn!(?err, session_id = %session.session_id, "failed to revoke session during logout");
                false
            }
        }
    }

    /// Valid sessions of `user_id`, flagging the one `current_secret` belongs to.
    pub async fn list_sessions(
        &self,
        user_id: Uuid,
        current_secret: Option<&str>,
    ) -> Result<Vec<SessionSummary>, AuthError> {
        let now = self.clock.now();
        let current = match present(current_secret) {
            Some(secret) => self
                .ledger
                .find_valid_by_secret(secret, now)
                .await?
                .filter(|session| session.user_id == user_id)
                .map(|session| session.session_id),
            None => None,
        };

        let sessions = self.ledger.list_valid_for_user(user_id, now).await?;
        Ok(sessions
            .iter()
            .map(|session| {
                let mut summary = session.summary();
                summary.current = Some(session.session_id) == current;
                summary
            })
            .collect())
    }

    pub async fn revoke_session(&self, user_id: Uuid, session_id: Uuid) -> Result<(), AuthError> {
        let session = self
            .ledger
            .find(session_id)
            .await?
            .ok_or(AuthError::SessionNotFound)?;
        if session.user_id != user_id {
            return Err(AuthError::Forbidden);
        }
        if !session.is_valid_at(self.clock.now()) {
            return Err(AuthError::SessionNotFound);
        }
        self.ledger.revoke(session_id).await?;
        info!(%user_id, %session_id, "revoked session");
        Ok(())
    }

    /// Revoke every session of `user_id` except the one `current_secret`
    /// resolves to.
    pub async fn revoke_other_sessions(
        &self,
        user_id: Uuid,
        current_secret: Option<&str>,
    ) -> Result<u64, AuthError> {
        let secret = present(current_secret).ok_or(AuthError::Unauthorized)?;
        let current = self
            .ledger
            .find_valid_by_secret(secret, self.clock.now())
            .await?
            .ok_or(AuthError::Unauthorized)?;
        if current.user_id != user_id {
            return Err(AuthError::Forbidden);
        }

        let revoked = self
            .ledger
            .revoke_all_other_for_user(user_id, current.session_id)
            .await?;
        info!(%user_id, keep = %current.session_id, revoked, "revoked other sessions");
        Ok(revoked)
    }

    pub async fn revoke_all_sessions(&self, user_id: Uuid) -> Result<u64, AuthError> {
        let revoked = self.ledger.revoke_all_for_user(user_id).await?;
        info!(%user_id, revoked, "revoked all sessions");
        Ok(revoked)
    }

    /// Validate a bearer access token.
    pub fn authenticate(&self, token: &str) -> Result<AccessClaims, AuthError> {
        self.codec
            .verify_access_token(token, self.clock.now())
            .map_err(|_| AuthError::Forbidden)
    }

    pub async fn profile(&self, user_id: Uuid) -> Result<User, AuthError> {
        self.credentials
            .find_by_id(user_id)
            .await?
            .ok_or(AuthError::UserNotFound)
    }

    pub async fn grant_role(&self, user_id: Uuid, role: Role) -> Result<User, AuthError> {
        let user = self
            .credentials
            .grant_role(user_id, role.as_str(), self.clock.now())
            .await?
            .ok_or(AuthError::UserNotFound)?;
        info!(%user_id, role = %role, "granted role");
        Ok(user)
    }

    /// Create an administrator unless the username is already taken.
    /// Returns whether an account was created.
    pub async fn bootstrap_admin(&self, username: &str, password: &str) -> anyhow::Result<bool> {
        if self.credentials.find_by_username(username).await?.is_some() {
            return Ok(false);
        }
        let password_hash = hash_password(password)?;
        let mut user = User::new(username, self.clock.now());
        user.roles = vec![Role::Admin.as_str().to_string()];
        user.email_verified = true;
        match self.credentials.insert_user(&user, &password_hash).await {
            Ok(()) => Ok(true),
            Err(InsertUserError::UsernameTaken) => Ok(false),
            Err(InsertUserError::Other(err)) => Err(err),
        }
    }

    pub async fn purge_expired(&self) -> anyhow::Result<u64> {
        self.ledger.purge_expired(self.clock.now()).await
    }

    /// Revoke the least recently used valid session when the user is at the
    /// cap. Decided from a fresh count on every login.
    async fn enforce_device_cap(&self, user_id: Uuid) -> anyhow::Result<Option<Uuid>> {
        let now = self.clock.now();
        let active = self.ledger.count_valid_for_user(user_id, now).await?;
        if active < self.policy.max_devices_per_user {
            return Ok(None);
        }
        let Some(oldest) = self.ledger.oldest_valid_for_user(user_id, now).await? else {
            return Ok(None);
        };
        self.ledger.revoke(oldest.session_id).await?;
        info!(
            %user_id,
            session_id = %oldest.session_id,
            active,
            "device cap reached; revoked least recently used session"
        );
        Ok(Some(oldest.session_id))
    }

    fn resolve_device(&self, device: DeviceContext) -> ResolvedDevice {
        ResolvedDevice {
            info: parse_device(&device.user_agent, device.device_name.as_deref()),
            location: locate(&device.ip_address, self.geo.as_ref()),
            ip_address: device.ip_address,
        }
    }

    async fn open_session(
        &self,
        user: &User,
        device: ResolvedDevice,
        verdict: SuspicionVerdict,
    ) -> Result<IssuedTokens, AuthError> {
        let now = self.clock.now();
        let refresh_secret = self.codec.issue_refresh_secret();

        let session: Session = self
            .ledger
            .create(
                NewSession {
                    user_id: user.user_id,
                    secret_hash: hash_refresh_secret(&refresh_secret),
                    device: device.info,
                    ip_address: device.ip_address,
                    location: device.location,
                    ttl: self.policy.refresh_ttl,
                    is_suspicious: verdict.is_suspicious,
                    suspicion_reason: verdict.reason,
                },
                now,
            )
            .await?;

        let access_token =
            self.codec
                .issue_access_token(user.user_id, &user.username, &user.roles, now)?;
        Ok(IssuedTokens {
            access_token,
            refresh_secret,
            session_id: session.session_id,
        })
    }
}

/// Device facts parsed and geolocated once per login.
struct ResolvedDevice {
    info: DeviceInfo,
    location: Option<Location>,
    ip_address: String,
}

fn present(secret: Option<&str>) -> Option<&str> {
    secret.map(str::trim).filter(|secret| !secret.is_empty())
}
