use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{DeviceInfo, DeviceType, Location};

pub const MAX_DEVICES_PER_USER: usize = 5;
pub const REFRESH_TOKEN_TTL_DAYS: i64 = 7;
pub const SUSPICION_HISTORY_WINDOW: usize = 20;

/// A refresh-token session.
///
/// Only the one-way hash of the refresh secret is kept. `is_revoked` moves
/// from `false` to `true` and never back; the suspicion fields are fixed at
/// creation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub session_id: Uuid,
    pub user_id: Uuid,
    pub secret_hash: String,
    pub device: DeviceInfo,
    pub ip_address: String,
    pub location: Option<Location>,
    pub created_at: DateTime<Utc>,
    pub last_used_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub is_revoked: bool,
    pub is_suspicious: bool,
    pub suspicion_reason: Option<String>,
}

impl Session {
    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        !self.is_revoked && now < self.expires_at
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    pub fn summary(&self) -> SessionSummary {
        SessionSummary {
            session_id: self.session_id,
            device_name: self.device.device_name.clone(),
            device_type: self.device.device_type,
            browser: self.device.browser.clone(),
            os: self.device.os.clone(),
            ip_address: self.ip_address.clone(),
            location: self.location.clone(),
            created_at: self.created_at,
            last_used_at: self.last_used_at,
            expires_at: self.expires_at,
            is_suspicious: self.is_suspicious,
            suspicion_reason: self.suspicion_reason.clone(),
            current: false,
        }
    }
}

/// Everything needed to open a session; the ledger assigns id and timestamps.
#[derive(Debug, Clone)]
pub struct NewSession {
    pub user_id: Uuid,
    pub secret_hash: String,
    pub device: DeviceInfo,
    pub ip_address: String,
    pub location: Option<Location>,
    pub ttl: Duration,
    pub is_suspicious: bool,
    pub suspicion_reason: Option<String>,
}

impl NewSession {
    pub fn into_session(self, session_id: Uuid, now: DateTime<Utc>) -> Session {
        Session {
            session_id,
            user_id: self.user_id,
            secret_hash: self.secret_hash,
            device: self.device,
            ip_address: self.ip_address,
            location: self.location,
            created_at: now,
            last_used_at: now,
            expires_at: now + self.ttl,
            is_revoked: false,
            is_suspicious: self.is_suspicious,
            suspicion_reason: self.suspicion_reason,
        }
    }
}

/// Client-facing view of a session. Never carries the secret hash.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SessionSummary {
    pub session_id: Uuid,
    pub device_name: String,
    pub device_type: DeviceType,
    pub browser: String,
    pub os: String,
    pub ip_address: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<Location>,
    pub created_at: DateTime<Utc>,
    pub last_used_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub is_suspicious: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suspicion_reason: Option<String>,
    #[serde(default)]
    pub current: bool,
}
