//! Access-token signing and verification plus refresh-secret minting.
//!
//! Access tokens are `base64url(json claims).base64url(ed25519 signature)`.
//! Refresh secrets are opaque random strings with no decodable payload.

use anyhow::{anyhow, Context, Result};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sessionward_crypto::{
    generate_refresh_secret, generate_signing_key, sign_message, verify_signature,
    verifying_key_from, Signature, SigningKey, VerifyingKey,
};
use thiserror::Error;
use uuid::Uuid;

use crate::config::SessionConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum TokenError {
    #[error("token is malformed")]
    Malformed,
    #[error("token signature is invalid")]
    InvalidSignature,
    #[error("token has expired")]
    Expired,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessClaims {
    pub user_id: Uuid,
    pub username: String,
    pub roles: Vec<String>,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct AccessToken {
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct TokenCodec {
    signing_key: SigningKey,
    fallback_keys: Vec<VerifyingKey>,
    access_ttl: Duration,
}

impl TokenCodec {
    pub fn from_config(config: &SessionConfig) -> Result<Self> {
        let signing_key = match config.active_signing_key.as_deref() {
            Some(raw) => {
                let bytes = decode_key_bytes(raw).with_context(|| {
                    "failed to decode session signing key from base64 (URL-safe)"
                })?;
                SigningKey::from_bytes(&bytes)
            }
            None => generate_signing_key(),
        };

        let fallback_keys = config
            .fallback_verifying_keys
            .iter()
            .map(|raw| {
                let bytes = decode_key_bytes(raw)
                    .with_context(|| "failed to decode fallback verifying key")?;
                VerifyingKey::from_bytes(&bytes)
                    .map_err(|err| anyhow!("invalid fallback verifying key: {err}"))
            })
            .collect::<Result<Vec<_>>>()?;

        let ttl_secs = i64::try_from(config.access_token_ttl_secs)
            .map_err(|_| anyhow!("access_token_ttl_secs is out of range"))?;

        Ok(Self {
            signing_key,
            fallback_keys,
            access_ttl: Duration::seconds(ttl_secs),
        })
    }

    pub fn verifying_key_base64(&self) -> String {
        let verifying = verifying_key_from(&self.signing_key);
        URL_SAFE_NO_PAD.encode(verifying.as_bytes())
    }

    pub fn access_ttl(&self) -> Duration {
        self.access_ttl
    }

    pub fn issue_access_token(
        &self,
        user_id: Uuid,
        username: &str,
        roles: &[String],
        now: DateTime<Utc>,
    ) -> Result<AccessToken> {
        let claims = AccessClaims {
            user_id,
            username: username.to_string(),
            roles: roles.to_vec(),
            issued_at: now,
            expires_at: now + self.access_ttl,
        };
        let payload = serde_json::to_vec(&claims)?;
        let signature = sign_message(&self.signing_key, &payload);

        let token = format!(
            "{}.{}",
            URL_SAFE_NO_PAD.encode(&payload),
            URL_SAFE_NO_PAD.encode(signature.to_bytes())
        );
        Ok(AccessToken {
            token,
            expires_at: claims.expires_at,
        })
    }

    /// Check the signature against the active key, then any fallback key,
    /// and reject tokens whose expiry is not after `now`.
    pub fn verify_access_token(
        &self,
        token: &str,
        now: DateTime<Utc>,
    ) -> Result<AccessClaims, TokenError> {
        let (payload_b64, signature_b64) =
            token.trim().split_once('.').ok_or(TokenError::Malformed)?;
        let payload = URL_SAFE_NO_PAD
            .decode(payload_b64)
            .map_err(|_| TokenError::Malformed)?;
        let signature_bytes = URL_SAFE_NO_PAD
            .decode(signature_b64)
            .map_err(|_| TokenError::Malformed)?;
        let signature =
            Signature::from_slice(&signature_bytes).map_err(|_| TokenError::Malformed)?;

        let active = verifying_key_from(&self.signing_key);
        let verified = std::iter::once(&active)
            .chain(self.fallback_keys.iter())
            .any(|key| verify_signature(key, &payload, &signature).is_ok());
        if !verified {
            return Err(TokenError::InvalidSignature);
        }

        let claims: AccessClaims =
            serde_json::from_slice(&payload).map_err(|_| TokenError::Malformed)?;
        if now >= claims.expires_at {
            return Err(TokenError::Expired);
        }
        Ok(claims)
    }

    pub fn issue_refresh_secret(&self) -> String {
        generate_refresh_secret()
    }
}

fn decode_key_bytes(raw: &str) -> Result<[u8; 32]> {
    let decoded = URL_SAFE_NO_PAD.decode(raw.trim())?;
    decoded
        .try_into()
        .map_err(|_| anyhow!("key must be 32 bytes"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn codec() -> TokenCodec {
        TokenCodec::from_config(&SessionConfig::default()).expect("codec")
    }

    #[test]
    fn access_tokens_round_trip_claims() {
        let codec = codec();
        let now = Utc::now();
        let user_id = Uuid::new_v4();
        let roles = vec!["User".to_string()];
        let issued = codec
            .issue_access_token(user_id, "alice", &roles, now)
            .expect("token");
        assert_eq!(issued.expires_at, now + Duration::minutes(15));

        let claims = codec
            .verify_access_token(&issued.token, now)
            .expect("valid token");
        assert_eq!(claims.user_id, user_id);
        assert_eq!(claims.username, "alice");
        assert_eq!(claims.roles, roles);
    }

    #[test]
    fn expired_tokens_are_rejected() {
        let codec = codec();
        let now = Utc::now();
        let issued = codec
            .issue_access_token(Uuid::new_v4(), "alice", &[], now)
            .expect("token");
        assert_eq!(
            codec.verify_access_token(&issued.token, issued.expires_at),
            Err(TokenError::Expired)
        );
    }

    #[test]
    fn tokens_from_another_key_fail_signature_check() {
        let now = Utc::now();
        let issued = codec()
            .issue_access_token(Uuid::new_v4(), "alice", &[], now)
            .expect("token");
        assert_eq!(
            codec().verify_access_token(&issued.token, now),
            Err(TokenError::InvalidSignature)
        );
    }

    #[test]
    fn tampered_payload_is_rejected() {
        let codec = codec();
        let now = Utc::now();
        let issued = codec
            .issue_access_token(Uuid::new_v4(), "alice", &["User".into()], now)
            .expect("token");
        let (_, signature) = issued.token.split_once('.').expect("two parts");
        let forged_claims = AccessClaims {
            user_id: Uuid::new_v4(),
            username: "mallory".into(),
            roles: vec!["Admin".into()],
            issued_at: now,
            expires_at: now + Duration::hours(1),
        };
        let forged_payload =
            URL_SAFE_NO_PAD.encode(serde_json::to_vec(&forged_claims).expect("json"));
        let forged = format!("{forged_payload}.{signature}");
        assert_eq!(
            codec.verify_access_token(&forged, now),
            Err(TokenError::InvalidSignature)
        );
    }

    #[test]
    fn garbage_is_malformed() {
        let codec = codec();
        let now = Utc::now();
        for token in ["", "no-dot", "a.b", "!!!.???"] {
            assert_eq!(
                codec.verify_access_token(token, now),
                Err(TokenError::Malformed),
                "{token:?}"
            );
        }
    }

    #[test]
    fn fallback_keys_verify_tokens_signed_before_rotation() {
        let old_key = generate_signing_key();
        let old = TokenCodec::from_config(&SessionConfig {
            active_signing_key: Some(URL_SAFE_NO_PAD.encode(old_key.to_bytes())),
            ..SessionConfig::default()
        })
        .expect("old codec");
        let rotated = TokenCodec::from_config(&SessionConfig {
            fallback_verifying_keys: vec![old.verifying_key_base64()],
            ..SessionConfig::default()
        })
        .expect("rotated codec");

        let now = Utc::now();
        let issued = old
            .issue_access_token(Uuid::new_v4(), "alice", &[], now)
            .expect("token");
        assert!(rotated.verify_access_token(&issued.token, now).is_ok());
    }

    #[test]
    fn rejects_short_signing_keys() {
        let err = TokenCodec::from_config(&SessionConfig {
            active_signing_key: Some(URL_SAFE_NO_PAD.encode([7u8; 16])),
            ..SessionConfig::default()
        });
        assert!(err.is_err());
    }

    #[test]
    fn refresh_secrets_are_opaque() {
        let codec = codec();
        let secret = codec.issue_refresh_secret();
        assert!(!secret.contains('.'));
        assert_ne!(secret, codec.issue_refresh_secret());
    }
}
