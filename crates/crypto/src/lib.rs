//! Cryptographic helpers shared across the sessionward backend.

use anyhow::{anyhow, Result};
use argon2::{Argon2, PasswordHash, PasswordHasher, PasswordVerifier};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use ed25519_dalek::Signer;
use pwhash::SaltString;
use rand::{rngs::OsRng, RngCore};

pub use ed25519_dalek::{Signature, SigningKey, VerifyingKey};

/// Entropy of an opaque refresh secret, in bytes.
pub const REFRESH_SECRET_BYTES: usize = 32;

pub fn generate_signing_key() -> SigningKey {
    SigningKey::generate(&mut OsRng)
}

pub fn verifying_key_from(signing_key: &SigningKey) -> VerifyingKey {
    signing_key.verifying_key()
}

pub fn sign_message(signing_key: &SigningKey, message: &[u8]) -> Signature {
    signing_key.sign(message)
}

pub fn verify_signature(verifying_key: &VerifyingKey, message: &[u8], signature: &Signature) -> Result<()> {
    verifying_key
        .verify_strict(message, signature)
        .map_err(|err| anyhow::anyhow!(err))
}

/// Generate an opaque refresh secret. It carries no payload; the server-side
/// session record is the only thing that gives it meaning.
pub fn generate_refresh_secret() -> String {
    let mut bytes = [0u8; REFRESH_SECRET_BYTES];
    OsRng.fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// One-way digest of a refresh secret, hex encoded, for storage at rest.
pub fn hash_refresh_secret(secret: &str) -> String {
    blake3::hash(secret.as_bytes()).to_hex().to_string()
}

/// Compare a presented secret against a stored digest in constant time.
///
/// A malformed stored digest never matches.
pub fn refresh_secret_matches(candidate: &str, stored_hash: &str) -> bool {
    match blake3::Hash::from_hex(stored_hash) {
        Ok(stored) => blake3::hash(candidate.as_bytes()) == stored,
        Err(_) => false,
    }
}

pub fn hash_password(password: &str) -> Result<String> {
    let salt = SaltString::generate(&mut OsRng);
    let hash = Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map_err(|err| anyhow!("hashing password failed: {err}"))?;
    Ok(hash.to_string())
}

/// Returns `Ok(false)` on mismatch and an error only when the stored hash is
/// unreadable.
pub fn verify_password(password: &str, password_hash: &str) -> Result<bool> {
    let parsed = PasswordHash::new(password_hash)
        .map_err(|err| anyhow!("invalid password hash: {err}"))?;
    Ok(Argon2::default()
        .verify_password(password.as_bytes(), &parsed)
        .is_ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn refresh_secrets_are_256_bit_and_unique() {
        let first = generate_refresh_secret();
        let second = generate_refresh_secret();
        assert_ne!(first, second);
        let decoded = URL_SAFE_NO_PAD.decode(&first).expect("base64url");
        assert_eq!(decoded.len(), REFRESH_SECRET_BYTES);
        assert!(!first.contains('.'));
    }

    #[test]
    fn refresh_hash_matches_only_its_secret() {
        let secret = generate_refresh_secret();
        let digest = hash_refresh_secret(&secret);
        assert_ne!(digest, secret);
        assert_eq!(digest.len(), 64);
        assert!(refresh_secret_matches(&secret, &digest));
        assert!(!refresh_secret_matches(&generate_refresh_secret(), &digest));
        assert!(!refresh_secret_matches(&secret, "not-a-digest"));
    }

    #[test]
    fn passwords_verify_against_their_hash() {
        let hash = hash_password("pw12345!").expect("hash");
        assert!(hash.starts_with("$argon2"));
        assert!(verify_password("pw12345!", &hash).expect("verify"));
        assert!(!verify_password("wrong-password", &hash).expect("verify"));
        assert!(verify_password("pw12345!", "garbage").is_err());
    }

    #[test]
    fn signatures_round_trip_and_reject_tampering() {
        let key = generate_signing_key();
        let verifying = verifying_key_from(&key);
        let signature = sign_message(&key, b"payload");
        assert!(verify_signature(&verifying, b"payload", &signature).is_ok());
        assert!(verify_signature(&verifying, b"tampered", &signature).is_err());

        let other = verifying_key_from(&generate_signing_key());
        assert!(verify_signature(&other, b"payload", &signature).is_err());
    }
}
