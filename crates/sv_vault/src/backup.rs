//! Password-protected backup envelopes for captured session state.
//!
//! Two formats exist on disk:
//! - **Sealed (v2, written and read)**: a JSON envelope holding an
//!   AES-256-GCM ciphertext under a PBKDF2-HMAC-SHA256 derived key.
//!   Fresh salt and nonce on every encode, so two exports of the same
//!   account never produce comparable ciphertexts.
//! - **Legacy (read-only)**: bare Base64 of `raw_state XOR
//!   repeat(password)`, no header, no authentication. Accepted on
//!   import for old backups, never produced. A wrong password on this
//!   path silently yields garbage bytes; that is a known weakness of
//!   the old format, kept as-is for compatibility.

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use rand::RngCore;
use serde::{Deserialize, Serialize};

pub const ENVELOPE_VERSION: u8 = 2;
pub const PBKDF2_ITERATIONS: u32 = 210_000;
const ENVELOPE_KDF: &str = "pbkdf2-sha256";
const SALT_LEN: usize = 16;
const NONCE_LEN: usize = 12;

// Bounds on the iteration count accepted from an envelope, so a
// crafted file can't stall decode for minutes.
const MIN_ITERATIONS: u32 = 10_000;
const MAX_ITERATIONS: u32 = 10_000_000;

#[derive(Debug, thiserror::Error)]
pub enum BackupError {
    #[error("backup password cannot be empty")]
    EmptyPassword,

    /// Wrong password and corrupted/tampered data are indistinguishable
    /// on the sealed path; the AEAD tag check conflates them on purpose.
    #[error("wrong password, or the backup is corrupted")]
    Integrity,

    #[error("unsupported backup envelope (v{version}, kdf \"{kdf}\")")]
    UnsupportedVersion { version: u8, kdf: String },

    #[error("refusing backup envelope with {0} KDF iterations")]
    KdfParams(u32),

    #[error("malformed backup envelope: {0}")]
    Malformed(String),

    #[error("base64 decode error: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("encryption failed: {0}")]
    Crypto(String),
}

/// The sealed on-disk format. Field names are the wire format.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct SealedEnvelope {
    pub v: u8,
    pub kdf: String,
    pub iter: u32,
    #[serde(rename = "salt")]
    pub salt_b64: String,
    #[serde(rename = "nonce")]
    pub nonce_b64: String,
    #[serde(rename = "ciphertext")]
    pub ciphertext_b64: String,
}

impl SealedEnvelope {
    pub fn to_json(&self) -> Result<String, BackupError> {
        serde_json::to_string(self).map_err(|e| BackupError::Crypto(e.to_string()))
    }
}

/// Backup input, classified by the presence of the version
/// discriminator. `encode` only ever produces the sealed shape.
#[derive(Debug)]
pub enum BackupEnvelope {
    Sealed(SealedEnvelope),
    Legacy(String),
}

impl BackupEnvelope {
    /// Classify raw file contents. Anything that isn't a well-formed
    /// sealed envelope falls back to the legacy path.
    #[must_use]
    pub fn parse(input: &str) -> Self {
        let trimmed = input.trim();
        if trimmed.starts_with('{') {
            if let Ok(envelope) = serde_json::from_str::<SealedEnvelope>(trimmed) {
                return BackupEnvelope::Sealed(envelope);
            }
        }
        BackupEnvelope::Legacy(trimmed.to_owned())
    }
}

fn derive_key(password: &[u8], salt: &[u8], iterations: u32) -> [u8; 32] {
    use pbkdf2::pbkdf2_hmac;
    use sha2::Sha256;

    let mut key = [0u8; 32];
    pbkdf2_hmac::<Sha256>(password, salt, iterations, &mut key);
    key
}

/// Seal `raw_state` under `password`.
///
/// Salt and nonce are drawn fresh from the OS RNG on every call.
pub fn encode(raw_state: &[u8], password: &str) -> Result<SealedEnvelope, BackupError> {
    if password.is_empty() {
        return Err(BackupError::EmptyPassword);
    }

    let mut salt = [0u8; SALT_LEN];
    rand::rngs::OsRng.fill_bytes(&mut salt);

    let mut nonce_bytes = [0u8; NONCE_LEN];
    rand::rngs::OsRng.fill_bytes(&mut nonce_bytes);

    let key = derive_key(password.as_bytes(), &salt, PBKDF2_ITERATIONS);
    let cipher =
        Aes256Gcm::new_from_slice(&key).map_err(|e| BackupError::Crypto(e.to_string()))?;

    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce_bytes), raw_state)
        .map_err(|e| BackupError::Crypto(e.to_string()))?;

    Ok(SealedEnvelope {
        v: ENVELOPE_VERSION,
        kdf: ENVELOPE_KDF.to_owned(),
        iter: PBKDF2_ITERATIONS,
        salt_b64: BASE64.encode(salt),
        nonce_b64: BASE64.encode(nonce_bytes),
        ciphertext_b64: BASE64.encode(ciphertext),
    })
}

/// Open a backup of either format.
///
/// The sealed path authenticates; the legacy path can't, and returns
/// whatever the XOR produces.
pub fn decode(input: &str, password: &str) -> Result<Vec<u8>, BackupError> {
    if password.is_empty() {
        return Err(BackupError::EmptyPassword);
    }

    match BackupEnvelope::parse(input) {
        BackupEnvelope::Sealed(envelope) => decode_sealed(&envelope, password),
        BackupEnvelope::Legacy(text) => decode_legacy(&text, password),
    }
}

pub fn decode_sealed(envelope: &SealedEnvelope, password: &str) -> Result<Vec<u8>, BackupError> {
    if envelope.v != ENVELOPE_VERSION || envelope.kdf != ENVELOPE_KDF {
        return Err(BackupError::UnsupportedVersion {
            version: envelope.v,
            kdf: envelope.kdf.clone(),
        });
    }
    if !(MIN_ITERATIONS..=MAX_ITERATIONS).contains(&envelope.iter) {
        return Err(BackupError::KdfParams(envelope.iter));
    }

    let salt = BASE64.decode(&envelope.salt_b64)?;
    let nonce_bytes = BASE64.decode(&envelope.nonce_b64)?;
    let ciphertext = BASE64.decode(&envelope.ciphertext_b64)?;

    if salt.len() != SALT_LEN || nonce_bytes.len() != NONCE_LEN {
        return Err(BackupError::Malformed(format!(
            "salt is {} bytes, nonce is {} bytes",
            salt.len(),
            nonce_bytes.len()
        )));
    }

    let key = derive_key(password.as_bytes(), &salt, envelope.iter);
    let cipher =
        Aes256Gcm::new_from_slice(&key).map_err(|e| BackupError::Crypto(e.to_string()))?;

    cipher
        .decrypt(Nonce::from_slice(&nonce_bytes), ciphertext.as_ref())
        .map_err(|_| BackupError::Integrity)
}

fn decode_legacy(text: &str, password: &str) -> Result<Vec<u8>, BackupError> {
    let decoded = BASE64.decode(text)?;
    let password_bytes = password.as_bytes();

    Ok(decoded
        .iter()
        .enumerate()
        .map(|(i, byte)| byte ^ password_bytes[i % password_bytes.len()])
        .collect())
}

/// Produce a legacy-format backup. Only used by tests and migration
/// tooling; `encode` never emits this shape.
#[must_use]
pub fn encode_legacy_for_tests(raw_state: &[u8], password: &str) -> String {
    let password_bytes = password.as_bytes();
    // XOR with an empty key is the identity.
    if password_bytes.is_empty() {
        return BASE64.encode(raw_state);
    }
    let xored: Vec<u8> = raw_state
        .iter()
        .enumerate()
        .map(|(i, byte)| byte ^ password_bytes[i % password_bytes.len()])
        .collect();
    BASE64.encode(xored)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn round_trip() {
        let envelope = encode(b"session-blob", "abcd1234").unwrap();
        let json = envelope.to_json().unwrap();
        assert_eq!(decode(&json, "abcd1234").unwrap(), b"session-blob");
    }

    #[test]
    fn wrong_password_is_integrity_error() {
        let envelope = encode(b"session-blob", "correct").unwrap();
        let json = envelope.to_json().unwrap();
        assert!(matches!(
            decode(&json, "incorrect"),
            Err(BackupError::Integrity)
        ));
    }

    #[test]
    fn tampered_ciphertext_is_integrity_error() {
        let mut envelope = encode(b"payload", "pw").unwrap();
        let mut ct = BASE64.decode(&envelope.ciphertext_b64).unwrap();
        ct[0] ^= 0xff;
        envelope.ciphertext_b64 = BASE64.encode(ct);
        assert!(matches!(
            decode_sealed(&envelope, "pw"),
            Err(BackupError::Integrity)
        ));
    }

    #[test]
    fn salt_and_nonce_never_repeat() {
        let mut seen = HashSet::new();
        for _ in 0..32 {
            let envelope = encode(b"same payload", "same password").unwrap();
            assert!(seen.insert((envelope.salt_b64.clone(), envelope.nonce_b64.clone())));
        }
    }

    #[test]
    fn legacy_decode_with_correct_password() {
        let text = encode_legacy_for_tests(b"old-session", "hunter2");
        assert_eq!(decode(&text, "hunter2").unwrap(), b"old-session");
    }

    #[test]
    fn legacy_wrong_password_returns_garbage_not_error() {
        let text = encode_legacy_for_tests(b"old-session", "hunter2");
        let wrong = decode(&text, "letmein!").unwrap();
        assert_ne!(wrong, b"old-session");
    }

    #[test]
    fn input_without_discriminator_routes_to_legacy() {
        let text = encode_legacy_for_tests(b"anything", "pw");
        assert!(matches!(
            BackupEnvelope::parse(&text),
            BackupEnvelope::Legacy(_)
        ));
        // Never an integrity error, whatever the password.
        assert!(decode(&text, "not-the-password").is_ok());
    }

    #[test]
    fn sealed_input_routes_to_sealed() {
        let json = encode(b"x", "pw").unwrap().to_json().unwrap();
        assert!(matches!(
            BackupEnvelope::parse(&json),
            BackupEnvelope::Sealed(_)
        ));
    }

    #[test]
    fn extreme_iteration_counts_rejected() {
        let mut envelope = encode(b"x", "pw").unwrap();
        envelope.iter = 5;
        assert!(matches!(
            decode_sealed(&envelope, "pw"),
            Err(BackupError::KdfParams(5))
        ));
        envelope.iter = 2_000_000_000;
        assert!(matches!(
            decode_sealed(&envelope, "pw"),
            Err(BackupError::KdfParams(_))
        ));
    }

    #[test]
    fn unsupported_version_rejected() {
        let mut envelope = encode(b"x", "pw").unwrap();
        envelope.v = 3;
        assert!(matches!(
            decode_sealed(&envelope, "pw"),
            Err(BackupError::UnsupportedVersion { version: 3, .. })
        ));
    }

    #[test]
    fn legacy_encode_with_empty_password_is_plain_base64() {
        assert_eq!(encode_legacy_for_tests(b"bytes", ""), BASE64.encode(b"bytes"));
    }

    #[test]
    fn empty_password_rejected_both_ways() {
        assert!(matches!(encode(b"x", ""), Err(BackupError::EmptyPassword)));
        assert!(matches!(decode("e30=", ""), Err(BackupError::EmptyPassword)));
    }

    #[test]
    fn envelope_json_uses_wire_field_names() {
        let json = encode(b"x", "pw").unwrap().to_json().unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["v"], 2);
        assert_eq!(value["kdf"], "pbkdf2-sha256");
        assert_eq!(value["iter"], 210_000);
        assert!(value["salt"].is_string());
        assert!(value["nonce"].is_string());
        assert!(value["ciphertext"].is_string());
    }
}
