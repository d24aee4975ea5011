//! Envelope encryption of key material at rest.
//!
//! Each key generation is wrapped with the master key using AES-256-GCM and a fresh random
//! nonce. The key id and generation are bound as associated data, so a wrapped blob cannot be
//! replayed under another id or generation.

use aes_gcm::aead::{Aead, Payload};
use aes_gcm::{Aes256Gcm, KeyInit};
use blobhouse_core::{KeyMaterial, VaultError, VaultResult};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

/// Key-encryption key loaded from the environment or configuration.
#[derive(Clone)]
pub struct MasterKey(KeyMaterial);

impl std::fmt::Debug for MasterKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "MasterKey([REDACTED])")
    }
}

impl MasterKey {
    /// Wrap raw material.
    pub fn new(material: KeyMaterial) -> Self {
        Self(material)
    }

    /// Parse 64 hex characters.
    pub fn from_hex(s: &str) -> VaultResult<Self> {
        let raw = Zeroizing::new(hex::decode(s.trim()).map_err(|e| {
            VaultError::ConfigurationError(format!("master key is not valid hex: {e}"))
        })?);
        let bytes: [u8; 32] = raw.as_slice().try_into().map_err(|_| {
            VaultError::ConfigurationError(format!(
                "master key must be 32 bytes, got {}",
                raw.len()
            ))
        })?;
        Ok(Self(KeyMaterial(bytes)))
    }

    /// Read from environment variable `var`. Absent variable is `Ok(None)`.
    pub fn from_env(var: &str) -> VaultResult<Option<Self>> {
        match std::env::var(var) {
            Ok(v) if !v.trim().is_empty() => Self::from_hex(&v).map(Some),
            _ => Ok(None),
        }
    }
}

/// A key generation wrapped by the master key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WrappedKey {
    /// Hex nonce
    pub nonce: String,
    /// Hex ciphertext with the 16-byte tag appended (32 + 16 bytes)
    pub ciphertext: String,
}

fn associated_data(key_id: &str, generation: u32) -> Vec<u8> {
    let mut aad = Vec::with_capacity(key_id.len() + 5);
    aad.extend_from_slice(key_id.as_bytes());
    aad.push(0);
    aad.extend_from_slice(&generation.to_be_bytes());
    aad
}

/// Wrap `material` for (`key_id`, `generation`).
pub fn wrap(
    master: &MasterKey,
    key_id: &str,
    generation: u32,
    material: &KeyMaterial,
) -> VaultResult<WrappedKey> {
    let mut nonce = [0u8; 12];
    rand::thread_rng().fill_bytes(&mut nonce);

    let cipher = Aes256Gcm::new_from_slice(master.0.as_bytes())
        .map_err(|e| VaultError::ConfigurationError(format!("bad master key: {e}")))?;
    let aad = associated_data(key_id, generation);
    let ciphertext = cipher
        .encrypt(
            aes_gcm::Nonce::from_slice(&nonce),
            Payload {
                msg: material.as_bytes(),
                aad: &aad,
            },
        )
        .map_err(|e| VaultError::BackendUnavailable(format!("key wrap failed: {e}")))?;

    Ok(WrappedKey {
        nonce: hex::encode(nonce),
        ciphertext: hex::encode(ciphertext),
    })
}

/// Recover the material wrapped for (`key_id`, `generation`).
/// A wrong master key or tampered record is [`VaultError::Corruption`].
pub fn unwrap(
    master: &MasterKey,
    key_id: &str,
    generation: u32,
    wrapped: &WrappedKey,
) -> VaultResult<KeyMaterial> {
    let nonce = hex::decode(&wrapped.nonce)
        .map_err(|e| VaultError::Corruption(format!("wrapped key nonce: {e}")))?;
    if nonce.len() != 12 {
        return Err(VaultError::Corruption("wrapped key nonce must be 12 bytes".into()));
    }
    let ciphertext = hex::decode(&wrapped.ciphertext)
        .map_err(|e| VaultError::Corruption(format!("wrapped key ciphertext: {e}")))?;

    let cipher = Aes256Gcm::new_from_slice(master.0.as_bytes())
        .map_err(|e| VaultError::ConfigurationError(format!("bad master key: {e}")))?;
    let aad = associated_data(key_id, generation);
    let plain = Zeroizing::new(cipher
        .decrypt(
            aes_gcm::Nonce::from_slice(&nonce),
            Payload {
                msg: &ciphertext,
                aad: &aad,
            },
        )
        .map_err(|_| {
            VaultError::Corruption(format!(
                "cannot unwrap {key_id} generation {generation}: wrong master key or tampered record"
            ))
        })?);

    let bytes: [u8; 32] = plain
        .as_slice()
        .try_into()
        .map_err(|_| VaultError::Corruption("unwrapped key has wrong length".into()))?;
    Ok(KeyMaterial(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn master() -> MasterKey {
        MasterKey::new(KeyMaterial([42u8; 32]))
    }

    #[test]
    fn wrap_unwrap_roundtrip() {
        let dek = KeyMaterial::random();
        let wrapped = wrap(&master(), "k1", 1, &dek).unwrap();
        assert_eq!(unwrap(&master(), "k1", 1, &wrapped).unwrap(), dek);
    }

    #[test]
    fn nonces_are_fresh() {
        let dek = KeyMaterial::random();
        let a = wrap(&master(), "k1", 1, &dek).unwrap();
        let b = wrap(&master(), "k1", 1, &dek).unwrap();
        assert_ne!(a.nonce, b.nonce);
    }

    #[test]
    fn wrong_master_fails() {
        let wrapped = wrap(&master(), "k1", 1, &KeyMaterial::random()).unwrap();
        let other = MasterKey::new(KeyMaterial([9u8; 32]));
        assert!(matches!(
            unwrap(&other, "k1", 1, &wrapped),
            Err(VaultError::Corruption(_))
        ));
    }

    #[test]
    fn record_is_bound_to_id_and_generation() {
        let wrapped = wrap(&master(), "k1", 1, &KeyMaterial::random()).unwrap();
        assert!(unwrap(&master(), "k1", 2, &wrapped).is_err());
        assert!(unwrap(&master(), "k2", 1, &wrapped).is_err());
    }

    #[test]
    fn master_key_hex_parsing() {
        let hex64 = "ab".repeat(32);
        assert!(MasterKey::from_hex(&hex64).is_ok());
        assert!(matches!(
            MasterKey::from_hex("abcd"),
            Err(VaultError::ConfigurationError(_))
        ));
        assert!(matches!(
            MasterKey::from_hex("zz"),
            Err(VaultError::ConfigurationError(_))
        ));
    }

    #[test]
    fn missing_env_var_is_none() {
        assert!(MasterKey::from_env("BLOBHOUSE_TEST_UNSET_MASTER_KEY_VAR")
            .unwrap()
            .is_none());
    }
}
