//! Key material handed out by a key store after a successful access check.

use chrono::{DateTime, Utc};
use zeroize::{Zeroize, ZeroizeOnDrop};

/// 256-bit key material. Zeroed on drop, never printed.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct KeyMaterial(pub [u8; 32]);

impl KeyMaterial {
    /// Fresh random key material.
    pub fn random() -> Self {
        use rand::RngCore;
        let mut bytes = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut bytes);
        KeyMaterial(bytes)
    }

    /// Raw bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl std::fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "KeyMaterial([REDACTED])")
    }
}

/// One generation of a named key.
#[derive(Clone)]
pub struct KeyRecord {
    /// Key id
    pub key_id: String,
    /// Generation, starting at 1 and incremented by every rotation
    pub generation: u32,
    /// Key bytes
    pub material: KeyMaterial,
    /// When this generation was created
    pub created_at: DateTime<Utc>,
}

impl std::fmt::Debug for KeyRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyRecord")
            .field("key_id", &self.key_id)
            .field("generation", &self.generation)
            .field("material", &"[REDACTED]")
            .field("created_at", &self.created_at)
            .finish()
    }
}
