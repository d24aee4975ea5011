//! AES-256-GCM and ChaCha20-Poly1305 AEAD encryption with HKDF key derivation
//!
//! Each object gets its own data key, derived from the custodian key and the plaintext content
//! hash. Every seal draws a fresh random nonce, stored in front of the ciphertext, so sealing
//! the same key twice never reuses a keystream.

use crate::error::ReduceError;
use crate::offload::run_cpu_bound;
use aes_gcm::{aead::Aead, Aes256Gcm, KeyInit};
use async_trait::async_trait;
use blobhouse_core::{
    ContentHash, KeyMaterial, Plugin, PluginCategory, PluginDescriptor, TransformArgs,
    TransformContext, TransformPlugin, TransformRole, VaultResult,
};
use bytes::Bytes;
use chacha20poly1305::ChaCha20Poly1305;
use hkdf::Hkdf;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Transform id of AES-256-GCM.
pub const AES_GCM_ID: &str = "aes-256-gcm";
/// Transform id of ChaCha20-Poly1305.
pub const CHACHA_ID: &str = "chacha20-poly1305";

/// Bytes of nonce prefixed to every sealed payload.
pub const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;
const KEY_INFO: &[u8] = b"blobhouse-object-key";

/// 256-bit (32-byte) encryption key
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct EncryptionKey(pub [u8; 32]);

impl std::fmt::Debug for EncryptionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "EncryptionKey([REDACTED])")
    }
}

/// 96-bit (12-byte) nonce for AEAD ciphers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Nonce(pub [u8; NONCE_LEN]);

/// AEAD cipher selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum EncryptionAlgorithm {
    /// AES-256-GCM; hardware accelerated on x86 with AES-NI
    #[default]
    AesGcm256,
    /// ChaCha20-Poly1305; constant-time, fast on non-AES hardware
    ChaCha20Poly1305,
}

impl EncryptionAlgorithm {
    /// Transform id for this cipher.
    pub fn transform_id(&self) -> &'static str {
        match self {
            EncryptionAlgorithm::AesGcm256 => AES_GCM_ID,
            EncryptionAlgorithm::ChaCha20Poly1305 => CHACHA_ID,
        }
    }
}

/// Derive the per-object data key from custodian key material and the content hash.
pub fn derive_object_key(
    master: &KeyMaterial,
    content_hash: &ContentHash,
    algo: EncryptionAlgorithm,
) -> Result<EncryptionKey, ReduceError> {
    let hk = Hkdf::<Sha256>::new(Some(content_hash.as_bytes()), master.as_bytes());
    let mut info = Vec::with_capacity(KEY_INFO.len() + 1 + algo.transform_id().len());
    info.extend_from_slice(KEY_INFO);
    info.push(b'/');
    info.extend_from_slice(algo.transform_id().as_bytes());
    let mut okm = [0u8; 32];
    hk.expand(&info, &mut okm)
        .map_err(|e| ReduceError::EncryptionFailed(format!("HKDF expand failed: {e}")))?;
    Ok(EncryptionKey(okm))
}

/// Generate a random 96-bit nonce.
pub fn random_nonce() -> Nonce {
    let mut bytes = [0u8; NONCE_LEN];
    rand::thread_rng().fill_bytes(&mut bytes);
    Nonce(bytes)
}

fn seal(
    plaintext: &[u8],
    key: &EncryptionKey,
    nonce: &Nonce,
    algo: EncryptionAlgorithm,
) -> Result<Vec<u8>, ReduceError> {
    match algo {
        EncryptionAlgorithm::AesGcm256 => {
            let cipher = Aes256Gcm::new_from_slice(&key.0)
                .map_err(|e| ReduceError::EncryptionFailed(e.to_string()))?;
            cipher
                .encrypt(aes_gcm::Nonce::from_slice(&nonce.0), plaintext)
                .map_err(|e| ReduceError::EncryptionFailed(e.to_string()))
        }
        EncryptionAlgorithm::ChaCha20Poly1305 => {
            use chacha20poly1305::aead::Aead as _;
            use chacha20poly1305::KeyInit as _;
            let cipher = ChaCha20Poly1305::new_from_slice(&key.0)
                .map_err(|e| ReduceError::EncryptionFailed(e.to_string()))?;
            cipher
                .encrypt(chacha20poly1305::Nonce::from_slice(&nonce.0), plaintext)
                .map_err(|e| ReduceError::EncryptionFailed(e.to_string()))
        }
    }
}

fn open(
    ciphertext: &[u8],
    key: &EncryptionKey,
    nonce: &Nonce,
    algo: EncryptionAlgorithm,
) -> Result<Vec<u8>, ReduceError> {
    match algo {
        EncryptionAlgorithm::AesGcm256 => {
            let cipher = Aes256Gcm::new_from_slice(&key.0)
                .map_err(|e| ReduceError::EncryptionFailed(e.to_string()))?;
            cipher
                .decrypt(aes_gcm::Nonce::from_slice(&nonce.0), ciphertext)
                .map_err(|_| ReduceError::DecryptionAuthFailed)
        }
        EncryptionAlgorithm::ChaCha20Poly1305 => {
            use chacha20poly1305::aead::Aead as _;
            use chacha20poly1305::KeyInit as _;
            let cipher = ChaCha20Poly1305::new_from_slice(&key.0)
                .map_err(|e| ReduceError::EncryptionFailed(e.to_string()))?;
            cipher
                .decrypt(chacha20poly1305::Nonce::from_slice(&nonce.0), ciphertext)
                .map_err(|_| ReduceError::DecryptionAuthFailed)
        }
    }
}

/// Encrypt plaintext under a fresh random nonce.
///
/// Output layout: `nonce (12) || ciphertext || tag (16)`.
pub fn encrypt(
    plaintext: &[u8],
    key: &EncryptionKey,
    algo: EncryptionAlgorithm,
) -> Result<Vec<u8>, ReduceError> {
    let nonce = random_nonce();
    let sealed = seal(plaintext, key, &nonce, algo)?;
    let mut out = Vec::with_capacity(NONCE_LEN + sealed.len());
    out.extend_from_slice(&nonce.0);
    out.extend_from_slice(&sealed);
    Ok(out)
}

/// Decrypt output of [`encrypt`]. Returns DecryptionAuthFailed if the key is wrong, the data
/// was tampered with or the payload is too short to hold a nonce and tag.
pub fn decrypt(
    sealed: &[u8],
    key: &EncryptionKey,
    algo: EncryptionAlgorithm,
) -> Result<Vec<u8>, ReduceError> {
    if sealed.len() < NONCE_LEN + TAG_LEN {
        return Err(ReduceError::DecryptionAuthFailed);
    }
    let (prefix, ciphertext) = sealed.split_at(NONCE_LEN);
    let mut nonce = [0u8; NONCE_LEN];
    nonce.copy_from_slice(prefix);
    open(ciphertext, key, &Nonce(nonce), algo)
}

/// An AEAD cipher registered as a keyed transform plugin.
pub struct EncryptionTransform {
    descriptor: PluginDescriptor,
    algo: EncryptionAlgorithm,
}

impl EncryptionTransform {
    /// Transform for `algo`.
    pub fn new(algo: EncryptionAlgorithm) -> Self {
        let name = match algo {
            EncryptionAlgorithm::AesGcm256 => "AES-256-GCM",
            EncryptionAlgorithm::ChaCha20Poly1305 => "ChaCha20-Poly1305",
        };
        Self {
            descriptor: PluginDescriptor::new(
                algo.transform_id(),
                name,
                "1.0.0",
                PluginCategory::Transform,
            )
            .with_tags([TransformRole::Encryption.tag(), "aead"]),
            algo,
        }
    }

    /// AES-256-GCM transform.
    pub fn aes_gcm() -> Self {
        Self::new(EncryptionAlgorithm::AesGcm256)
    }

    /// ChaCha20-Poly1305 transform.
    pub fn chacha20() -> Self {
        Self::new(EncryptionAlgorithm::ChaCha20Poly1305)
    }

    fn object_key(&self, ctx: &TransformContext) -> Result<EncryptionKey, ReduceError> {
        let record = ctx.key.as_ref().ok_or(ReduceError::MissingKey)?;
        derive_object_key(&record.material, &ctx.content_hash, self.algo)
    }
}

impl Plugin for EncryptionTransform {
    fn descriptor(&self) -> &PluginDescriptor {
        &self.descriptor
    }
}

#[async_trait]
impl TransformPlugin for EncryptionTransform {
    fn role(&self) -> TransformRole {
        TransformRole::Encryption
    }

    fn requires_key(&self) -> bool {
        true
    }

    async fn apply(
        &self,
        input: Bytes,
        _args: &TransformArgs,
        ctx: &TransformContext,
    ) -> VaultResult<Bytes> {
        let key = self.object_key(ctx).map_err(|e| e.into_vault(self.id()))?;
        let algo = self.algo;
        run_cpu_bound(input.len(), move || encrypt(&input, &key, algo))
            .await
            .map(Bytes::from)
            .map_err(|e| e.into_vault(self.id()))
    }

    async fn reverse(
        &self,
        input: Bytes,
        _args: &TransformArgs,
        ctx: &TransformContext,
    ) -> VaultResult<Bytes> {
        let key = self.object_key(ctx).map_err(|e| e.into_vault(self.id()))?;
        let algo = self.algo;
        run_cpu_bound(input.len(), move || decrypt(&input, &key, algo))
            .await
            .map(Bytes::from)
            .map_err(|e| e.into_vault(self.id()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fingerprint::blake3_hash;
    use blobhouse_core::{KeyRecord, VaultError};
    use proptest::prelude::*;

    fn test_material() -> KeyMaterial {
        KeyMaterial([42u8; 32])
    }

    fn keyed_ctx(data: &[u8], material: KeyMaterial) -> TransformContext {
        TransformContext {
            content_hash: blake3_hash(data),
            key: Some(KeyRecord {
                key_id: "k1".into(),
                generation: 1,
                material,
                created_at: chrono::Utc::now(),
            }),
        }
    }

    fn xor(a: &[u8], b: &[u8]) -> Vec<u8> {
        a.iter().zip(b).map(|(x, y)| x ^ y).collect()
    }

    proptest! {
        #[test]
        fn prop_aesgcm_roundtrip(data in prop::collection::vec(0u8..=255, 0..65_536)) {
            let key = derive_object_key(&test_material(), &blake3_hash(&data), EncryptionAlgorithm::AesGcm256).unwrap();
            let enc = encrypt(&data, &key, EncryptionAlgorithm::AesGcm256).unwrap();
            prop_assert_eq!(enc.len(), data.len() + NONCE_LEN + TAG_LEN);
            let dec = decrypt(&enc, &key, EncryptionAlgorithm::AesGcm256).unwrap();
            prop_assert_eq!(dec, data);
        }
        #[test]
        fn prop_chacha_roundtrip(data in prop::collection::vec(0u8..=255, 0..65_536)) {
            let key = derive_object_key(&test_material(), &blake3_hash(&data), EncryptionAlgorithm::ChaCha20Poly1305).unwrap();
            let enc = encrypt(&data, &key, EncryptionAlgorithm::ChaCha20Poly1305).unwrap();
            let dec = decrypt(&enc, &key, EncryptionAlgorithm::ChaCha20Poly1305).unwrap();
            prop_assert_eq!(dec, data);
        }
    }

    #[test]
    fn tampered_ciphertext_fails() {
        let key =
            derive_object_key(&test_material(), &blake3_hash(b"secret"), EncryptionAlgorithm::AesGcm256)
                .unwrap();
        let mut enc = encrypt(b"secret", &key, EncryptionAlgorithm::AesGcm256).unwrap();
        enc[NONCE_LEN] ^= 0xff;
        assert!(matches!(
            decrypt(&enc, &key, EncryptionAlgorithm::AesGcm256),
            Err(ReduceError::DecryptionAuthFailed)
        ));
    }

    #[test]
    fn tampered_nonce_fails() {
        let key =
            derive_object_key(&test_material(), &blake3_hash(b"secret"), EncryptionAlgorithm::ChaCha20Poly1305)
                .unwrap();
        let mut enc = encrypt(b"secret", &key, EncryptionAlgorithm::ChaCha20Poly1305).unwrap();
        enc[0] ^= 0x01;
        assert!(matches!(
            decrypt(&enc, &key, EncryptionAlgorithm::ChaCha20Poly1305),
            Err(ReduceError::DecryptionAuthFailed)
        ));
    }

    #[test]
    fn truncated_payload_fails() {
        let key =
            derive_object_key(&test_material(), &blake3_hash(b""), EncryptionAlgorithm::AesGcm256).unwrap();
        assert!(matches!(
            decrypt(&[0u8; NONCE_LEN + TAG_LEN - 1], &key, EncryptionAlgorithm::AesGcm256),
            Err(ReduceError::DecryptionAuthFailed)
        ));
    }

    #[test]
    fn derivation_is_deterministic_and_content_bound() {
        let m = test_material();
        let k1 = derive_object_key(&m, &ContentHash([1u8; 32]), EncryptionAlgorithm::AesGcm256).unwrap();
        let k1b = derive_object_key(&m, &ContentHash([1u8; 32]), EncryptionAlgorithm::AesGcm256).unwrap();
        let k2 = derive_object_key(&m, &ContentHash([2u8; 32]), EncryptionAlgorithm::AesGcm256).unwrap();
        let k3 = derive_object_key(&m, &ContentHash([1u8; 32]), EncryptionAlgorithm::ChaCha20Poly1305).unwrap();
        assert_eq!(k1.0, k1b.0);
        assert_ne!(k1.0, k2.0);
        assert_ne!(k1.0, k3.0);
    }

    #[test]
    fn nonces_are_unique() {
        let nonces: std::collections::HashSet<Nonce> = (0..1000).map(|_| random_nonce()).collect();
        assert_eq!(nonces.len(), 1000);
    }

    #[tokio::test]
    async fn repeated_seal_uses_fresh_nonce() {
        let t = EncryptionTransform::aes_gcm();
        let data = Bytes::from_static(b"identical content");
        let ctx = keyed_ctx(&data, test_material());
        let a = t.apply(data.clone(), &TransformArgs::new(), &ctx).await.unwrap();
        let b = t.apply(data.clone(), &TransformArgs::new(), &ctx).await.unwrap();
        assert_ne!(a[..NONCE_LEN], b[..NONCE_LEN]);
        assert_ne!(a, b);
        for sealed in [a, b] {
            let back = t.reverse(sealed, &TransformArgs::new(), &ctx).await.unwrap();
            assert_eq!(back, data);
        }
    }

    #[tokio::test]
    async fn sealing_twice_never_exposes_plaintext() {
        let t = EncryptionTransform::aes_gcm();
        let secret = Bytes::from_static(b"TOP SECRET: launch codes 0000");
        let ctx = keyed_ctx(&secret, test_material());
        let once = t.apply(secret.clone(), &TransformArgs::new(), &ctx).await.unwrap();
        let twice = t.apply(once.clone(), &TransformArgs::new(), &ctx).await.unwrap();

        assert!(!twice.windows(8).any(|w| secret.windows(8).any(|s| s == w)));
        assert_ne!(&twice[NONCE_LEN..NONCE_LEN + once.len()], &once[..]);

        let back = t.reverse(twice, &TransformArgs::new(), &ctx).await.unwrap();
        let back = t.reverse(back, &TransformArgs::new(), &ctx).await.unwrap();
        assert_eq!(back, secret);
    }

    #[tokio::test]
    async fn different_inputs_under_one_content_hash_do_not_share_keystream() {
        let t = EncryptionTransform::aes_gcm();
        let ctx = keyed_ctx(b"original content", test_material());
        let pt1 = Bytes::from_static(b"first encoding of the original content");
        let pt2 = Bytes::from_static(b"second, different encoding of the same");
        let ct1 = t.apply(pt1.clone(), &TransformArgs::new(), &ctx).await.unwrap();
        let ct2 = t.apply(pt2.clone(), &TransformArgs::new(), &ctx).await.unwrap();

        let n = pt1.len().min(pt2.len());
        let ct_xor = xor(&ct1[NONCE_LEN..NONCE_LEN + n], &ct2[NONCE_LEN..NONCE_LEN + n]);
        assert_ne!(ct_xor, xor(&pt1[..n], &pt2[..n]));
    }

    #[tokio::test]
    async fn wrong_generation_key_fails_authentication() {
        let t = EncryptionTransform::chacha20();
        let data = Bytes::from_static(b"rotated");
        let sealed = t
            .apply(data.clone(), &TransformArgs::new(), &keyed_ctx(&data, test_material()))
            .await
            .unwrap();
        let err = t
            .reverse(sealed, &TransformArgs::new(), &keyed_ctx(&data, KeyMaterial([7u8; 32])))
            .await
            .unwrap_err();
        assert!(matches!(err, VaultError::TransformFailed { ref id, .. } if id == CHACHA_ID));
    }

    #[tokio::test]
    async fn missing_key_is_rejected() {
        let t = EncryptionTransform::aes_gcm();
        assert!(t.requires_key());
        let err = t
            .apply(
                Bytes::from_static(b"x"),
                &TransformArgs::new(),
                &TransformContext::unkeyed(blake3_hash(b"x")),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, VaultError::TransformFailed { .. }));
    }
}
