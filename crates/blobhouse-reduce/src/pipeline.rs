//! Chain execution: run a recorded transform chain forward on write and mirrored on read

use blobhouse_core::{
    Direction, TransformChain, TransformContext, TransformPlugin, TransformStep, VaultError,
    VaultResult,
};
use bytes::Bytes;
use std::sync::Arc;
use tracing::{debug, instrument};

/// Statistics from one chain run
#[derive(Debug, Default, Clone, PartialEq)]
pub struct ReductionStats {
    /// Bytes entering the first step
    pub input_bytes: u64,
    /// Bytes leaving the last step
    pub output_bytes: u64,
    /// Steps executed
    pub steps: usize,
}

impl ReductionStats {
    /// input / output, or 1.0 for empty output.
    pub fn ratio(&self) -> f64 {
        if self.output_bytes > 0 {
            self.input_bytes as f64 / self.output_bytes as f64
        } else {
            1.0
        }
    }
}

fn resolve_all<F>(
    steps: &[TransformStep],
    lookup: &F,
) -> VaultResult<Vec<Arc<dyn TransformPlugin>>>
where
    F: Fn(&str) -> Option<Arc<dyn TransformPlugin>>,
{
    steps
        .iter()
        .map(|s| {
            lookup(&s.transform_id)
                .ok_or_else(|| VaultError::TransformUnavailable(s.transform_id.clone()))
        })
        .collect()
}

async fn run_steps<F>(
    steps: Vec<TransformStep>,
    input: Bytes,
    ctx: &TransformContext,
    lookup: F,
) -> VaultResult<(Bytes, ReductionStats)>
where
    F: Fn(&str) -> Option<Arc<dyn TransformPlugin>>,
{
    // Every step must be resolvable before any of them runs.
    let transforms = resolve_all(&steps, &lookup)?;
    let mut stats = ReductionStats {
        input_bytes: input.len() as u64,
        ..Default::default()
    };
    let mut data = input;
    for (step, transform) in steps.iter().zip(transforms) {
        let before = data.len();
        data = match step.direction {
            Direction::Apply => transform.apply(data, &step.args, ctx).await?,
            Direction::Reverse => transform.reverse(data, &step.args, ctx).await?,
        };
        debug!(
            transform = %step.transform_id,
            direction = ?step.direction,
            before,
            after = data.len(),
            "transform step"
        );
        stats.steps += 1;
    }
    stats.output_bytes = data.len() as u64;
    Ok((data, stats))
}

/// Encode `input` with `chain` in apply order.
#[instrument(skip(chain, input, ctx, lookup), fields(hash = %ctx.content_hash, steps = chain.len()))]
pub async fn apply_chain<F>(
    chain: &TransformChain,
    input: Bytes,
    ctx: &TransformContext,
    lookup: F,
) -> VaultResult<(Bytes, ReductionStats)>
where
    F: Fn(&str) -> Option<Arc<dyn TransformPlugin>>,
{
    run_steps(chain.apply_steps(), input, ctx, lookup).await
}

/// Decode `input` by replaying `chain` mirrored. A step whose transform is not registered
/// fails with [`VaultError::TransformUnavailable`] before any work is done.
#[instrument(skip(chain, input, ctx, lookup), fields(hash = %ctx.content_hash, steps = chain.len()))]
pub async fn reverse_chain<F>(
    chain: &TransformChain,
    input: Bytes,
    ctx: &TransformContext,
    lookup: F,
) -> VaultResult<(Bytes, ReductionStats)>
where
    F: Fn(&str) -> Option<Arc<dyn TransformPlugin>>,
{
    run_steps(chain.reverse_steps(), input, ctx, lookup).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compression::{CompressionTransform, ARG_LEVEL, LZ4_ID, ZSTD_ID};
    use crate::encryption::{EncryptionTransform, AES_GCM_ID, CHACHA_ID};
    use crate::fingerprint::blake3_hash;
    use blobhouse_core::{KeyMaterial, KeyRecord, TransformRecord};
    use proptest::prelude::*;
    use std::collections::HashMap;

    fn registry() -> HashMap<String, Arc<dyn TransformPlugin>> {
        let all: Vec<Arc<dyn TransformPlugin>> = vec![
            Arc::new(CompressionTransform::lz4()),
            Arc::new(CompressionTransform::zstd(3)),
            Arc::new(EncryptionTransform::aes_gcm()),
            Arc::new(EncryptionTransform::chacha20()),
        ];
        all.into_iter().map(|t| (t.id().to_string(), t)).collect()
    }

    fn ctx_for(data: &[u8]) -> TransformContext {
        TransformContext {
            content_hash: blake3_hash(data),
            key: Some(KeyRecord {
                key_id: "k1".into(),
                generation: 1,
                material: KeyMaterial([0x42u8; 32]),
                created_at: chrono::Utc::now(),
            }),
        }
    }

    #[tokio::test]
    async fn roundtrip_durable_chain() {
        let reg = registry();
        let lookup = |id: &str| reg.get(id).cloned();
        let data = Bytes::from(b"Hello Blobhouse!".repeat(10_000));
        let chain: TransformChain = [
            TransformRecord::new(ZSTD_ID).with_arg(ARG_LEVEL, "3"),
            TransformRecord::new(AES_GCM_ID),
        ]
        .into_iter()
        .collect();
        let ctx = ctx_for(&data);
        let (encoded, stats) = apply_chain(&chain, data.clone(), &ctx, lookup).await.unwrap();
        assert_eq!(stats.steps, 2);
        assert!(stats.ratio() > 1.0);
        let (decoded, _) = reverse_chain(&chain, encoded, &ctx, lookup).await.unwrap();
        assert_eq!(decoded, data);
    }

    #[tokio::test]
    async fn empty_chain_is_identity() {
        let data = Bytes::from_static(b"verbatim");
        let (out, stats) = apply_chain(
            &TransformChain::new(),
            data.clone(),
            &TransformContext::unkeyed(blake3_hash(&data)),
            |_: &str| None,
        )
        .await
        .unwrap();
        assert_eq!(out, data);
        assert_eq!(stats.steps, 0);
        assert_eq!(stats.ratio(), 1.0);
    }

    #[tokio::test]
    async fn unknown_transform_fails_before_running_anything() {
        let reg = registry();
        let chain: TransformChain = [TransformRecord::new(LZ4_ID), TransformRecord::new("rot13")]
            .into_iter()
            .collect();
        let err = reverse_chain(
            &chain,
            Bytes::from_static(b"garbage"),
            &TransformContext::unkeyed(blake3_hash(b"x")),
            |id: &str| reg.get(id).cloned(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, VaultError::TransformUnavailable(ref id) if id == "rot13"));
    }

    #[tokio::test]
    async fn double_encryption_chain_hides_plaintext() {
        let reg = registry();
        let lookup = |id: &str| reg.get(id).cloned();
        let secret = Bytes::from_static(b"TOP SECRET: launch codes 0000");
        let chain: TransformChain = [TransformRecord::new(AES_GCM_ID), TransformRecord::new(AES_GCM_ID)]
            .into_iter()
            .collect();
        let ctx = ctx_for(&secret);
        let (encoded, _) = apply_chain(&chain, secret.clone(), &ctx, lookup).await.unwrap();
        assert!(!encoded.windows(8).any(|w| secret.windows(8).any(|s| s == w)));
        let (decoded, _) = reverse_chain(&chain, encoded, &ctx, lookup).await.unwrap();
        assert_eq!(decoded, secret);
    }

    #[tokio::test]
    async fn zstd_levels_under_one_key_do_not_share_keystream() {
        let reg: HashMap<String, Arc<dyn TransformPlugin>> = [
            (ZSTD_ID.to_string(), Arc::new(CompressionTransform::zstd(3)) as Arc<dyn TransformPlugin>),
            (AES_GCM_ID.to_string(), Arc::new(EncryptionTransform::aes_gcm())),
        ]
        .into_iter()
        .collect();
        let lookup = |id: &str| reg.get(id).cloned();
        let data: Bytes = (0..20_000u32)
            .flat_map(|i| format!("row {i} value {}\n", i % 97).into_bytes())
            .collect::<Vec<u8>>()
            .into();
        let ctx = ctx_for(&data);
        let level = |n: &str| TransformRecord::new(ZSTD_ID).with_arg(ARG_LEVEL, n);

        let mut sealed = Vec::new();
        let mut compressed = Vec::new();
        for n in ["1", "19"] {
            let only_zstd: TransformChain = [level(n)].into_iter().collect();
            let (pt, _) = apply_chain(&only_zstd, data.clone(), &ctx, lookup).await.unwrap();
            compressed.push(pt);
            let full: TransformChain = [level(n), TransformRecord::new(AES_GCM_ID)].into_iter().collect();
            let (ct, _) = apply_chain(&full, data.clone(), &ctx, lookup).await.unwrap();
            let (back, _) = reverse_chain(&full, ct.clone(), &ctx, lookup).await.unwrap();
            assert_eq!(back, data);
            sealed.push(ct);
        }

        assert_ne!(sealed[0][..12], sealed[1][..12]);
        let n = compressed[0].len().min(compressed[1].len());
        let pt_xor: Vec<u8> = compressed[0][..n].iter().zip(&compressed[1][..n]).map(|(a, b)| a ^ b).collect();
        let ct_xor: Vec<u8> = sealed[0][12..12 + n].iter().zip(&sealed[1][12..12 + n]).map(|(a, b)| a ^ b).collect();
        assert_ne!(ct_xor, pt_xor);
    }

    fn chain_strategy() -> impl Strategy<Value = Vec<&'static str>> {
        prop::collection::vec(
            prop::sample::select(vec![LZ4_ID, ZSTD_ID, AES_GCM_ID, CHACHA_ID]),
            0..4,
        )
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(48))]
        #[test]
        fn prop_any_chain_roundtrips(
            ids in chain_strategy(),
            data in prop::collection::vec(0u8..=255, 0..150_000),
        ) {
            let rt = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
            let reg = registry();
            let chain: TransformChain = ids.iter().map(|id| TransformRecord::new(*id)).collect();
            let data = Bytes::from(data);
            let ctx = ctx_for(&data);
            let decoded = rt.block_on(async {
                let lookup = |id: &str| reg.get(id).cloned();
                let (encoded, _) = apply_chain(&chain, data.clone(), &ctx, lookup).await.unwrap();
                reverse_chain(&chain, encoded, &ctx, lookup).await.unwrap().0
            });
            prop_assert_eq!(decoded, data);
        }
    }
}
