//! LZ4 and Zstd compression exposed as reversible transform plugins

use crate::error::ReduceError;
use crate::offload::run_cpu_bound;
use async_trait::async_trait;
use blobhouse_core::{
    Plugin, PluginCategory, PluginDescriptor, TransformArgs, TransformContext, TransformPlugin,
    TransformRole, VaultResult,
};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};

/// Transform id of the LZ4 frame codec.
pub const LZ4_ID: &str = "lz4";
/// Transform id of the Zstandard codec.
pub const ZSTD_ID: &str = "zstd";
/// Argument carrying the Zstd level.
pub const ARG_LEVEL: &str = "level";
/// Level used when no argument is recorded.
pub const DEFAULT_ZSTD_LEVEL: i32 = 3;
/// Decompressed size cap used when none is configured.
pub const DEFAULT_OUTPUT_LIMIT: u64 = 1 << 30;

/// Compression algorithm selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum CompressionAlgorithm {
    /// LZ4 frame format; fast, used for cache-tier objects
    #[default]
    Lz4,
    /// Zstandard; higher ratio, used for durable and archival objects
    Zstd {
        /// Compression level (1=fastest, 19=best ratio, 3=balanced default)
        level: i32,
    },
}

/// Compress data with the given algorithm. Returns compressed bytes.
pub fn compress(data: &[u8], algo: CompressionAlgorithm) -> Result<Vec<u8>, ReduceError> {
    match algo {
        CompressionAlgorithm::Lz4 => {
            let mut encoder = lz4_flex::frame::FrameEncoder::new(Vec::with_capacity(data.len() / 2));
            encoder
                .write_all(data)
                .map_err(|e| ReduceError::CompressionFailed(e.to_string()))?;
            encoder
                .finish()
                .map_err(|e| ReduceError::CompressionFailed(e.to_string()))
        }
        CompressionAlgorithm::Zstd { level } => {
            zstd::encode_all(data, level).map_err(|e| ReduceError::CompressionFailed(e.to_string()))
        }
    }
}

fn read_capped(reader: impl Read, limit: u64) -> Result<Vec<u8>, ReduceError> {
    let mut out = Vec::new();
    reader
        .take(limit.saturating_add(1))
        .read_to_end(&mut out)
        .map_err(|e| ReduceError::DecompressionFailed(e.to_string()))?;
    if out.len() as u64 > limit {
        return Err(ReduceError::DecompressionFailed(format!(
            "output exceeds limit of {limit} bytes"
        )));
    }
    Ok(out)
}

/// Decompress data using the algorithm that was used for compression.
///
/// Stops with `DecompressionFailed` once the output would grow past `limit` bytes.
pub fn decompress(data: &[u8], algo: CompressionAlgorithm, limit: u64) -> Result<Vec<u8>, ReduceError> {
    match algo {
        CompressionAlgorithm::Lz4 => read_capped(lz4_flex::frame::FrameDecoder::new(data), limit),
        CompressionAlgorithm::Zstd { .. } => {
            let decoder = zstd::stream::read::Decoder::new(data)
                .map_err(|e| ReduceError::DecompressionFailed(e.to_string()))?;
            read_capped(decoder, limit)
        }
    }
}

/// Check whether compressing data is worthwhile.
/// Returns false if data appears to be already compressed or random (high entropy).
pub fn is_compressible(data: &[u8]) -> bool {
    if data.len() < 64 {
        return true;
    }
    let sample = &data[..data.len().min(1024)];
    let compressed = lz4_flex::compress_prepend_size(sample);
    (compressed.len() as f64) < (sample.len() as f64 * 0.95)
}

/// A compression codec registered as a transform plugin.
pub struct CompressionTransform {
    descriptor: PluginDescriptor,
    default_level: i32,
    lz4: bool,
    output_limit: u64,
}

impl CompressionTransform {
    /// LZ4 transform (`lz4`).
    pub fn lz4() -> Self {
        Self {
            descriptor: PluginDescriptor::new(LZ4_ID, "LZ4 frame", "1.0.0", PluginCategory::Transform)
                .with_tags([TransformRole::Compression.tag(), "fast"]),
            default_level: 0,
            lz4: true,
            output_limit: DEFAULT_OUTPUT_LIMIT,
        }
    }

    /// Zstandard transform (`zstd`) using `default_level` when the chain carries no level.
    pub fn zstd(default_level: i32) -> Self {
        Self {
            descriptor: PluginDescriptor::new(ZSTD_ID, "Zstandard", "1.0.0", PluginCategory::Transform)
                .with_tags([TransformRole::Compression.tag(), "ratio"]),
            default_level,
            lz4: false,
            output_limit: DEFAULT_OUTPUT_LIMIT,
        }
    }

    /// Refuse to decompress past `limit` bytes.
    pub fn with_output_limit(mut self, limit: u64) -> Self {
        self.output_limit = limit;
        self
    }

    fn algorithm(&self, args: &TransformArgs) -> Result<CompressionAlgorithm, ReduceError> {
        if self.lz4 {
            return Ok(CompressionAlgorithm::Lz4);
        }
        let level = match args.get(ARG_LEVEL) {
            Some(raw) => raw.parse::<i32>().map_err(|_| ReduceError::InvalidArgument {
                name: ARG_LEVEL.to_string(),
                value: raw.clone(),
            })?,
            None => self.default_level,
        };
        if !zstd::compression_level_range().contains(&level) {
            return Err(ReduceError::InvalidArgument {
                name: ARG_LEVEL.to_string(),
                value: level.to_string(),
            });
        }
        Ok(CompressionAlgorithm::Zstd { level })
    }
}

impl Plugin for CompressionTransform {
    fn descriptor(&self) -> &PluginDescriptor {
        &self.descriptor
    }
}

#[async_trait]
impl TransformPlugin for CompressionTransform {
    fn role(&self) -> TransformRole {
        TransformRole::Compression
    }

    fn default_args(&self) -> TransformArgs {
        let mut args = TransformArgs::new();
        if !self.lz4 {
            args.insert(ARG_LEVEL.to_string(), self.default_level.to_string());
        }
        args
    }

    async fn apply(
        &self,
        input: Bytes,
        args: &TransformArgs,
        _ctx: &TransformContext,
    ) -> VaultResult<Bytes> {
        let algo = self.algorithm(args).map_err(|e| e.into_vault(self.id()))?;
        run_cpu_bound(input.len(), move || compress(&input, algo))
            .await
            .map(Bytes::from)
            .map_err(|e| e.into_vault(self.id()))
    }

    async fn reverse(
        &self,
        input: Bytes,
        args: &TransformArgs,
        _ctx: &TransformContext,
    ) -> VaultResult<Bytes> {
        let algo = self.algorithm(args).map_err(|e| e.into_vault(self.id()))?;
        let limit = self.output_limit;
        run_cpu_bound(input.len(), move || decompress(&input, algo, limit))
            .await
            .map(Bytes::from)
            .map_err(|e| e.into_vault(self.id()))
    }
}
