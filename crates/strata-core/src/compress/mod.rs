use std::io::Read;

use serde::{Deserialize, Serialize};

use crate::error::{Result, StrataError};

pub const TAG_NONE: u8 = 0x00;
pub const TAG_LZ4: u8 = 0x01;
pub const TAG_ZSTD: u8 = 0x02;

/// Maximum decompressed output size. Guards against decompression bombs.
const MAX_DECOMPRESS_SIZE: u64 = 64 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum Compression {
    None,
    #[default]
    Lz4,
    Zstd {
        level: i32,
    },
}

impl Compression {
    /// Parse from config string like "lz4", "zstd", "none".
    pub fn from_config(algorithm: &str, zstd_level: i32) -> Result<Self> {
        match algorithm {
            "none" => Ok(Compression::None),
            "lz4" => Ok(Compression::Lz4),
            "zstd" => Ok(Compression::Zstd { level: zstd_level }),
            other => Err(StrataError::Config(format!(
                "unknown compression algorithm: {other}"
            ))),
        }
    }

    /// Compression header ID recorded in index entries and pack records.
    pub fn header_id(&self) -> u8 {
        match self {
            Compression::None => TAG_NONE,
            Compression::Lz4 => TAG_LZ4,
            Compression::Zstd { .. } => TAG_ZSTD,
        }
    }
}

/// Whether `tag` names a codec this build can decode.
pub fn is_known_tag(tag: u8) -> bool {
    matches!(tag, TAG_NONE | TAG_LZ4 | TAG_ZSTD)
}

/// Compress data and prepend a 1-byte tag identifying the codec.
pub fn compress(compression: Compression, data: &[u8]) -> Result<Vec<u8>> {
    let body = match compression {
        Compression::None => data.to_vec(),
        Compression::Lz4 => lz4_flex::compress_prepend_size(data),
        Compression::Zstd { level } => zstd::bulk::compress(data, level)
            .map_err(|e| StrataError::Other(format!("zstd compress: {e}")))?,
    };
    let mut out = Vec::with_capacity(1 + body.len());
    out.push(compression.header_id());
    out.extend_from_slice(&body);
    Ok(out)
}

/// Decompress data by reading the 1-byte tag prefix and dispatching.
pub fn decompress(data: &[u8]) -> Result<Vec<u8>> {
    let (&tag, payload) = data
        .split_first()
        .ok_or_else(|| StrataError::Decompression("empty data".into()))?;
    match tag {
        TAG_NONE => Ok(payload.to_vec()),
        TAG_LZ4 => {
            if payload.len() < 4 {
                return Err(StrataError::Decompression("lz4: payload too short".into()));
            }
            let size = u32::from_le_bytes([payload[0], payload[1], payload[2], payload[3]]) as u64;
            if size > MAX_DECOMPRESS_SIZE {
                return Err(StrataError::Decompression(format!(
                    "lz4: decompressed size ({size}) exceeds limit of {MAX_DECOMPRESS_SIZE} bytes"
                )));
            }
            lz4_flex::decompress_size_prepended(payload)
                .map_err(|e| StrataError::Decompression(format!("lz4: {e}")))
        }
        TAG_ZSTD => {
            let mut decoder = zstd::stream::Decoder::new(std::io::Cursor::new(payload))
                .map_err(|e| StrataError::Decompression(format!("zstd init: {e}")))?;
            let mut output = Vec::new();
            decoder
                .by_ref()
                .take(MAX_DECOMPRESS_SIZE + 1)
                .read_to_end(&mut output)
                .map_err(|e| StrataError::Decompression(format!("zstd: {e}")))?;
            if output.len() as u64 > MAX_DECOMPRESS_SIZE {
                return Err(StrataError::Decompression(format!(
                    "zstd: decompressed size exceeds limit of {MAX_DECOMPRESS_SIZE} bytes"
                )));
            }
            Ok(output)
        }
        _ => Err(StrataError::UnknownCompressionTag(tag)),
    }
}
