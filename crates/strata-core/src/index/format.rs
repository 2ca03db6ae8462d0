//! Index blob encoding.
//!
//! Inner layout (before the object envelope):
//! `STRAIDX\0 | version u8 | body | BLAKE2b-256 of everything before`.
//!
//! V0 body is fixed-width big-endian records with a pack blob ID string
//! table; V1 body is a msgpack list of [`ContentInfo`]. Both are sorted by
//! content ID.

use std::collections::BTreeMap;

use blake2::digest::consts::U32;
use blake2::{Blake2b, Digest};

use super::{ContentInfo, IndexVersion};
use crate::crypto::CryptoEngine;
use crate::envelope::{pack_object, unpack_object, ObjectType};
use crate::error::{Result, StrataError};
use strata_types::{BlobId, ContentId};

const INDEX_MAGIC: &[u8; 8] = b"STRAIDX\0";
const CHECKSUM_LEN: usize = 32;
const ENVELOPE_CONTEXT: &[u8] = b"index";

/// content id, blob index, offset, packed len, original len, compression,
/// key id, flags, timestamp, format version
const V0_RECORD_SIZE: usize = 33 + 4 + 8 + 4 + 4 + 1 + 4 + 1 + 8 + 1;
const V0_FLAG_DELETED: u8 = 0x01;

/// Encode and encrypt a batch of entries.
pub fn encode_index_blob(
    entries: &[ContentInfo],
    version: IndexVersion,
    crypto: &dyn CryptoEngine,
) -> Result<Vec<u8>> {
    let mut sorted: Vec<&ContentInfo> = entries.iter().collect();
    sorted.sort_by(|a, b| {
        a.content_id
            .cmp(&b.content_id)
            .then_with(|| a.timestamp.cmp(&b.timestamp))
    });

    let mut inner = Vec::with_capacity(16 + entries.len() * V0_RECORD_SIZE);
    inner.extend_from_slice(INDEX_MAGIC);
    inner.push(version as u8);
    match version {
        IndexVersion::V0 => encode_v0_body(&sorted, &mut inner)?,
        IndexVersion::V1 => rmp_serde::encode::write(&mut inner, &sorted)?,
    }
    let checksum = Blake2b::<U32>::digest(&inner);
    inner.extend_from_slice(&checksum);

    pack_object(ObjectType::IndexBlob, ENVELOPE_CONTEXT, &inner, crypto)
}

/// Decrypt and decode an index blob.
///
/// Any truncation, corruption or checksum mismatch surfaces as
/// `StrataError::IndexDecode`; callers rebuild from packs in that case.
pub fn decode_index_blob(data: &[u8], crypto: &dyn CryptoEngine) -> Result<Vec<ContentInfo>> {
    let (_, entries) = decode_index_blob_versioned(data, crypto)?;
    Ok(entries)
}

/// Like [`decode_index_blob`] but also reports the encoding version.
pub fn decode_index_blob_versioned(
    data: &[u8],
    crypto: &dyn CryptoEngine,
) -> Result<(IndexVersion, Vec<ContentInfo>)> {
    let inner = unpack_object(data, ObjectType::IndexBlob, ENVELOPE_CONTEXT, crypto)
        .map_err(|e| StrataError::IndexDecode(format!("envelope: {e}")))?;
    if inner.len() < INDEX_MAGIC.len() + 1 + CHECKSUM_LEN {
        return Err(StrataError::IndexDecode("truncated index blob".into()));
    }
    let (payload, checksum) = inner.split_at(inner.len() - CHECKSUM_LEN);
    if Blake2b::<U32>::digest(payload).as_slice() != checksum {
        return Err(StrataError::IndexDecode("checksum mismatch".into()));
    }
    if &payload[..INDEX_MAGIC.len()] != INDEX_MAGIC {
        return Err(StrataError::IndexDecode("bad magic".into()));
    }
    let version = IndexVersion::try_from(payload[INDEX_MAGIC.len()])
        .map_err(|e| StrataError::IndexDecode(e.to_string()))?;
    let body = &payload[INDEX_MAGIC.len() + 1..];
    let entries = match version {
        IndexVersion::V0 => decode_v0_body(body)?,
        IndexVersion::V1 => rmp_serde::from_slice(body)
            .map_err(|e| StrataError::IndexDecode(format!("v1 body: {e}")))?,
    };
    Ok((version, entries))
}

fn encode_v0_body(entries: &[&ContentInfo], out: &mut Vec<u8>) -> Result<()> {
    let mut table: BTreeMap<&str, u32> = BTreeMap::new();
    for e in entries {
        let next = table.len() as u32;
        table.entry(e.pack_blob_id.as_str()).or_insert(next);
    }
    let mut names: Vec<(&str, u32)> = table.iter().map(|(k, v)| (*k, *v)).collect();
    names.sort_by_key(|(_, idx)| *idx);

    out.extend_from_slice(&(names.len() as u32).to_be_bytes());
    for (name, _) in &names {
        let len = u16::try_from(name.len()).map_err(|_| {
            StrataError::InvalidBlobId(format!("pack blob id too long for v0 index: {name}"))
        })?;
        out.extend_from_slice(&len.to_be_bytes());
        out.extend_from_slice(name.as_bytes());
    }

    out.extend_from_slice(&(entries.len() as u32).to_be_bytes());
    for e in entries {
        out.extend_from_slice(&e.content_id.to_bytes());
        out.extend_from_slice(&table[e.pack_blob_id.as_str()].to_be_bytes());
        out.extend_from_slice(&e.packed_offset.to_be_bytes());
        out.extend_from_slice(&e.packed_length.to_be_bytes());
        out.extend_from_slice(&e.original_length.to_be_bytes());
        out.push(e.compression_header_id);
        out.extend_from_slice(&e.encryption_key_id.to_be_bytes());
        out.push(if e.deleted { V0_FLAG_DELETED } else { 0 });
        out.extend_from_slice(&e.timestamp.to_be_bytes());
        out.push(e.format_version);
    }
    Ok(())
}

/// Bounds-checked big-endian reader over a V0 body.
struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|end| *end <= self.buf.len())
            .ok_or_else(|| StrataError::IndexDecode(format!("truncated at byte {}", self.pos)))?;
        let slice = &self.buf[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16> {
        Ok(u16::from_be_bytes(self.array()?))
    }

    fn u32(&mut self) -> Result<u32> {
        Ok(u32::from_be_bytes(self.array()?))
    }

    fn u64(&mut self) -> Result<u64> {
        Ok(u64::from_be_bytes(self.array()?))
    }

    fn i64(&mut self) -> Result<i64> {
        Ok(i64::from_be_bytes(self.array()?))
    }
}

fn decode_v0_body(body: &[u8]) -> Result<Vec<ContentInfo>> {
    let mut r = Reader { buf: body, pos: 0 };

    let name_count = r.u32()? as usize;
    let mut names = Vec::with_capacity(name_count.min(body.len()));
    for _ in 0..name_count {
        let len = r.u16()? as usize;
        let raw = r.take(len)?;
        let name = std::str::from_utf8(raw)
            .map_err(|_| StrataError::IndexDecode("non-utf8 pack blob id".into()))?;
        names.push(BlobId::new(name));
    }

    let count = r.u32()? as usize;
    if count.saturating_mul(V0_RECORD_SIZE) > body.len() - r.pos {
        return Err(StrataError::IndexDecode(format!(
            "entry count {count} exceeds body size"
        )));
    }
    let mut entries = Vec::with_capacity(count);
    for _ in 0..count {
        let content_id = ContentId::from_bytes(r.take(33)?)
            .map_err(|e| StrataError::IndexDecode(e.to_string()))?;
        let name_idx = r.u32()? as usize;
        let pack_blob_id = names
            .get(name_idx)
            .cloned()
            .ok_or_else(|| StrataError::IndexDecode(format!("bad blob index {name_idx}")))?;
        let packed_offset = r.u64()?;
        let packed_length = r.u32()?;
        let original_length = r.u32()?;
        let compression_header_id = r.u8()?;
        let encryption_key_id = r.u32()?;
        let flags = r.u8()?;
        let timestamp = r.i64()?;
        let format_version = r.u8()?;
        entries.push(ContentInfo {
            content_id,
            pack_blob_id,
            packed_offset,
            packed_length,
            original_length,
            compression_header_id,
            encryption_key_id,
            deleted: flags & V0_FLAG_DELETED != 0,
            timestamp,
            format_version,
        });
    }
    if r.pos != body.len() {
        return Err(StrataError::IndexDecode("trailing bytes after entries".into()));
    }
    Ok(entries)
}
