use std::time::Instant;

use blake2::digest::consts::U32;
use blake2::{Blake2b, Digest};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::compress::{self, Compression};
use crate::crypto::CryptoEngine;
use crate::envelope::{pack_object, unpack_object, ObjectType};
use crate::error::{Result, StrataError};
use crate::storage::{read_exact_range, BlobStorage};
use strata_types::{BlobId, ContentId};

/// Magic bytes at the start of every pack blob.
pub const PACK_MAGIC: &[u8; 8] = b"STRAPACK";
pub const PACK_VERSION: u8 = 1;
/// Size of the pack preamble (magic + version byte).
pub const PACK_PREAMBLE_SIZE: usize = 9;
/// `[u32 stored_len][33B content id][u32 original_len][u8 compression]`
pub const RECORD_HEADER_SIZE: usize = 4 + 33 + 4 + 1;

/// Maximum number of records in a single pack.
pub const MAX_RECORDS_PER_PACK: usize = 10_000;

/// Maximum age of an open pack before it should be flushed (in seconds).
pub const PACK_MAX_AGE_SECS: u64 = 300;

/// Pack blob families. Prefixed (metadata) contents get their own packs so
/// they can be listed and cached separately from bulk data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PackType {
    Data,
    Metadata,
}

impl PackType {
    pub fn for_content(id: &ContentId) -> Self {
        if id.has_prefix() {
            PackType::Metadata
        } else {
            PackType::Data
        }
    }

    pub fn blob_prefix(&self) -> &'static str {
        match self {
            PackType::Data => "p",
            PackType::Metadata => "q",
        }
    }
}

/// Every prefix a pack blob can live under.
pub const PACK_BLOB_PREFIXES: [&str; 2] = ["p", "q"];

/// One entry in the pack's trailing header.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackEntry {
    pub content_id: ContentId,
    /// Offset of the payload (past the record header).
    pub offset: u64,
    pub stored_length: u32,
    pub original_length: u32,
    pub compression: u8,
}

/// Where an appended record will live once its pack is sealed. The offset
/// is final; only the pack blob ID is unknown until `flush`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingLocation {
    pub offset: u64,
    pub length: u32,
}

/// A pack that has been written to the store.
#[derive(Debug, Clone)]
pub struct SealedPack {
    pub blob_id: BlobId,
    pub length: u64,
    pub entries: Vec<PackEntry>,
}

/// Accumulates content records and writes them out as one pack blob.
pub struct PackWriter {
    pack_type: PackType,
    target_size: usize,
    /// Preamble plus every record appended so far.
    buffer: Vec<u8>,
    entries: Vec<PackEntry>,
    first_append: Option<Instant>,
}

impl PackWriter {
    pub fn new(pack_type: PackType, target_size: usize) -> Self {
        Self {
            pack_type,
            target_size,
            buffer: Vec::new(),
            entries: Vec::new(),
            first_append: None,
        }
    }

    pub fn pack_type(&self) -> PackType {
        self.pack_type
    }

    /// Buffer one record and return where its payload will be.
    pub fn append(
        &mut self,
        content_id: ContentId,
        payload: &[u8],
        original_length: u32,
        compression: u8,
    ) -> PendingLocation {
        if self.buffer.is_empty() {
            self.buffer.extend_from_slice(PACK_MAGIC);
            self.buffer.push(PACK_VERSION);
        }
        let stored_length = payload.len() as u32;
        self.buffer.extend_from_slice(&stored_length.to_le_bytes());
        self.buffer.extend_from_slice(&content_id.to_bytes());
        self.buffer.extend_from_slice(&original_length.to_le_bytes());
        self.buffer.push(compression);
        let offset = self.buffer.len() as u64;
        self.buffer.extend_from_slice(payload);

        self.entries.push(PackEntry {
            content_id,
            offset,
            stored_length,
            original_length,
            compression,
        });
        if self.first_append.is_none() {
            self.first_append = Some(Instant::now());
        }
        PendingLocation {
            offset,
            length: stored_length,
        }
    }

    /// Read back a payload that has not been flushed yet.
    pub fn read_pending(&self, location: PendingLocation) -> Option<&[u8]> {
        let start = location.offset as usize;
        let end = start.checked_add(location.length as usize)?;
        self.buffer.get(start..end)
    }

    pub fn has_pending(&self) -> bool {
        !self.entries.is_empty()
    }

    pub fn record_count(&self) -> usize {
        self.entries.len()
    }

    pub fn buffered_bytes(&self) -> usize {
        self.buffer.len()
    }

    /// Whether the buffer has reached its size, record-count or age limit.
    pub fn should_flush(&self) -> bool {
        if self.entries.is_empty() {
            return false;
        }
        if self.buffer.len() >= self.target_size || self.entries.len() >= MAX_RECORDS_PER_PACK {
            return true;
        }
        self.first_append
            .is_some_and(|t| t.elapsed().as_secs() >= PACK_MAX_AGE_SECS)
    }

    /// Serialize the buffered records plus encrypted trailer, without
    /// touching writer state.
    fn seal(&self, crypto: &dyn CryptoEngine) -> Result<(BlobId, Vec<u8>)> {
        let header_bytes = rmp_serde::to_vec(&self.entries)?;
        let encrypted_header = pack_object(ObjectType::PackHeader, b"", &header_bytes, crypto)?;

        let mut bytes = Vec::with_capacity(self.buffer.len() + encrypted_header.len() + 4);
        bytes.extend_from_slice(&self.buffer);
        bytes.extend_from_slice(&encrypted_header);
        bytes.extend_from_slice(&(encrypted_header.len() as u32).to_le_bytes());

        let blob_id = pack_blob_id(self.pack_type, &bytes);
        Ok((blob_id, bytes))
    }

    /// Write the buffered records as one pack blob.
    ///
    /// The buffer is only cleared once the store has acknowledged the write;
    /// on failure nothing changes and the caller may retry.
    pub fn flush(
        &mut self,
        storage: &dyn BlobStorage,
        crypto: &dyn CryptoEngine,
    ) -> Result<Option<SealedPack>> {
        if self.entries.is_empty() {
            return Ok(None);
        }
        let (blob_id, bytes) = self.seal(crypto)?;
        storage.put(blob_id.as_str(), &bytes)?;
        debug!(
            pack = %blob_id,
            records = self.entries.len(),
            bytes = bytes.len(),
            "wrote pack blob"
        );

        let entries = std::mem::take(&mut self.entries);
        self.buffer.clear();
        self.first_append = None;
        Ok(Some(SealedPack {
            blob_id,
            length: bytes.len() as u64,
            entries,
        }))
    }
}

/// Pack blob ID: type prefix followed by the hex BLAKE2b-256 of the blob.
pub fn pack_blob_id(pack_type: PackType, bytes: &[u8]) -> BlobId {
    let digest = Blake2b::<U32>::digest(bytes);
    BlobId::new(format!("{}{}", pack_type.blob_prefix(), hex::encode(digest)))
}

/// Compress and encrypt a content payload for storage in a pack.
pub fn encode_content_payload(
    content_id: &ContentId,
    data: &[u8],
    compression: Compression,
    crypto: &dyn CryptoEngine,
) -> Result<Vec<u8>> {
    let compressed = compress::compress(compression, data)?;
    pack_object(
        ObjectType::ContentData,
        &content_id.to_bytes(),
        &compressed,
        crypto,
    )
}

/// Decrypt and decompress a stored payload, verifying it hashes back to
/// `content_id`.
pub fn decode_content_payload(
    content_id: &ContentId,
    payload: &[u8],
    crypto: &dyn CryptoEngine,
) -> Result<Vec<u8>> {
    let compressed = unpack_object(
        payload,
        ObjectType::ContentData,
        &content_id.to_bytes(),
        crypto,
    )?;
    let data = compress::decompress(&compressed)?;
    let actual = crypto.content_id(content_id.prefix(), &data)?;
    if actual != *content_id {
        return Err(StrataError::InvalidFormat(format!(
            "content hash mismatch: expected {content_id}, got {actual}"
        )));
    }
    Ok(data)
}

/// Read a single payload from a pack with a ranged read.
pub fn read_content_range(
    storage: &dyn BlobStorage,
    blob_id: &BlobId,
    offset: u64,
    length: u32,
) -> Result<Vec<u8>> {
    read_exact_range(storage, blob_id.as_str(), offset, length as u64)
}

/// Read and decrypt the trailing header of a pack using ranged reads only.
pub fn read_pack_header(
    storage: &dyn BlobStorage,
    blob_id: &BlobId,
    blob_length: u64,
    crypto: &dyn CryptoEngine,
) -> Result<Vec<PackEntry>> {
    let id = blob_id.as_str();
    if blob_length < (PACK_PREAMBLE_SIZE + 4) as u64 {
        return Err(StrataError::InvalidFormat(format!("pack {id} too small")));
    }
    let preamble = read_exact_range(storage, id, 0, PACK_PREAMBLE_SIZE as u64)?;
    check_preamble(id, &preamble)?;

    let len_bytes = read_exact_range(storage, id, blob_length - 4, 4)?;
    let header_len = u32::from_le_bytes([len_bytes[0], len_bytes[1], len_bytes[2], len_bytes[3]]) as u64;
    if header_len + 4 > blob_length - PACK_PREAMBLE_SIZE as u64 {
        return Err(StrataError::InvalidFormat(format!(
            "pack {id}: invalid header length {header_len}"
        )));
    }
    let encrypted = read_exact_range(storage, id, blob_length - 4 - header_len, header_len)?;
    let header_bytes = unpack_object(&encrypted, ObjectType::PackHeader, b"", crypto)?;
    let entries: Vec<PackEntry> = rmp_serde::from_slice(&header_bytes)?;

    let records_end = blob_length - 4 - header_len;
    if let Some(bad) = entries
        .iter()
        .find(|e| e.offset + e.stored_length as u64 > records_end)
    {
        return Err(StrataError::InvalidFormat(format!(
            "pack {id}: entry {} points past the record area",
            bad.content_id
        )));
    }
    Ok(entries)
}

fn check_preamble(id: &str, preamble: &[u8]) -> Result<()> {
    if &preamble[..8] != PACK_MAGIC {
        return Err(StrataError::InvalidFormat(format!("pack {id}: invalid magic")));
    }
    if preamble[8] != PACK_VERSION {
        return Err(StrataError::UnsupportedVersion(preamble[8] as u32));
    }
    Ok(())
}

/// Outcome of a forward record scan.
#[derive(Debug, Clone, Default)]
pub struct PackScan {
    pub entries: Vec<PackEntry>,
    /// Bytes past the last record that could be read and verified.
    pub unrecoverable_bytes: u64,
}

/// Walk a pack's records front to back, verifying each payload.
///
/// Stops at the first record that cannot be read, parsed or verified and
/// reports everything after it as unrecoverable. Only a missing or
/// unreadable preamble is an error.
pub fn scan_pack_records(
    storage: &dyn BlobStorage,
    blob_id: &BlobId,
    blob_length: u64,
    crypto: &dyn CryptoEngine,
) -> Result<PackScan> {
    let id = blob_id.as_str();
    if blob_length < PACK_PREAMBLE_SIZE as u64 {
        return Err(StrataError::InvalidFormat(format!("pack {id} too small")));
    }
    let preamble = read_exact_range(storage, id, 0, PACK_PREAMBLE_SIZE as u64)?;
    check_preamble(id, &preamble)?;

    let mut pos = PACK_PREAMBLE_SIZE as u64;
    let mut entries = Vec::new();
    while pos + RECORD_HEADER_SIZE as u64 <= blob_length {
        match scan_one_record(storage, id, pos, blob_length, crypto) {
            Ok(entry) => {
                pos = entry.offset + entry.stored_length as u64;
                entries.push(entry);
            }
            Err(e) => {
                debug!(pack = id, offset = pos, "record scan stopped: {e}");
                break;
            }
        }
    }

    let unrecoverable_bytes = blob_length - pos;
    if unrecoverable_bytes > 0 && !entries.is_empty() {
        warn!(
            pack = id,
            recovered = entries.len(),
            unrecoverable_bytes,
            "pack scan recovered a partial prefix"
        );
    }
    Ok(PackScan {
        entries,
        unrecoverable_bytes,
    })
}

fn scan_one_record(
    storage: &dyn BlobStorage,
    id: &str,
    pos: u64,
    blob_length: u64,
    crypto: &dyn CryptoEngine,
) -> Result<PackEntry> {
    let header = read_exact_range(storage, id, pos, RECORD_HEADER_SIZE as u64)?;
    let stored_length = u32::from_le_bytes([header[0], header[1], header[2], header[3]]);
    let content_id = ContentId::from_bytes(&header[4..37])?;
    let original_length = u32::from_le_bytes([header[37], header[38], header[39], header[40]]);
    let compression = header[41];
    if !compress::is_known_tag(compression) {
        return Err(StrataError::UnknownCompressionTag(compression));
    }
    let offset = pos + RECORD_HEADER_SIZE as u64;
    if stored_length == 0 || offset + stored_length as u64 > blob_length {
        return Err(StrataError::InvalidFormat(format!(
            "record at {pos} overruns the blob"
        )));
    }
    let payload = read_exact_range(storage, id, offset, stored_length as u64)?;
    let data = decode_content_payload(&content_id, &payload, crypto)?;
    if data.len() != original_length as usize {
        return Err(StrataError::InvalidFormat(format!(
            "record at {pos}: length mismatch"
        )));
    }
    Ok(PackEntry {
        content_id,
        offset,
        stored_length,
        original_length,
        compression,
    })
}
