use std::sync::Arc;

use byteorder::{BigEndian, ByteOrder};
use tracing::debug;

use super::error::IndexError;
use crate::bitfield::Bitfield;
use crate::store::{KvStore, StoreError};

/// Default number of bits per persisted chunk (1 KiB of bitmap per key).
pub const DEFAULT_CHUNK_BITS: u64 = 8192;

/// Store keys reserved for one sieve.
///
/// Chunk keys carry the chunk index as 16 lowercase hex digits so lexical key order matches
/// numeric chunk order. The head key lies outside the chunk prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SieveKeys {
    chunk_prefix: String,
    head_key: String,
}

impl SieveKeys {
    pub fn new(prefix: &str) -> Self {
        Self {
            chunk_prefix: format!("{prefix}sieve!chunk!"),
            head_key: format!("{prefix}sieve!head"),
        }
    }

    pub fn chunk_prefix(&self) -> &str {
        &self.chunk_prefix
    }

    pub fn head_key(&self) -> &str {
        &self.head_key
    }

    pub fn chunk_key(&self, chunk: u64) -> String {
        format!("{}{chunk:016x}", self.chunk_prefix)
    }

    pub fn parse_chunk_key(&self, key: &str) -> Option<u64> {
        let hex = key.strip_prefix(&self.chunk_prefix)?;
        if hex.len() != 16 {
            return None;
        }
        u64::from_str_radix(hex, 16).ok()
    }
}

/// Validates a configured chunk size: a power of two, and at least one byte.
pub fn validate_chunk_bits(chunk_bits: u64) -> Result<(), String> {
    if chunk_bits < 8 || !chunk_bits.is_power_of_two() {
        return Err(format!(
            "chunk_bits must be a power of two >= 8, got {chunk_bits}"
        ));
    }
    Ok(())
}

pub fn encode_head(head: u64) -> Vec<u8> {
    let mut buf = vec![0u8; 8];
    BigEndian::write_u64(&mut buf, head);
    buf
}

pub fn decode_head(raw: &[u8]) -> Result<u64, StoreError> {
    if raw.len() != 8 {
        return Err(StoreError::Corrupt(format!(
            "sieve head must be 8 bytes, found {}",
            raw.len()
        )));
    }
    Ok(BigEndian::read_u64(raw))
}

/// Delivered-block bitmap mirrored into the store chunk by chunk.
///
/// Owned exclusively by the processing queue worker once the index is running.
pub struct Sieve {
    bits: Bitfield,
    head: u64,
    /// Head value most recently written to the store.
    persisted_head: u64,
    chunk_bits: u64,
    keys: SieveKeys,
    store: Arc<dyn KvStore>,
}

impl Sieve {
    /// Rebuilds the sieve from every persisted chunk plus the head key.
    pub async fn load(
        store: Arc<dyn KvStore>,
        keys: SieveKeys,
        chunk_bits: u64,
    ) -> Result<Self, IndexError> {
        let chunk_bytes = (chunk_bits / 8) as usize;
        let rows = store
            .scan_prefix(keys.chunk_prefix())
            .await
            .map_err(IndexError::StoreRead)?;

        let mut bits = Bitfield::new();
        let chunk_count = rows.len();
        for (key, value) in rows {
            let chunk = keys.parse_chunk_key(&key).ok_or_else(|| {
                IndexError::StoreRead(StoreError::Corrupt(format!(
                    "unrecognised sieve chunk key {key:?}"
                )))
            })?;
            if value.len() != chunk_bytes {
                return Err(IndexError::StoreRead(StoreError::Corrupt(format!(
                    "sieve chunk {chunk} holds {} bytes, expected {chunk_bytes}",
                    value.len()
                ))));
            }
            let offset = usize::try_from(chunk)
                .ok()
                .and_then(|chunk| chunk.checked_mul(chunk_bytes))
                .ok_or_else(|| {
                    IndexError::StoreRead(StoreError::Corrupt(format!(
                        "sieve chunk index {chunk} is out of range"
                    )))
                })?;
            bits.merge_bytes_at(offset, &value);
        }

        let head = match store
            .get(keys.head_key())
            .await
            .map_err(IndexError::StoreRead)?
        {
            Some(raw) => decode_head(&raw).map_err(IndexError::StoreRead)?,
            None => 0,
        };

        debug!(
            event = "sieve_loaded",
            chunks = chunk_count,
            delivered = bits.count_ones(),
            head,
            "loaded sieve"
        );

        Ok(Self {
            bits,
            head,
            persisted_head: head,
            chunk_bits,
            keys,
            store,
        })
    }

    pub fn bits(&self) -> &Bitfield {
        &self.bits
    }

    pub fn head(&self) -> u64 {
        self.head
    }

    pub fn get(&self, block: u64) -> bool {
        self.bits.get(block)
    }

    /// Marks `block` delivered in memory. Returns `true` if it was not already marked.
    pub fn set(&mut self, block: u64) -> bool {
        self.bits.set(block)
    }

    /// Moves the head offset forward. The head never moves back.
    pub fn advance_head(&mut self, head: u64) {
        self.head = self.head.max(head);
    }

    pub fn head_is_dirty(&self) -> bool {
        self.head != self.persisted_head
    }

    /// Writes the chunk holding `block`, then the head offset.
    ///
    /// The two writes are independent; a crash between them leaves the head stale, which is
    /// harmless because catch-up trusts only the chunks.
    pub async fn persist(&mut self, block: u64) -> Result<(), IndexError> {
        let chunk = block / self.chunk_bits;
        let chunk_bytes = (self.chunk_bits / 8) as usize;
        let payload = self
            .bits
            .slice_padded(chunk as usize * chunk_bytes, chunk_bytes);

        self.store
            .put(&self.keys.chunk_key(chunk), payload)
            .await
            .map_err(|source| IndexError::StorePersist { block, source })?;

        self.write_head()
            .await
            .map_err(|source| IndexError::StorePersist { block, source })
    }

    /// Writes only the head offset, if it moved since the last write.
    pub async fn persist_head(&mut self) -> Result<(), StoreError> {
        if !self.head_is_dirty() {
            return Ok(());
        }
        self.write_head().await
    }

    async fn write_head(&mut self) -> Result<(), StoreError> {
        let head = self.head;
        self.store
            .put(self.keys.head_key(), encode_head(head))
            .await?;
        self.persisted_head = head;
        Ok(())
    }
}
