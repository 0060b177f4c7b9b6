use super::error::IndexError;
use crate::bitfield::Bitfield;

/// Lists blocks that the feed holds locally but the sieve has not yet marked.
///
/// Only `0..feed_length` is considered. Whole bytes are compared first so long runs of
/// already-indexed (or absent) blocks are skipped without touching individual bits. The result
/// is in ascending block order.
///
/// Fails if the sieve has marked a block at or past `feed_length`: that means the feed handle
/// belongs to a different or truncated log than the one this index was built against.
pub fn plan_catchup(
    sieve: &Bitfield,
    available: &Bitfield,
    feed_length: u64,
) -> Result<Vec<u64>, IndexError> {
    let index_length = sieve.logical_len();
    if index_length > feed_length {
        return Err(IndexError::FeedShorterThanIndex {
            feed_length,
            index_length,
        });
    }

    let sieve_bytes = sieve.as_bytes();
    let available_bytes = available.as_bytes();
    let byte_count = feed_length.div_ceil(8) as usize;

    let mut pending = Vec::new();
    for byte_index in 0..byte_count.min(available_bytes.len()) {
        let indexed = sieve_bytes.get(byte_index).copied().unwrap_or(0);
        let missing = available_bytes[byte_index] & !indexed;
        if missing == 0 {
            continue;
        }

        for bit in 0..8u64 {
            let block = byte_index as u64 * 8 + bit;
            if block >= feed_length {
                break;
            }
            if missing & (0x80 >> bit) != 0 {
                pending.push(block);
            }
        }
    }

    Ok(pending)
}
