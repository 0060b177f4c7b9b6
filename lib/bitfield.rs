/// Growable bitmap with one bit per block index.
///
/// Bits are stored most-significant-first within each byte, so bit 0 is `0x80` of byte 0. The
/// same layout is used for the in-memory sieve, its persisted chunks, and feed availability
/// snapshots, which lets the catch-up scan compare whole bytes before descending to bits.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Bitfield {
    bytes: Vec<u8>,
}

impl Bitfield {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self { bytes }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Number of backing bytes. Always a whole number of bytes, so this can exceed the number of
    /// meaningful bits by up to seven.
    pub fn byte_len(&self) -> usize {
        self.bytes.len()
    }

    pub fn get(&self, index: u64) -> bool {
        let Some(byte) = self.bytes.get(byte_index(index)) else {
            return false;
        };
        byte & bit_mask(index) != 0
    }

    /// Sets `index`, growing the backing storage as needed. Returns `true` if the bit was newly
    /// set. There is intentionally no way to clear a bit.
    pub fn set(&mut self, index: u64) -> bool {
        let byte = byte_index(index);
        if byte >= self.bytes.len() {
            self.bytes.resize(byte + 1, 0);
        }
        let mask = bit_mask(index);
        let was_set = self.bytes[byte] & mask != 0;
        self.bytes[byte] |= mask;
        !was_set
    }

    /// ORs `src` into the bitmap starting at `byte_offset`.
    ///
    /// Used when rebuilding the sieve from persisted chunks. OR (rather than overwrite) keeps the
    /// monotonic guarantee even if two chunks ever overlap.
    pub fn merge_bytes_at(&mut self, byte_offset: usize, src: &[u8]) {
        let end = byte_offset + src.len();
        if end > self.bytes.len() {
            self.bytes.resize(end, 0);
        }
        for (dst, value) in self.bytes[byte_offset..end].iter_mut().zip(src) {
            *dst |= *value;
        }
    }

    /// Copies `len` bytes starting at `byte_offset`, zero-padding past the end of the bitmap.
    pub fn slice_padded(&self, byte_offset: usize, len: usize) -> Vec<u8> {
        let mut out = vec![0u8; len];
        if byte_offset < self.bytes.len() {
            let end = (byte_offset + len).min(self.bytes.len());
            out[..end - byte_offset].copy_from_slice(&self.bytes[byte_offset..end]);
        }
        out
    }

    /// Index of the highest set bit plus one, or 0 when no bit is set.
    pub fn logical_len(&self) -> u64 {
        for (idx, byte) in self.bytes.iter().enumerate().rev() {
            if *byte != 0 {
                let last_bit = 7 - byte.trailing_zeros() as u64;
                return idx as u64 * 8 + last_bit + 1;
            }
        }
        0
    }

    pub fn count_ones(&self) -> u64 {
        self.bytes.iter().map(|byte| byte.count_ones() as u64).sum()
    }
}

fn byte_index(index: u64) -> usize {
    (index / 8) as usize
}

fn bit_mask(index: u64) -> u8 {
    0x80 >> (index % 8)
}

#[cfg(test)]
mod tests {
    use super::Bitfield;

    #[test]
    fn set_grows_and_reports_new_bits() {
        let mut bits = Bitfield::new();
        assert!(!bits.get(17));
        assert!(bits.set(17));
        assert!(!bits.set(17));
        assert!(bits.get(17));
        assert_eq!(bits.byte_len(), 3);
        assert_eq!(bits.as_bytes()[2], 0x40);
    }

    #[test]
    fn logical_len_tracks_highest_set_bit() {
        let mut bits = Bitfield::from_bytes(vec![0; 4]);
        assert_eq!(bits.logical_len(), 0);
        bits.set(0);
        assert_eq!(bits.logical_len(), 1);
        bits.set(12);
        assert_eq!(bits.logical_len(), 13);
        assert_eq!(bits.count_ones(), 2);
    }

    #[test]
    fn merge_bytes_at_ors_into_existing_bits() {
        let mut bits = Bitfield::new();
        bits.set(1);
        bits.merge_bytes_at(0, &[0x80]);
        bits.merge_bytes_at(2, &[0x01]);
        assert!(bits.get(0));
        assert!(bits.get(1));
        assert!(bits.get(23));
        assert_eq!(bits.byte_len(), 3);
    }

    #[test]
    fn slice_padded_zero_fills_past_end() {
        let bits = Bitfield::from_bytes(vec![0xff, 0x0f]);
        assert_eq!(bits.slice_padded(1, 3), vec![0x0f, 0, 0]);
        assert_eq!(bits.slice_padded(8, 2), vec![0, 0]);
    }
}
