use std::hash::Hasher;

/// Deterministic FNV-1a 64-bit hasher.
///
/// `std`'s `DefaultHasher` is randomly seeded per process; step logs need
/// checksums that compare across runs and partition layouts.
#[derive(Debug, Clone, Copy)]
pub struct FnvHasher {
    state: u64,
}

impl FnvHasher {
    const OFFSET_BASIS: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x0000_0100_0000_01b3;

    pub fn new() -> Self {
        Self {
            state: Self::OFFSET_BASIS,
        }
    }
}

impl Default for FnvHasher {
    fn default() -> Self {
        Self::new()
    }
}

impl Hasher for FnvHasher {
    fn finish(&self) -> u64 {
        self.state
    }

    fn write(&mut self, bytes: &[u8]) {
        self.state = bytes.iter().fold(self.state, |state, &byte| {
            (state ^ u64::from(byte)).wrapping_mul(Self::PRIME)
        });
    }
}

/// Order-independent checksum of a field keyed by global id.
///
/// Each `(id, value)` pair is hashed on its own and the digests are combined
/// with a wrapping sum, so partitions can checksum their owned vertices and
/// the totals add up to the checksum of the whole mesh.
pub fn field_checksum<'a>(entries: impl IntoIterator<Item = (u64, &'a f64)>) -> u64 {
    entries.into_iter().fold(0u64, |acc, (id, value)| {
        let mut hasher = FnvHasher::new();
        hasher.write_u64(id);
        hasher.write_u64(value.to_bits());
        acc.wrapping_add(hasher.finish())
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fnv_matches_reference_vector() {
        let mut hasher = FnvHasher::new();
        hasher.write(b"a");
        assert_eq!(hasher.finish(), 0xaf63_dc4c_8601_ec8c);
    }

    #[test]
    fn checksum_is_split_invariant() {
        let ids = [3u64, 1, 7, 4];
        let values = [1.5, -2.0, 0.25, 9.0];
        let whole = field_checksum(ids.iter().copied().zip(&values));
        let left = field_checksum(ids[..2].iter().copied().zip(&values[..2]));
        let right = field_checksum(ids[2..].iter().copied().zip(&values[2..]));
        assert_eq!(whole, left.wrapping_add(right));

        let changed = [1.5, -2.0, 0.25, 9.5];
        assert_ne!(whole, field_checksum(ids.iter().copied().zip(&changed)));
    }
}
