//! Space-efficient probabilistic set used to advertise "I serve these
//! service ids" without listing them (§4.7).

/// A fixed-capacity Bloom filter. Capacity is given in bytes; membership
/// tests never false-negative, and the false-positive rate is governed by
/// the ratio of elements inserted to `capacity_bytes * 8` bits.
#[derive(Clone, Eq, PartialEq)]
pub struct BloomFilter {
    bits: Vec<u8>,
}

/// Number of independent hash rounds combined per insert/lookup (§4.7).
const HASH_ROUNDS: u32 = 5;

impl BloomFilter {
    /// Creates an empty filter backed by `capacity_bytes` bytes (so
    /// `capacity_bytes * 8` bits).
    #[must_use]
    pub fn new(capacity_bytes: usize) -> Self {
        Self { bits: vec![0u8; capacity_bytes] }
    }

    /// Wraps an existing byte array as a filter. A round trip through
    /// [`BloomFilter::as_bytes`] / `from_bytes` must preserve membership
    /// (§8).
    #[must_use]
    pub fn from_bytes(bytes: &[u8]) -> Self {
        Self { bits: bytes.to_vec() }
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.bits
    }

    /// Inserts `element` into the set.
    pub fn insert(&mut self, element: &[u8]) {
        let bit_count = self.bits.len() * 8;
        if bit_count == 0 {
            return;
        }
        for i in 0..HASH_ROUNDS {
            let bit = combined_hash(element, i) % bit_count as u64;
            self.set_bit(bit as usize);
        }
    }

    /// Returns whether `element` might be a member. `false` is a definite
    /// answer; `true` may be a false positive (§4.7, §8).
    #[must_use]
    pub fn possibly_contains(&self, element: &[u8]) -> bool {
        let bit_count = self.bits.len() * 8;
        if bit_count == 0 {
            return false;
        }
        (0..HASH_ROUNDS).all(|i| {
            let bit = combined_hash(element, i) % bit_count as u64;
            self.get_bit(bit as usize)
        })
    }

    fn set_bit(&mut self, bit: usize) {
        self.bits[bit / 8] |= 1 << (bit % 8);
    }

    fn get_bit(&self, bit: usize) -> bool {
        self.bits[bit / 8] & (1 << (bit % 8)) != 0
    }
}

impl std::fmt::Debug for BloomFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "BloomFilter({} bytes)", self.bits.len())
    }
}

/// `hash1 + i*hash2`, with the MSB cleared to force a non-negative (i.e.
/// representable as an unsigned remainder) result, per §4.7.
fn combined_hash(element: &[u8], round: u32) -> u64 {
    let (h1, h2) = murmur3_halves(element);
    let combined = h1.wrapping_add((round as u64).wrapping_mul(h2));
    combined & 0x7FFF_FFFF_FFFF_FFFF
}

/// MurmurHash3 x64/128, seeded 0, folded into its two 64-bit halves (§4.7).
fn murmur3_halves(element: &[u8]) -> (u64, u64) {
    let mut cursor = std::io::Cursor::new(element);
    let hash = murmur3::murmur3_x64_128(&mut cursor, 0).expect("reading from an in-memory slice cannot fail");
    let high = (hash >> 64) as u64;
    let low = hash as u64;
    (low, high)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_through_bytes_preserves_membership() {
        let mut filter = BloomFilter::new(10);
        for id in ["alpha", "beta", "gamma"] {
            filter.insert(id.as_bytes());
        }
        let restored = BloomFilter::from_bytes(filter.as_bytes());
        for id in ["alpha", "beta", "gamma"] {
            assert!(restored.possibly_contains(id.as_bytes()));
        }
    }

    #[test]
    fn every_inserted_element_is_found() {
        let mut filter = BloomFilter::new(10);
        let elements: Vec<String> = (0..5).map(|i| format!("service-{i}")).collect();
        for e in &elements {
            filter.insert(e.as_bytes());
        }
        for e in &elements {
            assert!(filter.possibly_contains(e.as_bytes()));
        }
    }

    #[test]
    fn false_positive_rate_is_bounded_at_five_elements_in_ten_bytes() {
        let mut filter = BloomFilter::new(10);
        let members: Vec<String> = (0..5).map(|i| format!("service-{i}")).collect();
        for m in &members {
            filter.insert(m.as_bytes());
        }
        let trials = 2000;
        let false_positives = (0..trials)
            .map(|i| format!("absent-{i}"))
            .filter(|candidate| filter.possibly_contains(candidate.as_bytes()))
            .count();
        let rate = false_positives as f64 / trials as f64;
        assert!(rate <= 0.05, "false positive rate {rate} exceeds 5%");
    }

    #[test]
    fn empty_filter_contains_nothing() {
        let filter = BloomFilter::new(10);
        assert!(!filter.possibly_contains(b"anything"));
    }
}
