use md5::{Digest, Md5};

use crate::firestore::error::{invalid_argument, FirestoreResult};

/// Probabilistic set of document names sent by the backend alongside an
/// existence filter. A negative answer is certain; a positive one may be a
/// false positive.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BloomFilter {
    bitmap: Vec<u8>,
    bit_count: u64,
    hash_count: u32,
}

impl BloomFilter {
    /// Validates the wire representation: `padding` unused trailing bits in
    /// the last byte and `hash_count` probes per lookup.
    pub fn new(bitmap: Vec<u8>, padding: i32, hash_count: i32) -> FirestoreResult<Self> {
        if !(0..8).contains(&padding) {
            return Err(invalid_argument(format!("Invalid padding: {padding}")));
        }
        if hash_count < 0 {
            return Err(invalid_argument(format!("Invalid hash count: {hash_count}")));
        }
        if bitmap.is_empty() {
            if padding != 0 {
                return Err(invalid_argument(format!(
                    "Invalid padding when bitmap length is 0: {padding}"
                )));
            }
            if hash_count != 0 {
                return Err(invalid_argument(format!(
                    "Invalid hash count when bitmap length is 0: {hash_count}"
                )));
            }
        } else if hash_count == 0 {
            return Err(invalid_argument("Invalid hash count: 0"));
        }

        let bit_count = (bitmap.len() as u64) * 8 - padding as u64;
        Ok(Self {
            bitmap,
            bit_count,
            hash_count: hash_count as u32,
        })
    }

    pub fn bit_count(&self) -> u64 {
        self.bit_count
    }

    pub fn hash_count(&self) -> u32 {
        self.hash_count
    }

    /// Whether `value` may be in the set. Always false for an empty filter.
    pub fn might_contain(&self, value: &str) -> bool {
        if self.bit_count == 0 {
            return false;
        }
        let (hash1, hash2) = md5_hashes(value);
        (0..self.hash_count).all(|i| {
            let index = hash1.wrapping_add((i as u64).wrapping_mul(hash2)) % self.bit_count;
            self.is_bit_set(index)
        })
    }

    fn is_bit_set(&self, index: u64) -> bool {
        let byte = self.bitmap[(index / 8) as usize];
        byte & (1 << (index % 8)) != 0
    }

    #[cfg(test)]
    fn insert(&mut self, value: &str) {
        let (hash1, hash2) = md5_hashes(value);
        for i in 0..self.hash_count {
            let index = hash1.wrapping_add((i as u64).wrapping_mul(hash2)) % self.bit_count;
            self.bitmap[(index / 8) as usize] |= 1 << (index % 8);
        }
    }
}

fn md5_hashes(value: &str) -> (u64, u64) {
    let digest = Md5::digest(value.as_bytes());
    let mut first = [0u8; 8];
    let mut second = [0u8; 8];
    first.copy_from_slice(&digest[..8]);
    second.copy_from_slice(&digest[8..16]);
    (u64::from_le_bytes(first), u64::from_le_bytes(second))
}

#[cfg(test)]
mod tests {
    use super::*;

    const PREFIX: &str = "projects/p/databases/(default)/documents/coll/";

    #[test]
    fn validates_wire_shape() {
        assert!(BloomFilter::new(vec![], 0, 0).is_ok());
        assert!(BloomFilter::new(vec![], 1, 0).is_err());
        assert!(BloomFilter::new(vec![], 0, 1).is_err());
        assert!(BloomFilter::new(vec![0xff], 8, 1).is_err());
        assert!(BloomFilter::new(vec![0xff], -1, 1).is_err());
        assert!(BloomFilter::new(vec![0xff], 0, 0).is_err());
        assert!(BloomFilter::new(vec![0xff], 0, -1).is_err());
        assert_eq!(BloomFilter::new(vec![0, 0], 3, 2).unwrap().bit_count(), 13);
    }

    #[test]
    fn empty_filter_contains_nothing() {
        let filter = BloomFilter::new(vec![], 0, 0).unwrap();
        assert!(!filter.might_contain(""));
        assert!(!filter.might_contain(&format!("{PREFIX}a")));
    }

    #[test]
    fn inserted_values_are_never_reported_missing() {
        let mut filter = BloomFilter::new(vec![0; 64], 5, 7).unwrap();
        let names: Vec<String> = (0..100).map(|i| format!("{PREFIX}doc{i}")).collect();
        for name in &names {
            filter.insert(name);
        }
        for name in &names {
            assert!(filter.might_contain(name), "false negative for {name}");
        }
    }

    #[test]
    fn full_bitmap_contains_everything() {
        let filter = BloomFilter::new(vec![0xff; 4], 0, 3).unwrap();
        assert!(filter.might_contain(&format!("{PREFIX}anything")));
    }

    #[test]
    fn zero_bitmap_contains_nothing() {
        let filter = BloomFilter::new(vec![0; 4], 0, 3).unwrap();
        assert!(!filter.might_contain(&format!("{PREFIX}anything")));
    }
}
