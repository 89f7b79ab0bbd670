//! Prefix-sharing key compression.
//!
//! A sorted run of 64-bit keys usually shares its high-order bits. Instead
//! of storing each key in full, a node stores the shared prefix once and
//! packs only the distinct low-order suffix of every key:
//!
//! ```text
//! ┌──────────┬────────────┬──────────────────────────────┐
//! │  prefix  │ suffix len │  packed suffixes (MSB-first) │
//! │  (u64)   │    (u8)    │  ceil(len × n / 8) bytes     │
//! └──────────┴────────────┴──────────────────────────────┘
//! ```
//!
//! Keys are signed, but the prefix is a bit-prefix of the **unsigned**
//! representation. A run mixing negative and non-negative keys differs in
//! the sign bit, so its shared prefix is empty and every suffix is stored
//! in full; same-sign runs compress well.

use crate::error::{IndexError, Result};

/// Length in bits of the common high-order prefix of `min` and `max`.
///
/// Because the keys between `min` and `max` lie between them as unsigned
/// values (same-sign runs) this is also the prefix shared by the whole
/// run; mixed-sign runs disagree on bit 63 and get length 0.
pub fn prefix_len(min: u64, max: u64) -> u8 {
    (min ^ max).leading_zeros() as u8
}

/// The prefix value itself: `min` with the low `64 - len` bits cleared.
pub fn prefix_value(min: u64, len: u8) -> u64 {
    if len == 0 {
        0
    } else if len >= 64 {
        min
    } else {
        min & (u64::MAX << (64 - len))
    }
}

/// Bytes needed for `num_keys` packed suffixes of `suffix_bits` bits each.
pub fn encoded_array_size(num_keys: usize, suffix_bits: u8) -> usize {
    (suffix_bits as usize * num_keys + 7) / 8
}

/// Pack the low `suffix_bits` bits of each key into `out`, MSB-first.
///
/// `out` must be zeroed and at least `encoded_array_size` bytes long.
pub fn encode_suffixes(keys: &[i64], suffix_bits: u8, out: &mut [u8]) {
    debug_assert!(out.len() >= encoded_array_size(keys.len(), suffix_bits));
    let mut w = BitWriter::new(out);
    for &key in keys {
        w.push_bits(key as u64, suffix_bits);
    }
}

/// Reassemble keys from a prefix and packed suffixes.
pub fn decode_suffixes(
    prefix: u64,
    suffix_bits: u8,
    num_keys: usize,
    data: &[u8],
) -> Result<Vec<i64>> {
    if data.len() < encoded_array_size(num_keys, suffix_bits) {
        return Err(IndexError::corruption(
            "key suffix area shorter than declared key count",
        ));
    }
    let mut r = BitReader::new(data);
    let mut keys = Vec::with_capacity(num_keys);
    for _ in 0..num_keys {
        keys.push((prefix | r.read_bits(suffix_bits)) as i64);
    }
    Ok(keys)
}

/// Predicted serialized size of one half of a split.
fn half_size(
    num_keys: usize,
    min: i64,
    max: i64,
    header: usize,
    weight_key: usize,
    weight_child: usize,
) -> usize {
    let suffix = 64 - prefix_len(min as u64, max as u64);
    let children = if weight_child > 0 { num_keys + 1 } else { 0 };
    header + encoded_array_size(num_keys, suffix) + num_keys * weight_key + children * weight_child
}

/// Find the split position for a node about to receive one more key.
///
/// Candidate `k` puts `keys[0..k)` in the left half and `keys[k..)` in the
/// right; `new_key` lands on the side its sort position falls into. The
/// chosen `k` is one where both predicted halves fit in `page_size`,
/// minimizing the larger half; sizes tying, the left half is kept at
/// least as large as the right.
///
/// `weight_key` is the per-entry payload (value bytes, or key-and-value
/// bytes for non-unique separators); `weight_child` is non-zero for inner
/// nodes and adds one child pointer per key plus one.
///
/// Returns an error when no candidate fits, which cannot happen for a
/// node that respected the page budget before the insert.
pub fn split_index_after_insert(
    keys: &[i64],
    new_key: i64,
    header: usize,
    weight_key: usize,
    weight_child: usize,
    page_size: usize,
) -> Result<usize> {
    let n = keys.len();
    if n < 2 {
        return Err(IndexError::invariant("cannot split fewer than two keys"));
    }
    let ins = keys.partition_point(|&k| k < new_key);

    let mut best: Option<(usize, usize, bool)> = None; // (k, max half, left >= right)
    for k in 1..n {
        let (ln, lmin, lmax) = if ins < k {
            (k + 1, keys[0].min(new_key), keys[k - 1].max(new_key))
        } else {
            (k, keys[0], keys[k - 1])
        };
        let (rn, rmin, rmax) = if ins >= k {
            (n - k + 1, keys[k].min(new_key), keys[n - 1].max(new_key))
        } else {
            (n - k, keys[k], keys[n - 1])
        };

        let left = half_size(ln, lmin, lmax, header, weight_key, weight_child);
        let right = half_size(rn, rmin, rmax, header, weight_key, weight_child);
        if left > page_size || right > page_size {
            continue;
        }

        let larger = left.max(right);
        let balanced_left = left >= right;
        let better = match best {
            None => true,
            Some((_, best_larger, best_balanced)) => {
                larger < best_larger || (larger == best_larger && balanced_left && !best_balanced)
            }
        };
        if better {
            best = Some((k, larger, balanced_left));
        }
    }

    best.map(|(k, _, _)| k)
        .ok_or_else(|| IndexError::invariant("no split position fits both halves into a page"))
}

struct BitWriter<'a> {
    buf: &'a mut [u8],
    bit_pos: usize,
}

impl<'a> BitWriter<'a> {
    fn new(buf: &'a mut [u8]) -> Self {
        Self { buf, bit_pos: 0 }
    }

    fn push_bits(&mut self, value: u64, bits: u8) {
        for shift in (0..bits).rev() {
            if (value >> shift) & 1 == 1 {
                let byte = self.bit_pos / 8;
                self.buf[byte] |= 1 << (7 - self.bit_pos % 8);
            }
            self.bit_pos += 1;
        }
    }
}

struct BitReader<'a> {
    buf: &'a [u8],
    bit_pos: usize,
}

impl<'a> BitReader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, bit_pos: 0 }
    }

    fn read_bits(&mut self, bits: u8) -> u64 {
        let mut value = 0u64;
        for _ in 0..bits {
            let byte = self.bit_pos / 8;
            let bit = (self.buf[byte] >> (7 - self.bit_pos % 8)) & 1;
            value = (value << 1) | bit as u64;
            self.bit_pos += 1;
        }
        value
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::prelude::*;

    fn roundtrip(keys: &[i64]) -> Vec<i64> {
        let min = *keys.first().unwrap() as u64;
        let max = *keys.last().unwrap() as u64;
        let len = prefix_len(min, max);
        let prefix = prefix_value(min, len);
        let suffix = 64 - len;

        let mut buf = vec![0u8; encoded_array_size(keys.len(), suffix)];
        encode_suffixes(keys, suffix, &mut buf);
        decode_suffixes(prefix, suffix, keys.len(), &buf).unwrap()
    }

    #[test]
    fn test_prefix_len() {
        assert_eq!(prefix_len(0, 0), 64);
        assert_eq!(prefix_len(5, 5), 64);
        assert_eq!(prefix_len(1, 9), 60);
        assert_eq!(prefix_len(0, u64::MAX), 0);
        // Mixed-sign run: the sign bit differs, nothing is shared
        assert_eq!(prefix_len(-1i64 as u64, 1), 0);
    }

    #[test]
    fn test_prefix_value() {
        assert_eq!(prefix_value(0b1011_0000, 60), 0b1011_0000);
        assert_eq!(prefix_value(0xFF, 0), 0);
        assert_eq!(prefix_value(42, 64), 42);
        let len = prefix_len(0x1234_5600, 0x1234_56FF);
        assert_eq!(prefix_value(0x1234_56AB, len), 0x1234_5600);
    }

    #[test]
    fn test_encoded_array_size() {
        assert_eq!(encoded_array_size(0, 64), 0);
        assert_eq!(encoded_array_size(8, 4), 4);
        assert_eq!(encoded_array_size(3, 3), 2); // 9 bits round up to 2 bytes
        assert_eq!(encoded_array_size(4, 64), 32);
    }

    #[test]
    fn test_suffix_roundtrip_small() {
        let keys = [1i64, 2, 3, 5, 8, 9];
        assert_eq!(roundtrip(&keys), keys);
    }

    #[test]
    fn test_suffix_roundtrip_single_key() {
        // One key shares all 64 bits with itself: zero suffix bytes
        let keys = [0x0123_4567_89AB_CDEFi64];
        assert_eq!(encoded_array_size(1, 0), 0);
        assert_eq!(roundtrip(&keys), keys);
    }

    #[test]
    fn test_suffix_roundtrip_negative_keys() {
        let keys = [-100i64, -50, -3];
        assert_eq!(roundtrip(&keys), keys);

        let mixed = [-2i64, -1, 0, 1, 2];
        assert_eq!(roundtrip(&mixed), mixed);
    }

    #[test]
    fn test_suffix_roundtrip_random() {
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..50 {
            let base: i64 = rng.gen();
            let spread: u16 = rng.gen();
            let mut keys: Vec<i64> = (0..64)
                .map(|_| base.wrapping_add(rng.gen_range(0..=spread as i64)))
                .collect();
            keys.sort_unstable();
            keys.dedup();
            assert_eq!(roundtrip(&keys), keys);
        }
    }

    #[test]
    fn test_split_index_balances_halves() {
        // Seven keys plus an eighth: both halves fit a 72-byte page only
        // around the middle, and the balanced candidate wins.
        let keys = [1i64, 2, 3, 4, 5, 6, 7];
        let k = split_index_after_insert(&keys, 8, 12, 8, 0, 72).unwrap();
        assert_eq!(k, 4);
    }

    #[test]
    fn test_split_index_respects_insert_side() {
        let keys = [10i64, 20, 30, 40, 50, 60, 70];
        // New key at the front: the left half carries it
        let k = split_index_after_insert(&keys, 5, 12, 8, 0, 72).unwrap();
        assert!(k >= 1 && k < keys.len());
        // Every returned candidate must keep both halves within the page
        let left = 12 + encoded_array_size(k + 1, 64 - prefix_len(5, keys[k - 1] as u64)) + (k + 1) * 8;
        assert!(left <= 72);
    }

    #[test]
    fn test_split_index_refuses_tiny_page() {
        let keys = [i64::MIN, -1, 0, i64::MAX - 1, i64::MAX];
        assert!(split_index_after_insert(&keys, 1, 12, 8, 0, 40).is_err());
    }
}
