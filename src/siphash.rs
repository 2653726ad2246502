//! SipHash-2-4 over raw bytes.
//!
//! The hash engine calls this twice with two disjoint fixed keys to obtain
//! the independent hashes double hashing needs.

use core::hash::Hasher;
use siphasher::sip::SipHasher;

/// Key for the first probe hash.
pub const PRIMARY_KEY: [u64; 2] = [0x0706_0504_0302_0100, 0x0f0e_0d0c_0b0a_0908];
/// Key for the probe step.
pub const SECONDARY_KEY: [u64; 2] = [0x9e37_79b9_7f4a_7c15, 0xc2b2_ae3d_27d4_eb4f];

/// SipHash-2-4 of `bytes` under `key`.
pub fn siphash24(bytes: &[u8], key: [u64; 2]) -> u64 {
    let mut hasher = SipHasher::new_with_keys(key[0], key[1]);
    hasher.write(bytes);
    hasher.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn reference_key() -> [u64; 2] {
        let bytes: Vec<u8> = (0u8..16).collect();
        let mut k0 = [0u8; 8];
        let mut k1 = [0u8; 8];
        k0.copy_from_slice(&bytes[..8]);
        k1.copy_from_slice(&bytes[8..]);
        [u64::from_le_bytes(k0), u64::from_le_bytes(k1)]
    }

    #[test]
    fn matches_published_vectors() {
        let key = reference_key();
        assert_eq!(key, PRIMARY_KEY);
        assert_eq!(siphash24(&[], key), 0x726f_db47_dd0e_0e31);
        let msg: Vec<u8> = (0u8..15).collect();
        assert_eq!(siphash24(&msg, key), 0xa129_ca61_49be_45e5);
    }

    #[test]
    fn keys_are_disjoint() {
        let data = 42u32.to_ne_bytes();
        assert_ne!(
            siphash24(&data, PRIMARY_KEY),
            siphash24(&data, SECONDARY_KEY)
        );
    }

    // std's deprecated SipHasher is SipHash-2-4 over the raw `write` bytes.
    proptest! {
        #[test]
        fn agrees_with_std_siphasher(data in proptest::collection::vec(any::<u8>(), 0..64), k0 in any::<u64>(), k1 in any::<u64>()) {
            #[allow(deprecated)]
            let mut reference = std::hash::SipHasher::new_with_keys(k0, k1);
            reference.write(&data);
            prop_assert_eq!(siphash24(&data, [k0, k1]), reference.finish());
        }
    }
}
