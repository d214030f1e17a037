//! Deterministic `UUID -> i64` workload key hash.

use uuid::Uuid;

/// Hash a workload UUID onto the controller key space `[0, i64::MAX]`.
///
/// The 16 raw bytes are read as two big-endian 64-bit halves, XORed
/// together, and the sign bit is cleared so the result is never negative.
#[must_use]
pub fn workload_key(uid: &Uuid) -> i64 {
    let bytes = uid.as_bytes();
    let mut high = [0u8; 8];
    let mut low = [0u8; 8];
    high.copy_from_slice(&bytes[..8]);
    low.copy_from_slice(&bytes[8..]);

    let mixed = u64::from_be_bytes(high) ^ u64::from_be_bytes(low);
    (mixed & (i64::MAX as u64)) as i64
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_nil_uuid_hashes_to_zero() {
        assert_eq!(workload_key(&Uuid::nil()), 0);
    }

    #[test]
    fn test_known_vector() {
        // halves 0x0000000000000001 and 0x0000000000000003
        let uid = Uuid::from_bytes([0, 0, 0, 0, 0, 0, 0, 1, 0, 0, 0, 0, 0, 0, 0, 3]);
        assert_eq!(workload_key(&uid), 2);
    }

    #[test]
    fn test_sign_bit_is_cleared() {
        let mut bytes = [0u8; 16];
        bytes[..8].fill(0xff);
        assert_eq!(workload_key(&Uuid::from_bytes(bytes)), i64::MAX);
    }

    #[test]
    fn test_max_uuid_hashes_to_zero() {
        // identical halves cancel out
        assert_eq!(workload_key(&Uuid::max()), 0);
    }

    proptest! {
        #[test]
        fn prop_key_is_non_negative(bytes in any::<[u8; 16]>()) {
            let key = workload_key(&Uuid::from_bytes(bytes));
            prop_assert!(key >= 0);
        }

        #[test]
        fn prop_key_is_deterministic(bytes in any::<[u8; 16]>()) {
            let uid = Uuid::from_bytes(bytes);
            prop_assert_eq!(workload_key(&uid), workload_key(&uid));
        }
    }
}
