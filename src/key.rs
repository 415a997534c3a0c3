//! Order-preserving key encoding for integral keys.
//!
//! The trie orders keys by their bytes; integral keys therefore encode as
//! fixed-width big-endian strings, with the sign bit flipped for signed
//! types so that two's-complement order maps onto byte order.

/// A fixed-width key type with an order-preserving byte encoding.
///
/// For every pair of keys `a` and `b`: `a < b` exactly when
/// `a.to_key_bytes() < b.to_key_bytes()` byte-lexicographically.
pub trait OrderedKey: Copy {
    /// Width of the encoding in bytes.
    const LEN: usize;
    type Bytes: AsRef<[u8]>;

    fn to_key_bytes(self) -> Self::Bytes;
    fn from_key_bytes(bytes: &[u8]) -> Self;
}

macro_rules! unsigned_key {
    ($($t:ty),*) => {$(
        impl OrderedKey for $t {
            const LEN: usize = std::mem::size_of::<$t>();
            type Bytes = [u8; std::mem::size_of::<$t>()];

            fn to_key_bytes(self) -> Self::Bytes {
                self.to_be_bytes()
            }

            fn from_key_bytes(bytes: &[u8]) -> Self {
                <$t>::from_be_bytes(bytes.try_into().expect("key width mismatch"))
            }
        }
    )*};
}

macro_rules! signed_key {
    ($($t:ty => $u:ty),*) => {$(
        impl OrderedKey for $t {
            const LEN: usize = std::mem::size_of::<$t>();
            type Bytes = [u8; std::mem::size_of::<$t>()];

            fn to_key_bytes(self) -> Self::Bytes {
                ((self as $u) ^ (1 << (<$t>::BITS - 1))).to_be_bytes()
            }

            fn from_key_bytes(bytes: &[u8]) -> Self {
                let raw = <$u>::from_be_bytes(bytes.try_into().expect("key width mismatch"));
                (raw ^ (1 << (<$t>::BITS - 1))) as $t
            }
        }
    )*};
}

unsigned_key!(u8, u16, u32, u64, u128);
signed_key!(i8 => u8, i16 => u16, i32 => u32, i64 => u64, i128 => u128);

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn unsigned_encoding_preserves_order(a: u64, b: u64) {
            prop_assert_eq!(a.cmp(&b), a.to_key_bytes().cmp(&b.to_key_bytes()));
        }

        #[test]
        fn signed_encoding_preserves_order(a: i32, b: i32) {
            prop_assert_eq!(a.cmp(&b), a.to_key_bytes().cmp(&b.to_key_bytes()));
        }

        #[test]
        fn signed_encoding_round_trips(a: i64) {
            prop_assert_eq!(i64::from_key_bytes(a.to_key_bytes().as_ref()), a);
        }

        #[test]
        fn unsigned_encoding_round_trips(a: u32) {
            prop_assert_eq!(u32::from_key_bytes(a.to_key_bytes().as_ref()), a);
        }
    }

    #[test]
    fn negative_keys_sort_before_positive() {
        assert!((-1i32).to_key_bytes() < 0i32.to_key_bytes());
        assert!(i32::MIN.to_key_bytes() < i32::MAX.to_key_bytes());
    }
}
