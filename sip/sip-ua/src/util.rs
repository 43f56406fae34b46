use bytesstr::BytesStr;
use rand::distr::Alphanumeric;
use rand::{Rng, rng};

pub fn random_tag() -> BytesStr {
    rng()
        .sample_iter(Alphanumeric)
        .take(12)
        .map(char::from)
        .collect::<String>()
        .into()
}

pub fn random_call_id() -> BytesStr {
    rng()
        .sample_iter(Alphanumeric)
        .take(24)
        .map(char::from)
        .collect::<String>()
        .into()
}

/// Initial CSeq numbers are random 31-bit values per RFC 3261 §8.1.1.5
pub fn random_sequence_number() -> u32 {
    rng().random_range(0..(u32::MAX / 2))
}
