//! Header storage and typed decoding

use crate::parse::IResult;
use bytes::Bytes;
use bytesstr::BytesStr;
use std::fmt;

pub mod headers;
pub(crate) mod name;
pub mod typed;

pub use name::Name;

/// A header that can be decoded from / encoded to its wire value.
///
/// Parsing gets the value's backing buffer so decoded slices stay zero-copy.
/// Printing goes through the type's [`Display`](fmt::Display) implementation.
pub trait TypedHeader: Sized + fmt::Display {
    const NAME: Name;

    fn parse<'i>(src: &Bytes, i: &'i str) -> IResult<&'i str, Self>;
}

#[derive(Debug, thiserror::Error)]
pub enum HeaderError {
    #[error("missing required header {0}")]
    Missing(Name),
    #[error("malformed {name} header: {value:?}")]
    Malformed { name: Name, value: BytesStr },
}

impl HeaderError {
    pub(crate) fn malformed(name: Name, value: &BytesStr) -> Self {
        Self::Malformed {
            name,
            value: value.clone(),
        }
    }
}
