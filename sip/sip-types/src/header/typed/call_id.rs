use crate::header::TypedHeader;
use crate::parse::{IResult, slice_str};
use crate::Name;
use bytes::Bytes;
use bytesstr::BytesStr;
use nom::bytes::complete::take_while1;
use nom::combinator::map;
use std::fmt;

/// The `Call-ID` header
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CallID(pub BytesStr);

impl CallID {
    pub fn new<B: Into<BytesStr>>(call_id: B) -> Self {
        Self(call_id.into())
    }
}

impl TypedHeader for CallID {
    const NAME: Name = Name::CALL_ID;

    fn parse<'i>(src: &Bytes, i: &'i str) -> IResult<&'i str, Self> {
        map(
            take_while1(|c: char| !crate::parse::whitespace(c)),
            |call_id| Self(slice_str(src, call_id)),
        )(i.trim_start())
    }
}

impl fmt::Display for CallID {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
