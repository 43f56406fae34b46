use crate::header::TypedHeader;
use crate::parse::{IResult, slice_str};
use crate::Name;
use bytes::Bytes;
use bytesstr::BytesStr;
use nom::bytes::complete::take_while1;
use nom::combinator::map;
use std::fmt;

/// The `Content-Type` header, stored as the full media type string
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentType(pub BytesStr);

impl ContentType {
    pub fn new<B: Into<BytesStr>>(media_type: B) -> Self {
        Self(media_type.into())
    }
}

impl TypedHeader for ContentType {
    const NAME: Name = Name::CONTENT_TYPE;

    fn parse<'i>(src: &Bytes, i: &'i str) -> IResult<&'i str, Self> {
        map(
            take_while1(|c: char| !crate::parse::whitespace(c) && c != ','),
            |ty| Self(slice_str(src, ty)),
        )(i.trim_start())
    }
}

impl fmt::Display for ContentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The `Content-Length` header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContentLength(pub usize);

impl TypedHeader for ContentLength {
    const NAME: Name = Name::CONTENT_LENGTH;

    fn parse<'i>(_: &Bytes, i: &'i str) -> IResult<&'i str, Self> {
        map(nom::character::complete::u64, |len| Self(len as usize))(i.trim_start())
    }
}

impl fmt::Display for ContentLength {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
