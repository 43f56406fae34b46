//! Parsing utilities shared by the message components

use bytes::Bytes;
use bytesstr::BytesStr;
use nom::bytes::complete::{escaped, is_not};
use nom::character::complete::char;
use nom::sequence::delimited;

pub type IResult<I, O> = nom::IResult<I, O, nom::error::VerboseError<I>>;

/// Something that can be parsed from a header or line slice.
///
/// `src` is the buffer the input slice borrows from, so produced
/// [`BytesStr`] values can reference it without copying.
pub trait Parse: Sized {
    fn parse(src: &Bytes) -> impl Fn(&str) -> IResult<&str, Self> + '_;
}

#[derive(Debug, thiserror::Error)]
#[error("failed to parse {0}")]
pub struct ParseError(pub &'static str);

pub(crate) fn parse_quoted(i: &str) -> IResult<&str, &str> {
    delimited(
        char('"'),
        escaped(is_not("\"\\"), '\\', nom::character::complete::anychar),
        char('"'),
    )(i)
}

pub(crate) fn whitespace(c: char) -> bool {
    matches!(c, ' ' | '\t' | '\r' | '\n')
}

#[rustfmt::skip]
pub(crate) fn token(c: char) -> bool {
    c.is_alphanumeric() || matches!(c, '-' | '.' | '!' | '%' | '*' | '_' | '`' | '\'' | '~' | '+')
}

/// Slice the matched subslice out of `src` as a `BytesStr` when it aliases
/// `src`, otherwise copy it into a new allocation.
pub(crate) fn slice_str(src: &Bytes, slice: &str) -> BytesStr {
    if slice.is_empty() {
        return BytesStr::from_static("");
    }

    let src_range = src.as_ptr() as usize..src.as_ptr() as usize + src.len();

    if src_range.contains(&(slice.as_ptr() as usize)) {
        BytesStr::from_parse(src, slice)
    } else {
        BytesStr::from(slice)
    }
}
