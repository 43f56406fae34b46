use crate::header::TypedHeader;
use crate::parse::{IResult, Parse};
use crate::{Method, Name};
use bytes::Bytes;
use nom::character::complete::{multispace1, u32};
use nom::combinator::map;
use nom::sequence::separated_pair;
use std::fmt;

/// The `CSeq` header: sequence number plus request method
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CSeq {
    pub cseq: u32,
    pub method: Method,
}

impl CSeq {
    pub fn new(cseq: u32, method: Method) -> Self {
        Self { cseq, method }
    }
}

impl TypedHeader for CSeq {
    const NAME: Name = Name::CSEQ;

    fn parse<'i>(src: &Bytes, i: &'i str) -> IResult<&'i str, Self> {
        map(
            separated_pair(u32, multispace1, Method::parse(src)),
            |(cseq, method)| CSeq { cseq, method },
        )(i)
    }
}

impl fmt::Display for CSeq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.cseq, self.method)
    }
}
