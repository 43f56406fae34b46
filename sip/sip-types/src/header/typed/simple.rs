use crate::header::TypedHeader;
use crate::parse::{IResult, Parse};
use crate::{Method, Name};
use bytes::Bytes;
use nom::combinator::map;
use std::fmt;

uint_header!(
    /// The `Max-Forwards` header
    MaxForwards, Name::MAX_FORWARDS
);

uint_header!(
    /// The top-level `Expires` header, in seconds
    Expires, Name::EXPIRES
);

uint_header!(
    /// The `Min-Expires` header returned with 423 responses
    MinExpires, Name::MIN_EXPIRES
);

uint_header!(
    /// The `Retry-After` header, in seconds
    RetryAfter, Name::RETRY_AFTER
);

token_header!(
    /// A single `Supported` extension token
    Supported, Name::SUPPORTED
);

token_header!(
    /// A single `Require` extension token
    Require, Name::REQUIRE
);

/// A single `Allow` entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Allow(pub Method);

impl TypedHeader for Allow {
    const NAME: Name = Name::ALLOW;

    fn parse<'i>(src: &Bytes, i: &'i str) -> IResult<&'i str, Self> {
        map(Method::parse(src), Allow)(i.trim_start())
    }
}

impl fmt::Display for Allow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::Headers;

    #[test]
    fn allow_list() {
        let mut headers = Headers::new();
        headers.insert(Name::ALLOW, "INVITE, ACK, CANCEL, BYE, OPTIONS");

        let allow: Vec<Allow> = headers.typed_list().unwrap();

        assert_eq!(allow.len(), 5);
        assert_eq!(allow[0], Allow(Method::INVITE));
        assert_eq!(allow[4], Allow(Method::OPTIONS));
    }

    #[test]
    fn expires() {
        let mut headers = Headers::new();
        headers.insert_typed(&Expires(300));

        assert_eq!(headers.typed::<Expires>().unwrap(), Expires(300));
    }
}
