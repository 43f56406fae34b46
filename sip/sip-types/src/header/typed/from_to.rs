use crate::header::TypedHeader;
use crate::parse::IResult;
use crate::uri::{NameAddr, Params};
use crate::Name;
use bytes::Bytes;
use bytesstr::BytesStr;
use nom::combinator::map;
use nom::sequence::tuple;
use std::fmt;

/// Value of the `From` and `To` headers.
///
/// Both share the same wire syntax; decode the `To` position with
/// [`Headers::typed_named`](crate::Headers::typed_named).
#[derive(Debug, Clone)]
pub struct FromTo {
    pub uri: NameAddr,
    pub tag: Option<BytesStr>,
    pub params: Params,
}

impl FromTo {
    pub fn new(uri: NameAddr, tag: Option<BytesStr>) -> Self {
        Self {
            uri,
            tag,
            params: Params::new(),
        }
    }
}

impl TypedHeader for FromTo {
    const NAME: Name = Name::FROM;

    fn parse<'i>(src: &Bytes, i: &'i str) -> IResult<&'i str, Self> {
        map(
            tuple((NameAddr::parse(src), Params::parse(src))),
            |(uri, mut params)| FromTo {
                uri,
                tag: params.take("tag"),
                params,
            },
        )(i)
    }
}

impl fmt::Display for FromTo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.uri)?;

        if let Some(tag) = &self.tag {
            write!(f, ";tag={tag}")?;
        }

        write!(f, "{}", self.params)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::uri::SipUri;
    use crate::Headers;

    #[test]
    fn parse_from() {
        let mut headers = Headers::new();
        headers.insert(Name::FROM, "\"Ext 100\" <sip:100@pbx.example.org>;tag=883342");

        let from: FromTo = headers.typed().unwrap();

        assert_eq!(from.uri.display_name.as_deref(), Some("Ext 100"));
        assert_eq!(from.tag.as_deref(), Some("883342"));
        assert!(from.params.is_empty());
    }

    #[test]
    fn print_to_without_tag() {
        let uri: SipUri = "sip:100@pbx.example.org".parse().unwrap();
        let to = FromTo::new(NameAddr::uri(uri), None);

        assert_eq!(to.to_string(), "<sip:100@pbx.example.org>");
    }
}
