use crate::header::TypedHeader;
use crate::host::HostPort;
use crate::parse::{IResult, Parse, slice_str};
use crate::uri::Params;
use crate::Name;
use bytes::Bytes;
use bytesstr::BytesStr;
use nom::bytes::complete::{tag_no_case, take_while1};
use nom::character::complete::{char, multispace0, multispace1};
use nom::combinator::map;
use nom::sequence::tuple;
use std::fmt;

/// The `Via` header value.
///
/// Only the `SIP/2.0` protocol version is produced and accepted.
#[derive(Debug, Clone)]
pub struct Via {
    pub transport: BytesStr,
    pub sent_by: HostPort,
    pub params: Params,
}

impl Via {
    pub fn new<T, H>(transport: T, sent_by: H, branch: BytesStr) -> Self
    where
        T: Into<BytesStr>,
        H: Into<HostPort>,
    {
        let mut params = Params::new();
        params.push_or_edit("branch", branch);

        Self {
            transport: transport.into(),
            sent_by: sent_by.into(),
            params,
        }
    }

    pub fn branch(&self) -> Option<&BytesStr> {
        self.params.get_val("branch")
    }
}

impl TypedHeader for Via {
    const NAME: Name = Name::VIA;

    fn parse<'i>(src: &Bytes, i: &'i str) -> IResult<&'i str, Self> {
        map(
            tuple((
                multispace0,
                tag_no_case("SIP"),
                multispace0,
                char('/'),
                multispace0,
                take_while1(|c: char| c.is_ascii_digit() || c == '.'),
                multispace0,
                char('/'),
                multispace0,
                take_while1(|c: char| c.is_alphanumeric()),
                multispace1,
                HostPort::parse(src),
                Params::parse(src),
            )),
            |(_, _, _, _, _, _, _, _, _, transport, _, sent_by, params)| Via {
                transport: slice_str(src, transport),
                sent_by,
                params,
            },
        )(i)
    }
}

impl fmt::Display for Via {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SIP/2.0/{} {}{}", self.transport, self.sent_by, self.params)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::Headers;

    #[test]
    fn parse_via() {
        let mut headers = Headers::new();
        headers.insert(
            Name::VIA,
            "SIP/2.0/UDP 192.168.1.10:5060;branch=z9hG4bK776asdhds;rport",
        );

        let via: Via = headers.typed().unwrap();

        assert_eq!(via.transport, "UDP");
        assert_eq!(via.sent_by.port, Some(5060));
        assert_eq!(via.branch().unwrap(), "z9hG4bK776asdhds");
    }

    #[test]
    fn print_via() {
        let via = Via::new(
            "TCP",
            HostPort::host_name("pbx.example.org"),
            BytesStr::from_static("z9hG4bKabc"),
        );

        assert_eq!(
            via.to_string(),
            "SIP/2.0/TCP pbx.example.org;branch=z9hG4bKabc"
        );
    }

    #[test]
    fn comma_separated_vias() {
        let mut headers = Headers::new();
        headers.insert(
            Name::VIA,
            "SIP/2.0/UDP a.example.org;branch=z9hG4bK1, SIP/2.0/TCP b.example.org;branch=z9hG4bK2",
        );

        let vias: Vec<Via> = headers.typed_list().unwrap();

        assert_eq!(vias.len(), 2);
        assert_eq!(vias[1].transport, "TCP");
    }
}
