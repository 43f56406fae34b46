//! SIP URI and name-addr types

use crate::host::HostPort;
use crate::parse::{IResult, Parse, parse_quoted, slice_str};
use bytes::Bytes;
use bytesstr::BytesStr;
use nom::branch::alt;
use nom::bytes::complete::{tag, tag_no_case, take_while1};
use nom::character::complete::char;
use nom::combinator::{map, opt};
use nom::multi::many0;
use nom::sequence::{delimited, preceded, separated_pair, terminated, tuple};
use percent_encoding::{AsciiSet, CONTROLS, percent_decode_str, percent_encode};
use std::borrow::Cow;
use std::fmt;

pub mod params;

pub use params::{Param, Params};

const USER_SET: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'<')
    .add(b'>')
    .add(b'@')
    .add(b';')
    .add(b'?')
    .add(b':');

/// A `sip:` / `sips:` URI.
///
/// The deprecated user password field is not modeled, a URI carrying one
/// fails to parse as a SIP URI.
#[derive(Debug, Clone)]
pub struct SipUri {
    pub sips: bool,
    pub user: Option<BytesStr>,
    pub host_port: HostPort,
    pub uri_params: Params,
    pub header_params: Params,
}

impl SipUri {
    pub fn new(host_port: HostPort) -> Self {
        Self {
            sips: false,
            user: None,
            host_port,
            uri_params: Params::new(),
            header_params: Params::new(),
        }
    }

    pub fn sips(mut self, sips: bool) -> Self {
        self.sips = sips;
        self
    }

    pub fn user<U: Into<BytesStr>>(mut self, user: U) -> Self {
        self.user = Some(user.into());
        self
    }

    /// The `transport` uri parameter, if any
    pub fn transport_param(&self) -> Option<&BytesStr> {
        self.uri_params.get_val("transport")
    }

    /// Loose comparison used for dialog matching: scheme, user and host-port
    pub fn compare(&self, other: &Self) -> bool {
        self.sips == other.sips && self.user == other.user && self.host_port == other.host_port
    }

    fn parse_inner<'i>(src: &Bytes, i: &'i str, with_params: bool) -> IResult<&'i str, Self> {
        let (i, sips) = parse_scheme(i)?;
        let (i, user) = opt(terminated(take_while1(user_char), tag("@")))(i)?;

        let user = match user {
            Some(user) => match percent_decode_str(user).decode_utf8() {
                Ok(Cow::Borrowed(slice)) => Some(slice_str(src, slice)),
                Ok(Cow::Owned(owned)) => Some(BytesStr::from(owned)),
                Err(_) => {
                    return Err(nom::Err::Error(nom::error::VerboseError { errors: vec![] }));
                }
            },
            None => None,
        };

        let (i, host_port) = HostPort::parse(src)(i)?;

        if !with_params {
            return Ok((
                i,
                Self {
                    sips,
                    user,
                    host_port,
                    uri_params: Params::new(),
                    header_params: Params::new(),
                },
            ));
        }

        let (i, uri_params) = Params::parse(src)(i)?;
        let (i, header_params) = parse_header_params(src, i)?;

        Ok((
            i,
            Self {
                sips,
                user,
                host_port,
                uri_params,
                header_params,
            },
        ))
    }

    /// Parse a URI without consuming trailing `;param` lists.
    ///
    /// Used for the bare form in From/To/Contact where trailing parameters
    /// belong to the header, not the URI.
    pub fn parse_no_params(src: &Bytes) -> impl Fn(&str) -> IResult<&str, Self> + '_ {
        move |i| Self::parse_inner(src, i, false)
    }
}

impl Parse for SipUri {
    fn parse(src: &Bytes) -> impl Fn(&str) -> IResult<&str, Self> + '_ {
        move |i| Self::parse_inner(src, i, true)
    }
}
impl_from_str!(SipUri);

fn parse_scheme(i: &str) -> IResult<&str, bool> {
    alt((
        map(tag_no_case("sips:"), |_| true),
        map(tag_no_case("sip:"), |_| false),
    ))(i)
}

#[rustfmt::skip]
fn user_char(c: char) -> bool {
    c.is_alphanumeric()
        || matches!(c, '-' | '_' | '.' | '!' | '~' | '*' | '\'' | '(' | ')' | '%'
            | '&' | '=' | '+' | '$' | ',' | ';' | '?' | '/')
}

fn parse_header_params<'i>(src: &Bytes, i: &'i str) -> IResult<&'i str, Params> {
    map(
        opt(preceded(
            char('?'),
            nom::multi::separated_list1(
                char('&'),
                separated_pair(
                    take_while1(header_char),
                    char('='),
                    take_while1(header_char),
                ),
            ),
        )),
        |headers| {
            headers
                .unwrap_or_default()
                .into_iter()
                .map(|(name, value)| Param::new(slice_str(src, name), slice_str(src, value)))
                .collect()
        },
    )(i)
}

fn header_char(c: char) -> bool {
    crate::parse::token(c) || matches!(c, '[' | ']' | ':')
}

impl fmt::Display for SipUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.sips {
            write!(f, "sips:")?;
        } else {
            write!(f, "sip:")?;
        }

        if let Some(user) = &self.user {
            write!(f, "{}@", percent_encode(user.as_ref(), USER_SET))?;
        }

        write!(f, "{}{}", self.host_port, self.uri_params)?;

        for (idx, param) in self.header_params.iter().enumerate() {
            let sep = if idx == 0 { '?' } else { '&' };
            write!(f, "{sep}{param}")?;
        }

        Ok(())
    }
}

/// URI with an optional display name, as used in From/To/Contact/Refer-To
#[derive(Debug, Clone)]
pub struct NameAddr {
    pub display_name: Option<BytesStr>,
    pub uri: SipUri,
}

impl NameAddr {
    pub fn new<N: Into<BytesStr>>(display_name: N, uri: SipUri) -> Self {
        Self {
            display_name: Some(display_name.into()),
            uri,
        }
    }

    pub fn uri(uri: SipUri) -> Self {
        Self {
            display_name: None,
            uri,
        }
    }

    /// Parses the `name-addr / addr-spec` alternatives.
    ///
    /// Parameters following the enclosed `<uri>` form, or any parameters of the
    /// bare form, are left unconsumed for the surrounding header to claim.
    pub fn parse(src: &Bytes) -> impl Fn(&str) -> IResult<&str, Self> + '_ {
        move |i| {
            let i = i.trim_start();

            let (i, display_name) = opt(terminated(
                alt((
                    parse_quoted,
                    take_while1(|c: char| {
                        crate::parse::token(c) || matches!(c, ' ' | '\t')
                    }),
                )),
                nom::combinator::peek(tuple((many0(char(' ')), char('<')))),
            ))(i)?;

            let display_name = display_name
                .map(str::trim_end)
                .filter(|name| !name.is_empty())
                .map(|name| slice_str(src, name));

            if display_name.is_some() || i.trim_start().starts_with('<') {
                let i = i.trim_start();

                let (i, uri) = delimited(char('<'), SipUri::parse(src), char('>'))(i)?;

                Ok((i, Self { display_name, uri }))
            } else {
                let (i, uri) = SipUri::parse_no_params(src)(i)?;

                Ok((i, Self { display_name: None, uri }))
            }
        }
    }
}

impl std::str::FromStr for NameAddr {
    type Err = crate::parse::ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        use nom::Finish;

        let src = BytesStr::from(s);

        NameAddr::parse(src.as_ref())(src.as_str())
            .finish()
            .map(|(_, this)| this)
            .map_err(|_| crate::parse::ParseError("NameAddr"))
    }
}

impl fmt::Display for NameAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(display_name) = &self.display_name {
            write!(f, "\"{display_name}\" ")?;
        }

        write!(f, "<{}>", self.uri)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn parse_sip_uri() {
        let uri = SipUri::from_str("sip:100@pbx.example.org:5060;transport=tcp").unwrap();

        assert!(!uri.sips);
        assert_eq!(uri.user.as_deref(), Some("100"));
        assert_eq!(uri.host_port.port, Some(5060));
        assert_eq!(uri.transport_param().unwrap(), "tcp");
    }

    #[test]
    fn print_sip_uri() {
        let uri = SipUri::new(HostPort::host_name("pbx.example.org")).user("100");

        assert_eq!(uri.to_string(), "sip:100@pbx.example.org");
    }

    #[test]
    fn parse_name_addr_forms() {
        let src = Bytes::from_static(b"\"Alice B\" <sip:alice@example.org>;tag=4711");
        let i = std::str::from_utf8(&src).unwrap();

        let (rest, addr) = NameAddr::parse(&src)(i).unwrap();
        assert_eq!(addr.display_name.as_deref(), Some("Alice B"));
        assert_eq!(addr.uri.user.as_deref(), Some("alice"));
        assert_eq!(rest, ";tag=4711");

        let src = Bytes::from_static(b"sip:bob@example.org;tag=42");
        let i = std::str::from_utf8(&src).unwrap();

        let (rest, addr) = NameAddr::parse(&src)(i).unwrap();
        assert_eq!(addr.display_name, None);
        assert_eq!(addr.uri.user.as_deref(), Some("bob"));
        assert_eq!(rest, ";tag=42");
    }

    #[test]
    fn enclosed_uri_keeps_its_params() {
        let src = Bytes::from_static(b"<sip:bob@example.org;transport=tcp>;expires=60");
        let i = std::str::from_utf8(&src).unwrap();

        let (rest, addr) = NameAddr::parse(&src)(i).unwrap();
        assert_eq!(addr.uri.transport_param().unwrap(), "tcp");
        assert_eq!(rest, ";expires=60");
    }
}
