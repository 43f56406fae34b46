//! [`Host`] and [`HostPort`] as found in URIs and the Via header

use crate::parse::{IResult, Parse, slice_str};
use bytesstr::BytesStr;
use nom::AsChar;
use nom::branch::alt;
use nom::bytes::complete::{tag, take_while, take_while1};
use nom::character::complete::{char, u8};
use nom::combinator::{map, map_res, opt, recognize, verify};
use nom::multi::many0;
use nom::sequence::{delimited, preceded, tuple};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::num::ParseIntError;

/// Either IP address or FQDN
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Host {
    Ip6(Ipv6Addr),
    Ip4(Ipv4Addr),
    Name(BytesStr),
}

impl Parse for Host {
    fn parse(src: &bytes::Bytes) -> impl Fn(&str) -> IResult<&str, Self> + '_ {
        move |i| {
            alt((
                map_res(ip6_reference, |ip6| ip6.parse().map(Self::Ip6)),
                map_res(ip4_address, |ip4| ip4.parse().map(Self::Ip4)),
                map(hostname, |name| Self::Name(slice_str(src, name))),
            ))(i)
        }
    }
}
impl_from_str!(Host);

/// IPv4address = 1*3DIGIT "." 1*3DIGIT "." 1*3DIGIT "." 1*3DIGIT
fn ip4_address(i: &str) -> IResult<&str, &str> {
    recognize(tuple((u8, char('.'), u8, char('.'), u8, char('.'), u8)))(i)
}

/// IPv6reference = "[" IPv6address "]"
fn ip6_reference(i: &str) -> IResult<&str, &str> {
    delimited(char('['), ip6_address, char(']'))(i)
}

fn ip6_address(i: &str) -> IResult<&str, &str> {
    take_while1(|c: char| c.is_hex_digit() || matches!(c, ':' | '.'))(i)
}

/// Relaxed hostname parsing, the strict SIP ABNF rejects some modern DNS names.
fn hostname(i: &str) -> IResult<&str, &str> {
    recognize(tuple((label, many0(tuple((char('.'), label))), opt(char('.')))))(i)
}

fn label(i: &str) -> IResult<&str, &str> {
    verify(
        take_while1(|c: char| c.is_alphanum() || c == '-'),
        |label: &str| !(label.starts_with('-') || label.ends_with('-')),
    )(i)
}

impl From<IpAddr> for Host {
    fn from(addr: IpAddr) -> Self {
        match addr {
            IpAddr::V4(addr) => Host::Ip4(addr),
            IpAddr::V6(addr) => Host::Ip6(addr),
        }
    }
}

impl fmt::Display for Host {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Host::Ip6(addr) => write!(f, "[{addr}]"),
            Host::Ip4(addr) => write!(f, "{addr}"),
            Host::Name(name) => f.write_str(name),
        }
    }
}

/// [`Host`] paired with an optional port
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct HostPort {
    pub host: Host,
    pub port: Option<u16>,
}

impl HostPort {
    /// Returns `Some` if the host part is an ip-address
    pub fn ip(&self) -> Option<IpAddr> {
        match self.host {
            Host::Ip4(ip) => Some(IpAddr::V4(ip)),
            Host::Ip6(ip) => Some(IpAddr::V6(ip)),
            Host::Name(_) => None,
        }
    }

    pub fn host_name<S: Into<BytesStr>>(name: S) -> HostPort {
        HostPort {
            host: Host::Name(name.into()),
            port: None,
        }
    }
}

impl Parse for HostPort {
    fn parse(src: &bytes::Bytes) -> impl Fn(&str) -> IResult<&str, Self> + '_ {
        move |i| {
            map_res(
                tuple((
                    Host::parse(src),
                    opt(preceded(tag(":"), take_while(char::is_dec_digit))),
                )),
                |(host, port): (Host, Option<&str>)| -> Result<_, ParseIntError> {
                    Ok(HostPort {
                        host,
                        port: port.map(str::parse).transpose()?,
                    })
                },
            )(i)
        }
    }
}
impl_from_str!(HostPort);

impl From<SocketAddr> for HostPort {
    fn from(addr: SocketAddr) -> Self {
        HostPort {
            host: addr.ip().into(),
            port: Some(addr.port()),
        }
    }
}

impl fmt::Display for HostPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.host)?;

        if let Some(port) = self.port {
            write!(f, ":{port}")?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::str::FromStr;

    #[track_caller]
    fn expect_hostname(i: &'static str) {
        assert_eq!(HostPort::from_str(i).unwrap(), HostPort::host_name(i));
    }

    #[test]
    fn host() {
        expect_hostname("example.org");
        expect_hostname("123.123.123.321");
        expect_hostname("very.long.hostname.example.org.");

        assert_eq!(
            HostPort::from_str("10.0.0.42:5060").unwrap(),
            HostPort {
                host: Host::Ip4("10.0.0.42".parse().unwrap()),
                port: Some(5060),
            }
        );

        assert_eq!(
            HostPort::from_str("[2001:db8::1:2]").unwrap(),
            HostPort {
                host: Host::Ip6("2001:db8::1:2".parse().unwrap()),
                port: None,
            }
        );
    }
}
