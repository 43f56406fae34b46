//! `WWW-Authenticate` / `Authorization` header values (RFC 7616 digest)

use crate::header::TypedHeader;
use crate::parse::{IResult, parse_quoted, slice_str, token};
use crate::uri::Param;
use crate::Name;
use bytes::Bytes;
use bytesstr::BytesStr;
use nom::branch::alt;
use nom::bytes::complete::take_while1;
use nom::character::complete::{char, multispace0, multispace1};
use nom::combinator::map;
use nom::multi::separated_list1;
use nom::sequence::{delimited, separated_pair, tuple};
use std::fmt;

/// The qop value this stack offers and accepts
pub const QOP_AUTH: &str = "auth";

/// Digest algorithm negotiated between challenge and response
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Algorithm {
    Md5,
    Sha256,
    Other(BytesStr),
}

impl Algorithm {
    fn from_value(value: &BytesStr) -> Self {
        if value.eq_ignore_ascii_case("MD5") {
            Self::Md5
        } else if value.eq_ignore_ascii_case("SHA-256") {
            Self::Sha256
        } else {
            Self::Other(value.clone())
        }
    }
}

impl fmt::Display for Algorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Algorithm::Md5 => f.write_str("MD5"),
            Algorithm::Sha256 => f.write_str("SHA-256"),
            Algorithm::Other(other) => f.write_str(other),
        }
    }
}

/// A digest challenge as carried in `WWW-Authenticate` / `Proxy-Authenticate`
#[derive(Debug, Clone)]
pub struct DigestChallenge {
    pub realm: BytesStr,
    pub nonce: BytesStr,
    pub opaque: Option<BytesStr>,
    pub stale: bool,
    pub algorithm: Algorithm,
    pub qop: Vec<BytesStr>,
    pub other: Vec<Param>,
}

/// Any authentication challenge; non-digest schemes are carried opaquely
#[derive(Debug, Clone)]
pub enum AuthChallenge {
    Digest(DigestChallenge),
    Other { scheme: BytesStr, params: BytesStr },
}

impl TypedHeader for AuthChallenge {
    const NAME: Name = Name::WWW_AUTHENTICATE;

    fn parse<'i>(src: &Bytes, i: &'i str) -> IResult<&'i str, Self> {
        let (rest, (scheme, params)) = parse_scheme_and_params(src, i)?;

        if !scheme.eq_ignore_ascii_case("Digest") {
            return Ok((
                rest,
                Self::Other {
                    scheme,
                    params: slice_str(src, i),
                },
            ));
        }

        let mut challenge = DigestChallenge {
            realm: BytesStr::from_static(""),
            nonce: BytesStr::from_static(""),
            opaque: None,
            stale: false,
            algorithm: Algorithm::Md5,
            qop: Vec::new(),
            other: Vec::new(),
        };

        for (name, value) in params {
            if name.eq_ignore_ascii_case("realm") {
                challenge.realm = value;
            } else if name.eq_ignore_ascii_case("nonce") {
                challenge.nonce = value;
            } else if name.eq_ignore_ascii_case("opaque") {
                challenge.opaque = Some(value);
            } else if name.eq_ignore_ascii_case("stale") {
                challenge.stale = value.eq_ignore_ascii_case("true");
            } else if name.eq_ignore_ascii_case("algorithm") {
                challenge.algorithm = Algorithm::from_value(&value);
            } else if name.eq_ignore_ascii_case("qop") {
                challenge.qop = value
                    .as_str()
                    .split(',')
                    .map(|qop| BytesStr::from(qop.trim()))
                    .collect();
            } else {
                challenge.other.push(Param::new(name, value));
            }
        }

        Ok((rest, Self::Digest(challenge)))
    }
}

impl fmt::Display for AuthChallenge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthChallenge::Digest(digest) => {
                write!(
                    f,
                    "Digest realm=\"{}\", nonce=\"{}\", algorithm={}",
                    digest.realm, digest.nonce, digest.algorithm
                )?;

                if !digest.qop.is_empty() {
                    write!(f, ", qop=\"")?;
                    for (idx, qop) in digest.qop.iter().enumerate() {
                        if idx > 0 {
                            f.write_str(",")?;
                        }
                        f.write_str(qop)?;
                    }
                    f.write_str("\"")?;
                }

                if digest.stale {
                    f.write_str(", stale=true")?;
                }

                if let Some(opaque) = &digest.opaque {
                    write!(f, ", opaque=\"{opaque}\"")?;
                }

                for param in &digest.other {
                    write!(f, ", {param}")?;
                }

                Ok(())
            }
            AuthChallenge::Other { params, .. } => f.write_str(params),
        }
    }
}

/// A digest response as carried in `Authorization` / `Proxy-Authorization`
#[derive(Debug, Clone)]
pub struct DigestResponse {
    pub username: BytesStr,
    pub realm: BytesStr,
    pub nonce: BytesStr,
    pub uri: BytesStr,
    pub response: BytesStr,
    pub algorithm: Algorithm,
    pub opaque: Option<BytesStr>,
    pub qop: Option<BytesStr>,
    pub cnonce: Option<BytesStr>,
    pub nc: Option<u32>,
}

/// Any authorization header value; non-digest schemes are carried opaquely
#[derive(Debug, Clone)]
pub enum AuthResponse {
    Digest(DigestResponse),
    Other { scheme: BytesStr, params: BytesStr },
}

impl TypedHeader for AuthResponse {
    const NAME: Name = Name::AUTHORIZATION;

    fn parse<'i>(src: &Bytes, i: &'i str) -> IResult<&'i str, Self> {
        let (rest, (scheme, params)) = parse_scheme_and_params(src, i)?;

        if !scheme.eq_ignore_ascii_case("Digest") {
            return Ok((
                rest,
                Self::Other {
                    scheme,
                    params: slice_str(src, i),
                },
            ));
        }

        let mut response = DigestResponse {
            username: BytesStr::from_static(""),
            realm: BytesStr::from_static(""),
            nonce: BytesStr::from_static(""),
            uri: BytesStr::from_static(""),
            response: BytesStr::from_static(""),
            algorithm: Algorithm::Md5,
            opaque: None,
            qop: None,
            cnonce: None,
            nc: None,
        };

        for (name, value) in params {
            if name.eq_ignore_ascii_case("username") {
                response.username = value;
            } else if name.eq_ignore_ascii_case("realm") {
                response.realm = value;
            } else if name.eq_ignore_ascii_case("nonce") {
                response.nonce = value;
            } else if name.eq_ignore_ascii_case("uri") {
                response.uri = value;
            } else if name.eq_ignore_ascii_case("response") {
                response.response = value;
            } else if name.eq_ignore_ascii_case("algorithm") {
                response.algorithm = Algorithm::from_value(&value);
            } else if name.eq_ignore_ascii_case("opaque") {
                response.opaque = Some(value);
            } else if name.eq_ignore_ascii_case("qop") {
                response.qop = Some(value);
            } else if name.eq_ignore_ascii_case("cnonce") {
                response.cnonce = Some(value);
            } else if name.eq_ignore_ascii_case("nc") {
                response.nc = u32::from_str_radix(value.as_str(), 16).ok();
            }
        }

        Ok((rest, Self::Digest(response)))
    }
}

impl fmt::Display for AuthResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthResponse::Digest(digest) => {
                write!(
                    f,
                    "Digest username=\"{}\", realm=\"{}\", nonce=\"{}\", uri=\"{}\", response=\"{}\", algorithm={}",
                    digest.username,
                    digest.realm,
                    digest.nonce,
                    digest.uri,
                    digest.response,
                    digest.algorithm,
                )?;

                if let Some(cnonce) = &digest.cnonce {
                    write!(f, ", cnonce=\"{cnonce}\"")?;
                }

                if let Some(qop) = &digest.qop {
                    write!(f, ", qop={qop}")?;
                }

                if let Some(nc) = digest.nc {
                    write!(f, ", nc={nc:08x}")?;
                }

                if let Some(opaque) = &digest.opaque {
                    write!(f, ", opaque=\"{opaque}\"")?;
                }

                Ok(())
            }
            AuthResponse::Other { params, .. } => f.write_str(params),
        }
    }
}

type AuthParams = Vec<(BytesStr, BytesStr)>;

fn parse_scheme_and_params<'i>(
    src: &Bytes,
    i: &'i str,
) -> IResult<&'i str, (BytesStr, AuthParams)> {
    map(
        tuple((
            take_while1(token),
            multispace1,
            separated_list1(
                delimited(multispace0, char(','), multispace0),
                separated_pair(
                    take_while1(token),
                    delimited(multispace0, char('='), multispace0),
                    alt((parse_quoted, take_while1(auth_token))),
                ),
            ),
        )),
        |(scheme, _, params)| {
            (
                slice_str(src, scheme),
                params
                    .into_iter()
                    .map(|(name, value)| (slice_str(src, name), slice_str(src, value)))
                    .collect(),
            )
        },
    )(i.trim_start())
}

fn auth_token(c: char) -> bool {
    token(c) || c == '/'
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::Headers;

    #[test]
    fn parse_challenge() {
        let mut headers = Headers::new();
        headers.insert(
            Name::WWW_AUTHENTICATE,
            "Digest realm=\"flowpbx\", nonce=\"YWmh5GFpoLji\", algorithm=SHA-256, qop=\"auth\"",
        );

        let challenge: AuthChallenge = headers.typed().unwrap();

        let AuthChallenge::Digest(digest) = challenge else {
            panic!("expected digest challenge");
        };

        assert_eq!(digest.realm, "flowpbx");
        assert_eq!(digest.nonce, "YWmh5GFpoLji");
        assert_eq!(digest.algorithm, Algorithm::Sha256);
        assert_eq!(digest.qop, vec![BytesStr::from_static("auth")]);
        assert!(!digest.stale);
    }

    #[test]
    fn challenge_roundtrip() {
        let challenge = AuthChallenge::Digest(DigestChallenge {
            realm: "flowpbx".into(),
            nonce: "abcdef".into(),
            opaque: None,
            stale: true,
            algorithm: Algorithm::Md5,
            qop: vec![BytesStr::from_static("auth")],
            other: vec![],
        });

        let mut headers = Headers::new();
        headers.insert_typed(&challenge);

        let parsed: AuthChallenge = headers.typed().unwrap();
        let AuthChallenge::Digest(digest) = parsed else {
            panic!("expected digest challenge");
        };

        assert!(digest.stale);
        assert_eq!(digest.algorithm, Algorithm::Md5);
    }

    #[test]
    fn parse_response_with_qop() {
        let mut headers = Headers::new();
        headers.insert(
            Name::AUTHORIZATION,
            "Digest username=\"100\", realm=\"flowpbx\", nonce=\"xyz\", uri=\"sip:pbx\", \
             response=\"6629fae49393a05397450978507c4ef1\", algorithm=MD5, \
             cnonce=\"0a4f113b\", qop=auth, nc=00000001",
        );

        let response: AuthResponse = headers.typed().unwrap();

        let AuthResponse::Digest(digest) = response else {
            panic!("expected digest response");
        };

        assert_eq!(digest.username, "100");
        assert_eq!(digest.nc, Some(1));
        assert_eq!(digest.qop.as_deref(), Some("auth"));
    }
}
