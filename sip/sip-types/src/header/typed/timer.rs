use crate::header::TypedHeader;
use crate::parse::IResult;
use crate::uri::Params;
use crate::Name;
use bytes::Bytes;
use nom::character::complete::u32;
use nom::combinator::map;
use nom::sequence::tuple;
use std::fmt;

/// Which side refreshes a session (RFC 4028)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Refresher {
    Unspecified,
    Uac,
    Uas,
}

impl fmt::Display for Refresher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Refresher::Unspecified => Ok(()),
            Refresher::Uac => f.write_str(";refresher=uac"),
            Refresher::Uas => f.write_str(";refresher=uas"),
        }
    }
}

/// The `Session-Expires` header (RFC 4028)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionExpires {
    pub delta_secs: u32,
    pub refresher: Refresher,
}

impl TypedHeader for SessionExpires {
    const NAME: Name = Name::SESSION_EXPIRES;

    fn parse<'i>(src: &Bytes, i: &'i str) -> IResult<&'i str, Self> {
        map(
            tuple((u32, Params::parse(src))),
            |(delta_secs, params)| {
                let refresher = match params.get_val("refresher").map(|v| v.as_str()) {
                    Some(v) if v.eq_ignore_ascii_case("uac") => Refresher::Uac,
                    Some(v) if v.eq_ignore_ascii_case("uas") => Refresher::Uas,
                    _ => Refresher::Unspecified,
                };

                SessionExpires {
                    delta_secs,
                    refresher,
                }
            },
        )(i.trim_start())
    }
}

impl fmt::Display for SessionExpires {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.delta_secs, self.refresher)
    }
}

uint_header!(
    /// The `Min-SE` header (RFC 4028)
    MinSe, Name::MIN_SE
);

#[cfg(test)]
mod test {
    use super::*;
    use crate::Headers;

    #[test]
    fn session_expires() {
        let mut headers = Headers::new();
        headers.insert(Name::SESSION_EXPIRES, "1800;refresher=uas");

        let se: SessionExpires = headers.typed().unwrap();

        assert_eq!(se.delta_secs, 1800);
        assert_eq!(se.refresher, Refresher::Uas);
        assert_eq!(se.to_string(), "1800;refresher=uas");
    }
}
