use crate::parse::{IResult, Parse, slice_str, token};
use bytes::Bytes;
use bytesstr::BytesStr;
use nom::branch::alt;
use nom::bytes::complete::{tag_no_case, take_while1};
use nom::combinator::map;
use std::fmt;

/// A SIP request method.
///
/// Well known methods are available as constants, anything else is carried
/// verbatim in an `Other` representation.
#[derive(Debug, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Method(Repr);

macro_rules! methods {
    ($($print:literal, $ident:ident;)+) => {
        #[derive(Debug, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
        #[allow(clippy::upper_case_acronyms)]
        enum Repr {
            $($ident,)+
            Other(BytesStr),
        }

        impl Method {
            $(pub const $ident: Self = Self(Repr::$ident);)+

            pub fn from_parse(src: &Bytes, slice: &str) -> Self {
                if let Ok((rest, repr)) = alt((
                    $(map(tag_no_case($print), |_| Repr::$ident),)*
                ))(slice) as IResult<&str, Repr> {
                    if rest.is_empty() {
                        return Self(repr);
                    }
                }

                Self(Repr::Other(slice_str(src, slice)))
            }
        }

        impl fmt::Display for Method {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                match &self.0 {
                    $(Repr::$ident => f.write_str($print),)+
                    Repr::Other(other) => f.write_str(other),
                }
            }
        }
    };
}

methods! {
    "INVITE",    INVITE;
    "ACK",       ACK;
    "CANCEL",    CANCEL;
    "BYE",       BYE;
    "REGISTER",  REGISTER;
    "MESSAGE",   MESSAGE;
    "UPDATE",    UPDATE;
    "OPTIONS",   OPTIONS;
    "SUBSCRIBE", SUBSCRIBE;
    "NOTIFY",    NOTIFY;
    "INFO",      INFO;
    "REFER",     REFER;
}

impl Parse for Method {
    fn parse(src: &Bytes) -> impl Fn(&str) -> IResult<&str, Self> + '_ {
        move |i| map(take_while1(token), |slice| Self::from_parse(src, slice))(i)
    }
}
impl_from_str!(Method);

impl From<&str> for Method {
    fn from(s: &str) -> Self {
        let s = BytesStr::from(s);

        Self::from_parse(s.as_ref(), s.as_str())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn known_method() {
        assert_eq!(Method::from_str("INVITE").unwrap(), Method::INVITE);
        assert_eq!(Method::INVITE.to_string(), "INVITE");
    }

    #[test]
    fn other_method() {
        let method: Method = "SOMEOBSCUREMETHOD".parse().unwrap();

        assert_eq!(method.to_string(), "SOMEOBSCUREMETHOD");
        assert_ne!(method, Method::INVITE);
    }

    #[test]
    fn method_prefix_is_not_a_match() {
        let method: Method = "INVITEX".parse().unwrap();

        assert_ne!(method, Method::INVITE);
    }
}
