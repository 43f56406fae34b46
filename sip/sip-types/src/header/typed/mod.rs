//! Typed representations of the headers the stack inspects

macro_rules! uint_header {
    ($(#[$meta:meta])* $struct_name:ident, $header_name:expr) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct $struct_name(pub u32);

        impl $crate::header::TypedHeader for $struct_name {
            const NAME: $crate::Name = $header_name;

            fn parse<'i>(
                _: &bytes::Bytes,
                i: &'i str,
            ) -> $crate::parse::IResult<&'i str, Self> {
                nom::combinator::map(nom::character::complete::u32, Self)(i.trim_start())
            }
        }

        impl std::fmt::Display for $struct_name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

macro_rules! token_header {
    ($(#[$meta:meta])* $struct_name:ident, $header_name:expr) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct $struct_name(pub bytesstr::BytesStr);

        impl $crate::header::TypedHeader for $struct_name {
            const NAME: $crate::Name = $header_name;

            fn parse<'i>(
                src: &bytes::Bytes,
                i: &'i str,
            ) -> $crate::parse::IResult<&'i str, Self> {
                nom::combinator::map(
                    nom::bytes::complete::take_while1($crate::parse::token),
                    |token| Self($crate::parse::slice_str(src, token)),
                )(i.trim_start())
            }
        }

        impl std::fmt::Display for $struct_name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(&self.0)
            }
        }
    };
}

mod auth;
mod call_id;
mod contact;
mod content;
mod cseq;
mod from_to;
mod refer;
mod simple;
mod timer;
mod via;

pub use auth::{
    Algorithm, AuthChallenge, AuthResponse, DigestChallenge, DigestResponse, QOP_AUTH,
};
pub use call_id::CallID;
pub use contact::Contact;
pub use content::{ContentLength, ContentType};
pub use cseq::CSeq;
pub use from_to::FromTo;
pub use refer::{Event, Replaces, ReferTo, ReferredBy, SubscriptionState};
pub use simple::{Allow, Expires, MaxForwards, MinExpires, Require, RetryAfter, Supported};
pub use timer::{MinSe, Refresher, SessionExpires};
pub use via::Via;
