use crate::header::TypedHeader;
use crate::parse::{IResult, slice_str};
use crate::uri::{NameAddr, Params};
use crate::Name;
use bytes::Bytes;
use bytesstr::BytesStr;
use nom::bytes::complete::take_while1;
use nom::combinator::map;
use nom::sequence::tuple;
use std::fmt;

/// The `Refer-To` header (RFC 3515)
#[derive(Debug, Clone)]
pub struct ReferTo {
    pub addr: NameAddr,
    pub params: Params,
}

impl ReferTo {
    /// The embedded `Replaces` value for attended transfer, carried as a
    /// URI header parameter
    pub fn replaces(&self) -> Option<&BytesStr> {
        self.addr.uri.header_params.get_val("Replaces")
    }
}

impl TypedHeader for ReferTo {
    const NAME: Name = Name::REFER_TO;

    fn parse<'i>(src: &Bytes, i: &'i str) -> IResult<&'i str, Self> {
        map(
            tuple((NameAddr::parse(src), Params::parse(src))),
            |(addr, params)| Self { addr, params },
        )(i)
    }
}

impl fmt::Display for ReferTo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.addr, self.params)
    }
}

/// The `Referred-By` header
#[derive(Debug, Clone)]
pub struct ReferredBy(pub NameAddr);

impl TypedHeader for ReferredBy {
    const NAME: Name = Name::REFERRED_BY;

    fn parse<'i>(src: &Bytes, i: &'i str) -> IResult<&'i str, Self> {
        map(NameAddr::parse(src), Self)(i)
    }
}

impl fmt::Display for ReferredBy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The `Replaces` header (RFC 3891)
#[derive(Debug, Clone)]
pub struct Replaces {
    pub call_id: BytesStr,
    pub to_tag: BytesStr,
    pub from_tag: BytesStr,
    pub early_only: bool,
}

impl TypedHeader for Replaces {
    const NAME: Name = Name::REPLACES;

    fn parse<'i>(src: &Bytes, i: &'i str) -> IResult<&'i str, Self> {
        let (i, call_id) =
            take_while1(|c: char| !crate::parse::whitespace(c) && c != ';')(i.trim_start())?;
        let (i, mut params) = Params::parse(src)(i)?;

        let (Some(to_tag), Some(from_tag)) = (params.take("to-tag"), params.take("from-tag"))
        else {
            return Err(nom::Err::Error(nom::error::VerboseError { errors: vec![] }));
        };

        Ok((
            i,
            Self {
                call_id: slice_str(src, call_id),
                to_tag,
                from_tag,
                early_only: params.contains("early-only"),
            },
        ))
    }
}

impl fmt::Display for Replaces {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{};to-tag={};from-tag={}",
            self.call_id, self.to_tag, self.from_tag
        )?;

        if self.early_only {
            f.write_str(";early-only")?;
        }

        Ok(())
    }
}

token_header!(
    /// The `Event` header naming a subscription package
    Event, Name::EVENT
);

/// The `Subscription-State` header used on NOTIFY requests
#[derive(Debug, Clone)]
pub struct SubscriptionState {
    pub state: BytesStr,
    pub params: Params,
}

impl SubscriptionState {
    pub fn active(expires_secs: u32) -> Self {
        let mut params = Params::new();
        params.push_or_edit("expires", expires_secs.to_string());

        Self {
            state: BytesStr::from_static("active"),
            params,
        }
    }

    pub fn terminated(reason: &'static str) -> Self {
        let mut params = Params::new();
        params.push_or_edit("reason", reason);

        Self {
            state: BytesStr::from_static("terminated"),
            params,
        }
    }
}

impl TypedHeader for SubscriptionState {
    const NAME: Name = Name::SUBSCRIPTION_STATE;

    fn parse<'i>(src: &Bytes, i: &'i str) -> IResult<&'i str, Self> {
        map(
            tuple((take_while1(crate::parse::token), Params::parse(src))),
            |(state, params)| Self {
                state: slice_str(src, state),
                params,
            },
        )(i.trim_start())
    }
}

impl fmt::Display for SubscriptionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.state, self.params)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::Headers;

    #[test]
    fn refer_to_with_replaces() {
        let mut headers = Headers::new();
        headers.insert(
            Name::REFER_TO,
            "<sip:carol@example.org?Replaces=abc%40pbx>",
        );

        let refer_to: ReferTo = headers.typed().unwrap();

        assert_eq!(refer_to.addr.uri.user.as_deref(), Some("carol"));
        assert!(refer_to.replaces().is_some());
    }

    #[test]
    fn replaces_header() {
        let mut headers = Headers::new();
        headers.insert(Name::REPLACES, "abc@pbx;to-tag=1;from-tag=2");

        let replaces: Replaces = headers.typed().unwrap();

        assert_eq!(replaces.call_id, "abc@pbx");
        assert_eq!(replaces.to_tag, "1");
        assert_eq!(replaces.from_tag, "2");
        assert!(!replaces.early_only);
    }
}
