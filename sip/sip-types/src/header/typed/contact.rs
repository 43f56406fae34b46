use crate::header::TypedHeader;
use crate::parse::IResult;
use crate::uri::{NameAddr, Params};
use crate::Name;
use bytes::Bytes;
use nom::combinator::map;
use nom::sequence::tuple;
use std::fmt;

/// A single `Contact` header entry.
///
/// The wildcard form (`Contact: *`) used to clear all bindings is not
/// represented here; callers check the raw value for `*` before decoding.
#[derive(Debug, Clone)]
pub struct Contact {
    pub addr: NameAddr,
    pub params: Params,
}

impl Contact {
    pub fn new(addr: NameAddr) -> Self {
        Self {
            addr,
            params: Params::new(),
        }
    }

    /// The per-contact `expires` parameter, if present and well formed
    pub fn expires(&self) -> Option<u32> {
        self.params.get_val("expires")?.parse().ok()
    }
}

impl TypedHeader for Contact {
    const NAME: Name = Name::CONTACT;

    fn parse<'i>(src: &Bytes, i: &'i str) -> IResult<&'i str, Self> {
        map(
            tuple((NameAddr::parse(src), Params::parse(src))),
            |(addr, params)| Contact { addr, params },
        )(i)
    }
}

impl fmt::Display for Contact {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.addr, self.params)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::Headers;

    #[test]
    fn contact_with_expires() {
        let mut headers = Headers::new();
        headers.insert(Name::CONTACT, "<sip:100@10.0.0.42:5060;transport=tcp>;expires=300");

        let contact: Contact = headers.typed().unwrap();

        assert_eq!(contact.expires(), Some(300));
        assert_eq!(contact.addr.uri.transport_param().unwrap(), "tcp");
    }

    #[test]
    fn contact_list() {
        let mut headers = Headers::new();
        headers.insert(
            Name::CONTACT,
            "<sip:100@10.0.0.42>, <sip:100@10.0.0.43;transport=tcp>",
        );

        let contacts: Vec<Contact> = headers.typed_list().unwrap();

        assert_eq!(contacts.len(), 2);
    }
}
