use bytesstr::BytesStr;
use std::fmt;
use std::hash::{Hash, Hasher};

/// A SIP header name, used as key inside [`Headers`](super::headers::Headers).
///
/// Known names match case-insensitively against their canonical and compact
/// forms. Unknown names are carried verbatim and compared case-insensitively.
#[derive(Debug, Clone)]
pub struct Name(Repr);

macro_rules! header_names {
    ($($print:literal, $ident:ident, [$($parse:literal),+], $konst:ident;)+) => {
        #[derive(Debug, Clone)]
        enum Repr {
            $($ident,)+
            Unknown(BytesStr),
        }

        static NAMES: &[(&str, Name)] = &[
            $($( ($parse, Name::$konst), )*)*
        ];

        impl Name {
            $(pub const $konst: Name = Name(Repr::$ident);)+

            fn from_bytes(name: impl Into<BytesStr> + AsRef<[u8]>) -> Name {
                let slice: &[u8] = name.as_ref();

                for (parse, known) in NAMES {
                    if parse.as_bytes().eq_ignore_ascii_case(slice) {
                        return known.clone();
                    }
                }

                Name(Repr::Unknown(name.into()))
            }

            /// The canonical form used when printing
            pub fn as_print_str(&self) -> &str {
                match &self.0 {
                    $(Repr::$ident => $print,)+
                    Repr::Unknown(name) => name.as_ref(),
                }
            }

            /// All spellings (canonical and compact) this name matches
            pub fn as_parse_strs(&self) -> &[&str] {
                match &self.0 {
                    $(Repr::$ident => &[$($parse),+],)+
                    Repr::Unknown(_) => &[],
                }
            }
        }
    };
}

header_names! {
    "Via", Via, ["via", "v"], VIA;
    "From", From, ["from", "f"], FROM;
    "To", To, ["to", "t"], TO;
    "Call-ID", CallID, ["call-id", "i"], CALL_ID;
    "CSeq", CSeq, ["cseq"], CSEQ;
    "Contact", Contact, ["contact", "m"], CONTACT;
    "Max-Forwards", MaxForwards, ["max-forwards"], MAX_FORWARDS;
    "Content-Length", ContentLength, ["content-length", "l"], CONTENT_LENGTH;
    "Content-Type", ContentType, ["content-type", "c"], CONTENT_TYPE;
    "Expires", Expires, ["expires"], EXPIRES;
    "Min-Expires", MinExpires, ["min-expires"], MIN_EXPIRES;
    "Allow", Allow, ["allow"], ALLOW;
    "Supported", Supported, ["supported", "k"], SUPPORTED;
    "Require", Require, ["require"], REQUIRE;
    "Route", Route, ["route"], ROUTE;
    "Record-Route", RecordRoute, ["record-route"], RECORD_ROUTE;
    "Authorization", Authorization, ["authorization"], AUTHORIZATION;
    "WWW-Authenticate", WwwAuthenticate, ["www-authenticate"], WWW_AUTHENTICATE;
    "Proxy-Authorization", ProxyAuthorization, ["proxy-authorization"], PROXY_AUTHORIZATION;
    "Proxy-Authenticate", ProxyAuthenticate, ["proxy-authenticate"], PROXY_AUTHENTICATE;
    "Authentication-Info", AuthenticationInfo, ["authentication-info"], AUTHENTICATION_INFO;
    "Refer-To", ReferTo, ["refer-to", "r"], REFER_TO;
    "Referred-By", ReferredBy, ["referred-by", "b"], REFERRED_BY;
    "Replaces", Replaces, ["replaces"], REPLACES;
    "Event", Event, ["event", "o"], EVENT;
    "Subscription-State", SubscriptionState, ["subscription-state"], SUBSCRIPTION_STATE;
    "Session-Expires", SessionExpires, ["session-expires", "x"], SESSION_EXPIRES;
    "Min-SE", MinSe, ["min-se"], MIN_SE;
    "Retry-After", RetryAfter, ["retry-after"], RETRY_AFTER;
    "Timestamp", Timestamp, ["timestamp"], TIMESTAMP;
    "User-Agent", UserAgent, ["user-agent"], USER_AGENT;
    "Server", Server, ["server"], SERVER;
    "Reason", Reason, ["reason"], REASON;
    "Accept", Accept, ["accept"], ACCEPT;
}

impl PartialEq for Name {
    fn eq(&self, other: &Self) -> bool {
        match (&self.0, &other.0) {
            (Repr::Unknown(a), Repr::Unknown(b)) => a.eq_ignore_ascii_case(b),
            (Repr::Unknown(_), _) | (_, Repr::Unknown(_)) => false,
            _ => std::mem::discriminant(&self.0) == std::mem::discriminant(&other.0),
        }
    }
}

impl Eq for Name {}

impl Hash for Name {
    fn hash<H: Hasher>(&self, state: &mut H) {
        match &self.0 {
            Repr::Unknown(name) => {
                for b in name.as_str().bytes() {
                    state.write_u8(b.to_ascii_lowercase());
                }
            }
            known => std::mem::discriminant(known).hash(state),
        }
    }
}

impl PartialEq<str> for Name {
    fn eq(&self, other: &str) -> bool {
        if self.as_print_str().eq_ignore_ascii_case(other) {
            return true;
        }

        self.as_parse_strs()
            .iter()
            .any(|s| s.eq_ignore_ascii_case(other))
    }
}

impl<T> From<T> for Name
where
    T: Into<BytesStr> + AsRef<[u8]>,
{
    fn from(name: T) -> Self {
        Name::from_bytes(name)
    }
}

impl fmt::Display for Name {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_print_str())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn compact_forms_resolve() {
        assert_eq!(Name::from("v"), Name::VIA);
        assert_eq!(Name::from("i"), Name::CALL_ID);
        assert_eq!(Name::from("M"), Name::CONTACT);
        assert_eq!(Name::from("CALL-ID"), Name::CALL_ID);
    }

    #[test]
    fn unknown_names_compare_case_insensitively() {
        assert_eq!(Name::from("X-Custom"), Name::from("x-custom"));
        assert_ne!(Name::from("X-Custom"), Name::VIA);
    }
}
