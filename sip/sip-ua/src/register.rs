//! Outbound REGISTER protocol state, driven by the trunk registrar.
//!
//! Owns the Call-ID, CSeq and tags of the registration "dialog" and computes
//! the effective binding expiry from responses.

use crate::util::{random_call_id, random_sequence_number, random_tag};
use bytesstr::BytesStr;
use sip_core::transaction::TxResponse;
use sip_core::Request;
use sip_types::header::typed::{CSeq, CallID, Contact, Expires, FromTo, MinExpires};
use sip_types::uri::{NameAddr, SipUri};
use sip_types::{Method, Name, StatusCode};
use std::time::Duration;

/// Default requested binding lifetime
pub const DEFAULT_EXPIRY: Duration = Duration::from_secs(300);

/// State of one REGISTER binding towards an upstream registrar
#[derive(Debug)]
pub struct RegisterSession {
    id: NameAddr,
    contact: Contact,
    registrar: SipUri,

    /// The expiry we request, not necessarily what the server grants
    requested_expiry: Duration,

    call_id: CallID,
    from_tag: BytesStr,
    cseq: u32,
}

impl RegisterSession {
    pub fn new(id: NameAddr, contact: Contact, registrar: SipUri, expiry: Duration) -> Self {
        Self {
            id,
            contact,
            registrar,
            requested_expiry: expiry,
            call_id: CallID::new(random_call_id()),
            from_tag: random_tag(),
            cseq: random_sequence_number(),
        }
    }

    pub fn registrar(&self) -> &SipUri {
        &self.registrar
    }

    pub fn contact(&self) -> &Contact {
        &self.contact
    }

    /// Build the next REGISTER request.
    ///
    /// `remove_binding` requests Expires: 0, unbinding the contact.
    pub fn create_register(&mut self, remove_binding: bool) -> Request {
        self.cseq += 1;

        let mut request = Request::new(Method::REGISTER, self.registrar.clone());

        request
            .headers
            .insert_typed(&FromTo::new(self.id.clone(), Some(self.from_tag.clone())));
        request
            .headers
            .insert_typed_named(Name::TO, &FromTo::new(self.id.clone(), None));
        request.headers.insert_typed(&self.call_id);
        request
            .headers
            .insert_typed(&CSeq::new(self.cseq, Method::REGISTER));
        request.headers.insert_typed(&self.contact);

        let expires = if remove_binding {
            0
        } else {
            self.requested_expiry.as_secs() as u32
        };

        request.headers.insert_typed(&Expires(expires));

        request
    }

    /// Extract the granted binding lifetime from a 2xx response.
    ///
    /// The effective value is the smallest of the matching per-contact
    /// `expires` parameter, the top-level Expires header and our own request.
    pub fn receive_success_response(&mut self, response: &TxResponse) -> Duration {
        let mut granted = self.requested_expiry.as_secs() as u32;

        if let Ok(Some(Expires(top_level))) = response.headers.try_typed::<Expires>() {
            granted = granted.min(top_level);
        }

        if let Ok(contacts) = response.headers.typed_list::<Contact>() {
            for contact in contacts {
                let matches = contact
                    .addr
                    .uri
                    .compare(&self.contact.addr.uri);

                if matches {
                    if let Some(expires) = contact.expires() {
                        granted = granted.min(expires);
                    }
                }
            }
        }

        Duration::from_secs(u64::from(granted))
    }

    /// Digest a failure response.
    ///
    /// Returns `true` when the registration should be retried immediately
    /// with adjusted parameters (423 Interval Too Brief).
    pub fn receive_error_response(&mut self, response: &TxResponse) -> bool {
        if response.line.code == StatusCode::INTERVAL_TOO_BRIEF {
            if let Ok(Some(MinExpires(min))) = response.headers.try_typed::<MinExpires>() {
                self.requested_expiry = Duration::from_secs(u64::from(min));
                return true;
            }
        }

        false
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use sip_types::header::typed::ContentLength;

    fn session() -> RegisterSession {
        let registrar: SipUri = "sip:sip.provider.example".parse().unwrap();
        let id = NameAddr::uri(registrar.clone().user("trunk1"));
        let contact = Contact::new(NameAddr::uri(
            "sip:trunk1@203.0.113.7:5060".parse().unwrap(),
        ));

        RegisterSession::new(id, contact, registrar, DEFAULT_EXPIRY)
    }

    #[test]
    fn register_request_shape() {
        let mut session = session();

        let request = session.create_register(false);

        assert_eq!(request.line.method, Method::REGISTER);
        assert_eq!(
            request.headers.typed::<Expires>().unwrap(),
            Expires(300)
        );

        let from: FromTo = request.headers.typed().unwrap();
        let to: FromTo = request.headers.typed_named(&Name::TO).unwrap();

        assert!(from.tag.is_some());
        assert!(to.tag.is_none());
    }

    #[test]
    fn cseq_increments_per_request() {
        let mut session = session();

        let first: CSeq = session
            .create_register(false)
            .headers
            .typed()
            .unwrap();
        let second: CSeq = session
            .create_register(false)
            .headers
            .typed()
            .unwrap();

        assert_eq!(second.cseq, first.cseq + 1);
    }

    #[test]
    fn remove_binding_requests_zero_expiry() {
        let mut session = session();

        let request = session.create_register(true);

        assert_eq!(request.headers.typed::<Expires>().unwrap(), Expires(0));
    }

    #[test]
    fn interval_too_brief_adjusts_expiry() {
        let mut session = session();

        let mut headers = sip_types::Headers::new();
        headers.insert_typed(&MinExpires(600));
        headers.insert_typed(&ContentLength(0));

        let response = test_response(StatusCode::INTERVAL_TOO_BRIEF, headers);

        assert!(session.receive_error_response(&response));

        let request = session.create_register(false);
        assert_eq!(request.headers.typed::<Expires>().unwrap(), Expires(600));
    }

    fn test_response(code: StatusCode, headers: sip_types::Headers) -> TxResponse {
        use sip_core::transport::{Direction, MessageTpInfo, TpHandle, Transport};
        use sip_types::msg::StatusLine;
        use std::net::SocketAddr;

        #[derive(Debug)]
        struct NullTransport;

        impl std::fmt::Display for NullTransport {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str("null")
            }
        }

        #[async_trait::async_trait]
        impl Transport for NullTransport {
            fn name(&self) -> &'static str {
                "UDP"
            }
            fn secure(&self) -> bool {
                false
            }
            fn reliable(&self) -> bool {
                false
            }
            fn bound(&self) -> SocketAddr {
                "127.0.0.1:5060".parse().unwrap()
            }
            fn sent_by(&self) -> SocketAddr {
                self.bound()
            }
            fn direction(&self) -> Direction {
                Direction::None
            }
            async fn send(&self, _: &[u8], _: SocketAddr) -> std::io::Result<()> {
                Ok(())
            }
        }

        let mut all = sip_types::Headers::new();
        all.insert(
            Name::VIA,
            "SIP/2.0/UDP 203.0.113.7:5060;branch=z9hG4bKtest",
        );
        all.insert(Name::FROM, "<sip:trunk1@sip.provider.example>;tag=a");
        all.insert(Name::TO, "<sip:trunk1@sip.provider.example>;tag=b");
        all.insert(Name::CALL_ID, "test-call-id");
        all.insert(Name::CSEQ, "1 REGISTER");

        for (name, value) in headers.iter() {
            all.insert(name.clone(), value.clone());
        }

        let base_headers = sip_core::BaseHeaders::extract_from(&all).unwrap();

        TxResponse {
            tp_info: MessageTpInfo {
                timestamp: std::time::SystemTime::now(),
                source: "198.51.100.1:5060".parse().unwrap(),
                buffer: bytes::Bytes::new(),
                transport: TpHandle::new(NullTransport),
            },
            line: StatusLine { code, reason: None },
            base_headers,
            headers: all,
            body: bytes::Bytes::new(),
        }
    }
}
