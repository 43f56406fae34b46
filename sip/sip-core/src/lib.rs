//! Core of the FlowPBX SIP stack.
//!
//! Implements the transport multiplexer, message tracer and the RFC 3261
//! transaction layer. Higher layers (dialogs, the PBX controller) are built on
//! the [`Endpoint`] type exported here.

use bytes::Bytes;
use downcast_rs::{Downcast, impl_downcast};
use sip_types::header::typed::{CSeq, CallID, FromTo, Via};
use sip_types::header::HeaderError;
use sip_types::msg::{RequestLine, StatusLine};
use sip_types::uri::SipUri;
use sip_types::{Headers, Method, Name};
use std::fmt;
use transaction::{TxInbox, TxKey};
use transport::MessageTpInfo;

mod endpoint;
mod may_claim;
pub mod trace;
pub mod transaction;
pub mod transport;

mod error;

pub use endpoint::{Endpoint, EndpointBuilder};
pub use error::{Error, Result};
pub use may_claim::MayClaim;

/// Basic response
#[derive(Debug, Clone)]
pub struct Response {
    pub line: StatusLine,
    pub headers: Headers,
    pub body: Bytes,
}

impl fmt::Display for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.line.fmt(f)
    }
}

/// Basic request
#[derive(Debug, Clone)]
pub struct Request {
    pub line: RequestLine,
    pub headers: Headers,
    pub body: Bytes,
}

impl Request {
    /// Create an empty request
    pub fn new(method: Method, uri: SipUri) -> Self {
        Self {
            line: RequestLine { method, uri },
            headers: Default::default(),
            body: Bytes::new(),
        }
    }
}

impl fmt::Display for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.line.fmt(f)
    }
}

/// The headers every message must carry, parsed eagerly on receive
#[derive(Debug)]
pub struct BaseHeaders {
    /// All Via headers, guaranteed non-empty
    pub via: Vec<Via>,
    pub from: FromTo,
    pub to: FromTo,
    pub call_id: CallID,
    pub cseq: CSeq,
}

impl BaseHeaders {
    pub fn extract_from(headers: &Headers) -> Result<Self, HeaderError> {
        let via = headers.typed_list::<Via>()?;

        if via.is_empty() {
            return Err(HeaderError::Missing(Name::VIA));
        }

        Ok(BaseHeaders {
            via,
            from: headers.typed()?,
            to: headers.typed_named(&Name::TO)?,
            call_id: headers.typed()?,
            cseq: headers.typed()?,
        })
    }
}

/// Request received by the endpoint, passed to every layer in turn
#[derive(Debug)]
pub struct IncomingRequest {
    pub tp_info: MessageTpInfo,
    pub tx_key: TxKey,
    inbox: Option<TxInbox>,

    pub line: RequestLine,
    pub base_headers: BaseHeaders,
    pub headers: Headers,
    pub body: Bytes,
}

impl fmt::Display for IncomingRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.line.fmt(f)
    }
}

impl IncomingRequest {
    #[track_caller]
    fn take_inbox(&mut self) -> TxInbox {
        self.inbox.take().unwrap_or_else(|| {
            panic!(
                "tried to create a transaction for {:?}, which was already consumed \
                 or is not a transaction creating request",
                self.tx_key
            )
        })
    }

    /// Clone the request data out of the incoming message
    pub fn clone_request(&self) -> Request {
        Request {
            line: self.line.clone(),
            headers: self.headers.clone(),
            body: self.body.clone(),
        }
    }
}

/// Layers extend the endpoint with request handling logic.
///
/// Each is offered incoming out-of-transaction requests in insertion order.
#[async_trait::async_trait]
pub trait Layer: Downcast + Send + Sync + 'static {
    /// Descriptive and unique name of the layer
    fn name(&self) -> &'static str;

    /// Called while building the endpoint; layers may register capabilities
    fn init(&mut self, _endpoint: &mut EndpointBuilder) {}

    /// Offer an incoming request to the layer.
    ///
    /// The request is wrapped in [`MayClaim`], taking it stops the remaining
    /// layers from seeing the request.
    async fn receive(&self, endpoint: &Endpoint, request: MayClaim<'_, IncomingRequest>);
}

impl_downcast!(Layer);
