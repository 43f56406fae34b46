//! Dialog state and the endpoint layer routing in-dialog requests.
//!
//! A [`Dialog`] owns the identifiers and sequence state of one SIP dialog.
//! Interested parties (INVITE sessions, subscriptions) register a [`Usage`]
//! under the dialog's key; the [`DialogLayer`] offers every in-dialog request
//! to the registered usages. When the last usage is dropped the dialog
//! vanishes from the registry.

use crate::util::{random_call_id, random_tag};
use bytesstr::BytesStr;
use parking_lot::Mutex;
use sip_core::transaction::TxResponse;
use sip_core::transport::{OutgoingResponse, TargetTransportInfo};
use sip_core::{Endpoint, IncomingRequest, Layer, MayClaim, Request, Result};
use sip_types::header::typed::{CSeq, CallID, Contact, FromTo};
use sip_types::header::HeaderError;
use sip_types::uri::{NameAddr, SipUri};
use sip_types::{CodeKind, Method, Name, StatusCode};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

mod key;

pub use key::DialogKey;

/// Which end of the dialog this endpoint is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DialogRole {
    Uac,
    Uas,
}

/// Lifecycle of a dialog
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DialogState {
    Early,
    Confirmed,
    Terminated,
}

/// One SIP dialog's identifiers and sequencing state
#[derive(Debug)]
pub struct Dialog {
    pub endpoint: Endpoint,
    pub role: DialogRole,

    pub call_id: CallID,

    /// Local From/To value carrying the local tag
    pub local_fromto: FromTo,
    /// Peer From/To value carrying the peer tag (absent while a UAC dialog
    /// has not seen a tagged response)
    pub peer_fromto: FromTo,

    pub local_contact: Contact,
    /// Target for in-dialog requests, the peer's contact
    pub peer_contact: Contact,

    /// Raw Route header values to insert into in-dialog requests
    pub route_set: Vec<BytesStr>,

    pub secure: bool,

    local_cseq: AtomicU32,
    peer_cseq: AtomicU32,

    state: Mutex<DialogState>,

    /// Pinned transport target for in-dialog requests
    pub target_tp_info: tokio::sync::Mutex<TargetTransportInfo>,
}

impl Dialog {
    /// Create the UAS side dialog from an incoming INVITE.
    ///
    /// Generates the local tag; the route set is taken from Record-Route as
    /// received, the target from the peer's Contact.
    pub fn new_server(
        endpoint: Endpoint,
        invite: &IncomingRequest,
        local_contact: Contact,
    ) -> Result<Self, HeaderError> {
        let peer_contact: Contact = invite.headers.typed()?;

        let mut local_fromto = invite.base_headers.to.clone();
        local_fromto.tag = Some(random_tag());

        let route_set = invite
            .headers
            .get_all(&Name::RECORD_ROUTE)
            .cloned()
            .collect();

        let mut target_tp_info = TargetTransportInfo::default();
        target_tp_info.transport = Some((
            invite.tp_info.transport.clone(),
            invite.tp_info.source,
        ));

        Ok(Self {
            endpoint,
            role: DialogRole::Uas,
            call_id: invite.base_headers.call_id.clone(),
            local_fromto,
            peer_fromto: invite.base_headers.from.clone(),
            local_contact,
            peer_contact,
            route_set,
            secure: invite.line.uri.sips,
            local_cseq: AtomicU32::new(crate::random_sequence_number()),
            peer_cseq: AtomicU32::new(invite.base_headers.cseq.cseq),
            state: Mutex::new(DialogState::Early),
            target_tp_info: tokio::sync::Mutex::new(target_tp_info),
        })
    }

    pub fn key(&self) -> DialogKey {
        DialogKey {
            call_id: self.call_id.0.clone(),
            local_tag: self
                .local_fromto
                .tag
                .clone()
                .expect("local side always has a tag"),
            peer_tag: self.peer_fromto.tag.clone(),
        }
    }

    pub fn state(&self) -> DialogState {
        *self.state.lock()
    }

    pub fn set_state(&self, state: DialogState) {
        *self.state.lock() = state;
    }

    /// Build an in-dialog request with the next local CSeq
    pub fn create_request(&self, method: Method) -> Request {
        let cseq = self.local_cseq.fetch_add(1, Ordering::Relaxed) + 1;

        let mut request = Request::new(method.clone(), self.peer_contact.addr.uri.clone());

        request.headers.insert_typed(&self.local_fromto);
        request
            .headers
            .insert_typed_named(Name::TO, &self.peer_fromto);
        request.headers.insert_typed(&self.call_id);
        request.headers.insert_typed(&CSeq::new(cseq, method));
        request.headers.insert_typed(&self.local_contact);

        for route in &self.route_set {
            request.headers.insert(Name::ROUTE, route.clone());
        }

        request
    }

    /// Build a response within this dialog; dialog-establishing responses to
    /// an INVITE get the local tag and Contact
    pub fn create_response(
        &self,
        request: &IncomingRequest,
        code: StatusCode,
        reason: Option<BytesStr>,
    ) -> Result<OutgoingResponse> {
        let mut response = self.endpoint.create_response(request, code, reason);

        let mut to = request.base_headers.to.clone();
        to.tag = self.local_fromto.tag.clone();
        response.msg.headers.remove(&Name::TO);
        response.msg.headers.insert_typed_named(Name::TO, &to);

        let establishes = request.line.method == Method::INVITE
            && matches!(code.kind(), CodeKind::Provisional | CodeKind::Success)
            && code != StatusCode::TRYING;

        if establishes || request.line.method == Method::UPDATE {
            response.msg.headers.insert_typed(&self.local_contact);
        }

        Ok(response)
    }

    /// Validate and record the CSeq of an incoming in-dialog request.
    ///
    /// Requests must arrive with strictly increasing sequence numbers; ACK
    /// and CANCEL share the INVITE's number.
    pub fn validate_peer_cseq(&self, request: &IncomingRequest) -> bool {
        let cseq = request.base_headers.cseq.cseq;
        let method = &request.line.method;

        if *method == Method::ACK || *method == Method::CANCEL {
            return cseq <= self.peer_cseq.load(Ordering::Relaxed);
        }

        let last = self.peer_cseq.load(Ordering::Relaxed);

        if cseq > last {
            self.peer_cseq.store(cseq, Ordering::Relaxed);
            true
        } else {
            false
        }
    }

    /// Register a usage; the dialog stays routable while at least one usage
    /// guard is alive
    pub fn register_usage<U: Usage>(&self, usage: U) -> UsageGuard {
        register_usage(self.endpoint.clone(), self.key(), usage)
    }
}

/// Builds the UAC side of a dialog while it is still forming
#[derive(Debug)]
pub struct ClientDialogBuilder {
    pub endpoint: Endpoint,
    pub local_fromto: FromTo,
    pub peer_fromto: FromTo,
    pub local_contact: Contact,
    pub call_id: CallID,
    pub target: SipUri,
    pub cseq: AtomicU32,
    pub target_tp_info: TargetTransportInfo,
}

impl ClientDialogBuilder {
    pub fn new(
        endpoint: Endpoint,
        local_addr: NameAddr,
        local_contact: Contact,
        target: SipUri,
    ) -> Self {
        let local_fromto = FromTo::new(local_addr, Some(random_tag()));
        let peer_fromto = FromTo::new(NameAddr::uri(target.clone()), None);

        Self {
            endpoint,
            local_fromto,
            peer_fromto,
            local_contact,
            call_id: CallID::new(random_call_id()),
            target,
            cseq: AtomicU32::new(crate::random_sequence_number()),
            target_tp_info: TargetTransportInfo::default(),
        }
    }

    pub fn create_request(&mut self, method: Method) -> Request {
        let cseq = self.cseq.fetch_add(1, Ordering::Relaxed) + 1;

        let mut request = Request::new(method.clone(), self.target.clone());

        request.headers.insert_typed(&self.local_fromto);
        request
            .headers
            .insert_typed_named(Name::TO, &self.peer_fromto);
        request.headers.insert_typed(&self.call_id);
        request.headers.insert_typed(&CSeq::new(cseq, method));
        request.headers.insert_typed(&self.local_contact);

        request
    }

    /// Create the dialog once a response carrying a To tag arrived
    pub fn create_dialog_from_response(&self, response: &TxResponse) -> Result<Dialog> {
        let peer_contact: Contact = response.headers.typed()?;

        // RFC 3261 §12.1.2: the UAC route set is the Record-Route set reversed
        let route_set = response
            .headers
            .get_all(&Name::RECORD_ROUTE)
            .cloned()
            .collect::<Vec<_>>()
            .into_iter()
            .rev()
            .collect();

        Ok(Dialog {
            endpoint: self.endpoint.clone(),
            role: DialogRole::Uac,
            call_id: self.call_id.clone(),
            local_fromto: self.local_fromto.clone(),
            peer_fromto: response.base_headers.to.clone(),
            local_contact: self.local_contact.clone(),
            peer_contact,
            route_set,
            secure: self.target.sips,
            local_cseq: AtomicU32::new(self.cseq.load(Ordering::Relaxed)),
            peer_cseq: AtomicU32::new(0),
            state: Mutex::new(match response.line.code.kind() {
                CodeKind::Success => DialogState::Confirmed,
                _ => DialogState::Early,
            }),
            target_tp_info: tokio::sync::Mutex::new(self.target_tp_info.clone()),
        })
    }
}

/// A party interested in requests arriving inside a dialog
#[async_trait::async_trait]
pub trait Usage: Send + Sync + 'static {
    async fn receive(&self, endpoint: &Endpoint, request: MayClaim<'_, IncomingRequest>);
}

/// Removes its usage from the dialog registry on drop
#[derive(Debug)]
pub struct UsageGuard {
    endpoint: Endpoint,
    dialog_key: DialogKey,
    usage_id: u64,
}

impl Drop for UsageGuard {
    fn drop(&mut self) {
        let layer = self.endpoint.layer::<DialogLayer>();

        let mut dialogs = layer.dialogs.lock();

        if let Some(usages) = dialogs.get_mut(&self.dialog_key) {
            usages.retain(|(id, _)| *id != self.usage_id);

            if usages.is_empty() {
                dialogs.remove(&self.dialog_key);
            }
        }
    }
}

/// Register a usage under a dialog key
pub fn register_usage<U: Usage>(endpoint: Endpoint, dialog_key: DialogKey, usage: U) -> UsageGuard {
    let layer = endpoint.layer::<DialogLayer>();

    let usage_id = layer.next_usage_id.fetch_add(1, Ordering::Relaxed);

    layer
        .dialogs
        .lock()
        .entry(dialog_key.clone())
        .or_default()
        .push((usage_id, Arc::new(usage)));

    UsageGuard {
        endpoint,
        dialog_key,
        usage_id,
    }
}

type UsageEntry = (u64, Arc<dyn Usage>);

/// Endpoint layer routing in-dialog requests to registered usages
#[derive(Default)]
pub struct DialogLayer {
    dialogs: Mutex<HashMap<DialogKey, Vec<UsageEntry>>>,
    next_usage_id: std::sync::atomic::AtomicU64,
}

impl DialogLayer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of dialogs currently registered
    pub fn len(&self) -> usize {
        self.dialogs.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.dialogs.lock().is_empty()
    }
}

#[async_trait::async_trait]
impl Layer for DialogLayer {
    fn name(&self) -> &'static str {
        "dialog"
    }

    async fn receive(&self, endpoint: &Endpoint, mut request: MayClaim<'_, IncomingRequest>) {
        let Some(key) = DialogKey::from_incoming(&request) else {
            // no To tag, not an in-dialog request
            return;
        };

        let usages: Vec<UsageEntry> = match self.dialogs.lock().get(&key) {
            Some(usages) => usages.clone(),
            None => {
                // to-tag present but no such dialog; let the endpoint answer
                // 481 unless another layer claims the request
                return;
            }
        };

        for (_, usage) in usages {
            usage.receive(endpoint, MayClaim::new(request.inner())).await;

            if request.inner().is_none() {
                return;
            }
        }

        // dialog exists but no usage wanted the request; answer 481 for
        // anything we cannot make sense of
        if request.line.method != Method::ACK {
            let mut incoming = request.claim();

            let response = endpoint.create_response(
                &incoming,
                StatusCode::CALL_OR_TRANSACTION_DOES_NOT_EXIST,
                None,
            );

            let result = if incoming.line.method == Method::INVITE {
                let tx = endpoint.create_invite_server_tx(&mut incoming);
                tx.respond_failure(response).await
            } else {
                let tx = endpoint.create_server_tx(&mut incoming);
                tx.respond(response).await
            };

            if let Err(e) = result {
                log::warn!("failed to reject unhandled in-dialog request: {e}");
            }
        }
    }
}
