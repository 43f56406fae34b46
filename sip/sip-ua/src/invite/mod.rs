//! INVITE session machinery: the acceptor (UAS), initiator (UAC) and the
//! established session they hand over to.

use crate::dialog::{Dialog, Usage};
use bytesstr::BytesStr;
use parking_lot as pl;
use sip_core::transaction::InviteAccepted;
use sip_core::transport::OutgoingRequest;
use sip_core::{Endpoint, Error, IncomingRequest, Layer, MayClaim, Result};
use sip_types::{Method, StatusCode};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, Notify, mpsc, oneshot};
use tokio::time::Instant;

mod acceptor;
mod initiator;
pub mod session;
mod timer;

pub use acceptor::InviteAcceptor;
pub use initiator::{Early, EarlyResponse, InviteInitiator, InitiatorResponse};
pub use session::{InviteSession, InviteSessionEvent};
pub use timer::SessionTimer;

/// An ACK we are waiting for after answering an INVITE with a 2xx
pub(crate) struct AwaitedAck {
    pub(crate) cseq: u32,
    pub(crate) ack_sender: oneshot::Sender<IncomingRequest>,
}

/// State shared between acceptor/initiator, the session and the dialog usage
pub(crate) struct Inner {
    pub(crate) state: Mutex<InviteSessionState>,
    pub(crate) awaited_ack: pl::Mutex<Option<AwaitedAck>>,
}

pub(crate) enum InviteSessionState {
    /// UAS: still answering the initial INVITE
    Provisional {
        dialog: Dialog,
        tx: sip_core::transaction::InviteServerTx,
        invite: IncomingRequest,
        cancelled_notify: Arc<Notify>,
    },
    /// Both sides: the session is established
    Established {
        evt_sink: mpsc::Sender<UsageEvent>,
    },
    /// UAS: the INVITE was cancelled before being answered
    Cancelled,
    Terminated,
}

impl InviteSessionState {
    /// Transition into Established, returning the provisional state's parts
    pub(crate) fn set_established(
        &mut self,
        evt_sink: mpsc::Sender<UsageEvent>,
    ) -> Option<(Dialog, sip_core::transaction::InviteServerTx, IncomingRequest)> {
        match std::mem::replace(self, Self::Established { evt_sink }) {
            Self::Provisional {
                dialog,
                tx,
                invite,
                ..
            } => Some((dialog, tx, invite)),
            other => {
                *self = other;
                None
            }
        }
    }

    /// Transition into Cancelled, returning the provisional state's parts
    pub(crate) fn set_cancelled(
        &mut self,
    ) -> Option<(Dialog, sip_core::transaction::InviteServerTx, IncomingRequest)> {
        match std::mem::replace(self, Self::Cancelled) {
            Self::Provisional {
                dialog,
                tx,
                invite,
                ..
            } => Some((dialog, tx, invite)),
            other => {
                *self = other;
                None
            }
        }
    }

    pub(crate) fn set_terminated(&mut self) {
        *self = Self::Terminated;
    }
}

/// Events flowing from the dialog usage into the session task
pub(crate) enum UsageEvent {
    ReInvite(IncomingRequest),
    Update(IncomingRequest),
    Bye(IncomingRequest),
    Refer(IncomingRequest),
    Info(IncomingRequest),
    Notify(IncomingRequest),
    Message(IncomingRequest),
}

/// The dialog usage forwarding in-dialog requests into the session
pub(crate) struct InviteUsage {
    pub(crate) inner: Arc<Inner>,
}

#[async_trait::async_trait]
impl Usage for InviteUsage {
    async fn receive(&self, _endpoint: &Endpoint, mut request: MayClaim<'_, IncomingRequest>) {
        let method = request.line.method.clone();

        if method == Method::ACK {
            let mut awaited = self.inner.awaited_ack.lock();

            if let Some(AwaitedAck { cseq, .. }) = &*awaited {
                if *cseq == request.base_headers.cseq.cseq {
                    let AwaitedAck { ack_sender, .. } =
                        awaited.take().expect("matched right above");

                    drop(awaited);

                    let _ = ack_sender.send(request.claim());
                }
            }

            return;
        }

        let evt = {
            let state = self.inner.state.lock().await;

            let InviteSessionState::Established { evt_sink } = &*state else {
                // before establishment only ACK and CANCEL concern the
                // session, everything else stays unclaimed
                return;
            };

            evt_sink.clone()
        };

        let make_event: fn(IncomingRequest) -> UsageEvent = if method == Method::INVITE {
            UsageEvent::ReInvite
        } else if method == Method::UPDATE {
            UsageEvent::Update
        } else if method == Method::BYE {
            UsageEvent::Bye
        } else if method == Method::REFER {
            UsageEvent::Refer
        } else if method == Method::INFO {
            UsageEvent::Info
        } else if method == Method::NOTIFY {
            UsageEvent::Notify
        } else if method == Method::MESSAGE {
            UsageEvent::Message
        } else {
            return;
        };

        if evt.send(make_event(request.claim())).await.is_err() {
            log::debug!("session task gone, dropping in-dialog request");
        }
    }
}

/// Key routing a CANCEL to the pending INVITE it targets
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) struct CancellableKey {
    pub(crate) cseq: u32,
    pub(crate) branch: BytesStr,
}

/// Endpoint layer answering CANCEL requests for pending acceptors
#[derive(Default)]
pub struct InviteLayer {
    pub(crate) cancellables: pl::Mutex<HashMap<CancellableKey, Arc<Inner>>>,
}

impl InviteLayer {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl Layer for InviteLayer {
    fn name(&self) -> &'static str {
        "invite"
    }

    async fn receive(&self, endpoint: &Endpoint, request: MayClaim<'_, IncomingRequest>) {
        if request.line.method != Method::CANCEL {
            return;
        }

        let key = CancellableKey {
            cseq: request.base_headers.cseq.cseq,
            branch: request.tx_key.branch().clone(),
        };

        let Some(inner) = self.cancellables.lock().get(&key).cloned() else {
            return;
        };

        let mut cancel = request.claim();

        // answer the CANCEL itself
        let tx = endpoint.create_server_tx(&mut cancel);
        let response = endpoint.create_response(&cancel, StatusCode::OK, None);

        if let Err(e) = tx.respond(response).await {
            log::warn!("failed to respond to CANCEL: {e}");
        }

        // notify the acceptor; it answers the INVITE with 487
        let state = inner.state.lock().await;

        if let InviteSessionState::Provisional {
            cancelled_notify, ..
        } = &*state
        {
            cancelled_notify.notify_one();
        }
    }
}

/// Build the ACK for a 2xx response within `dialog`
pub(crate) async fn create_ack(dialog: &Dialog, cseq: u32) -> Result<OutgoingRequest> {
    let mut request = dialog.create_request(Method::ACK);

    // the ACK shares the INVITE's sequence number
    request.headers.set_typed(&sip_types::header::typed::CSeq::new(cseq, Method::ACK));

    let mut target_tp_info = dialog.target_tp_info.lock().await;

    let mut outgoing = dialog
        .endpoint
        .create_outgoing(request, &mut target_tp_info)
        .await?;

    let via = dialog.endpoint.create_standalone_via(
        &outgoing.parts.transport,
        target_tp_info.via_host_port.clone(),
    );
    outgoing.msg.headers.insert_typed_front(&via);

    Ok(outgoing)
}

/// Retransmit the 2xx on the usual backoff until the peer's ACK arrives
pub(crate) async fn receive_ack(
    mut accepted: InviteAccepted,
    mut ack_recv: oneshot::Receiver<IncomingRequest>,
    timers: sip_core::transaction::TimerConfig,
) -> Result<IncomingRequest> {
    let abandon_at = Instant::now() + timers.tx_timeout();
    let mut delta = timers.t1;

    loop {
        match tokio::time::timeout(delta, &mut ack_recv).await {
            Ok(result) => {
                // the sender is only dropped together with the session state
                return result.map_err(|_| Error::RequestTimedOut);
            }
            Err(_) => {
                if Instant::now() >= abandon_at {
                    return Err(Error::RequestTimedOut);
                }

                accepted.retransmit().await?;
                delta = (delta * 2).min(timers.t2);
            }
        }
    }
}
