use super::session::{InviteSession, SessionRole};
use super::timer::SessionTimer;
use super::{AwaitedAck, CancellableKey, Inner, InviteLayer, InviteSessionState, InviteUsage};
use crate::dialog::{Dialog, UsageGuard, register_usage};
use bytesstr::BytesStr;
use parking_lot as pl;
use sip_core::transport::OutgoingResponse;
use sip_core::{Endpoint, IncomingRequest, Result};
use sip_types::{Method, StatusCode};
use std::sync::Arc;
use tokio::sync::{Mutex, Notify, mpsc, oneshot};

#[derive(Debug, thiserror::Error)]
pub enum AcceptorError {
    #[error(transparent)]
    Core(#[from] sip_core::Error),

    #[error("peer cancelled its request")]
    RequestTerminated,
}

/// UAS side of an incoming INVITE, before a final response was sent.
///
/// The acceptor feeds ringing state back to the caller and either hands over
/// to an [`InviteSession`] on success or answers with a failure response.
pub struct InviteAcceptor {
    endpoint: Endpoint,
    inner: Arc<Inner>,
    cancellable_key: CancellableKey,
    cancelled_notify: Arc<Notify>,
    cancelled: bool,
    usage_guard: Option<UsageGuard>,
}

impl Drop for InviteAcceptor {
    fn drop(&mut self) {
        self.endpoint
            .layer::<InviteLayer>()
            .cancellables
            .lock()
            .remove(&self.cancellable_key);
    }
}

impl InviteAcceptor {
    /// Create the acceptor for an incoming INVITE and its freshly built
    /// UAS dialog
    pub fn new(dialog: Dialog, mut invite: IncomingRequest) -> Self {
        assert_eq!(
            invite.line.method,
            Method::INVITE,
            "incoming request must be an INVITE"
        );

        let endpoint = dialog.endpoint.clone();

        let dialog_key = dialog.key();

        let cancellable_key = CancellableKey {
            cseq: invite.base_headers.cseq.cseq,
            branch: invite.tx_key.branch().clone(),
        };
        let cancelled_notify = Arc::new(Notify::new());

        let tx = endpoint.create_invite_server_tx(&mut invite);

        let inner = Arc::new(Inner {
            state: Mutex::new(InviteSessionState::Provisional {
                dialog,
                tx,
                invite,
                cancelled_notify: cancelled_notify.clone(),
            }),
            awaited_ack: pl::Mutex::new(None),
        });

        let usage_guard = register_usage(
            endpoint.clone(),
            dialog_key,
            InviteUsage {
                inner: inner.clone(),
            },
        );

        // make the pending INVITE reachable for CANCEL
        endpoint
            .layer::<InviteLayer>()
            .cancellables
            .lock()
            .insert(cancellable_key.clone(), inner.clone());

        Self {
            endpoint,
            inner,
            usage_guard: Some(usage_guard),
            cancellable_key,
            cancelled_notify,
            cancelled: false,
        }
    }

    /// Resolves when the INVITE gets cancelled by the peer
    pub async fn cancelled(&mut self) {
        if self.cancelled {
            return;
        }

        self.cancelled_notify.notified().await;
        self.cancelled = true;
    }

    /// Build a response to the pending INVITE
    pub async fn create_response(
        &self,
        code: StatusCode,
        reason: Option<BytesStr>,
    ) -> Result<OutgoingResponse, AcceptorError> {
        let mut state = self.inner.state.lock().await;

        if let InviteSessionState::Provisional { dialog, invite, .. } = &mut *state {
            dialog
                .create_response(invite, code, reason)
                .map_err(AcceptorError::Core)
        } else {
            Err(AcceptorError::RequestTerminated)
        }
    }

    /// Send a provisional response (180 Ringing, 183 with early media)
    pub async fn respond_provisional(
        &mut self,
        mut response: OutgoingResponse,
    ) -> Result<(), AcceptorError> {
        let mut state = self.inner.state.lock().await;

        if let InviteSessionState::Provisional { tx, .. } = &mut *state {
            tx.respond_provisional(&mut response)
                .await
                .map_err(AcceptorError::Core)
        } else {
            Err(AcceptorError::RequestTerminated)
        }
    }

    /// Answer the INVITE with a 2xx, wait for the ACK and hand over to the
    /// established session
    pub async fn respond_success(
        mut self,
        mut response: OutgoingResponse,
    ) -> Result<(InviteSession, IncomingRequest), AcceptorError> {
        // hold the state lock through the whole exchange so no in-dialog
        // request observes a half-established session
        let mut state = self.inner.state.lock().await;

        let (evt_sink, events) = mpsc::channel(4);
        let parts = state.set_established(evt_sink);

        let Some((dialog, transaction, invite)) = parts else {
            return Err(AcceptorError::RequestTerminated);
        };

        // the ACK is matched by the INVITE's CSeq
        let (ack_sink, ack_recv) = oneshot::channel();
        *self.inner.awaited_ack.lock() = Some(AwaitedAck {
            cseq: invite.base_headers.cseq.cseq,
            ack_sender: ack_sink,
        });

        let session_timer = SessionTimer::uas_from_invite(&invite, &mut response);

        let accepted = transaction.respond_success(response).await?;

        let ack = super::receive_ack(accepted, ack_recv, *self.endpoint.timers()).await?;

        // pin the dialog's transport target to where the ACK came from
        {
            let mut target_tp_info = dialog.target_tp_info.lock().await;
            target_tp_info.transport =
                Some((ack.tp_info.transport.clone(), ack.tp_info.source));
        }

        drop(state);

        let session = InviteSession::new(
            self.endpoint.clone(),
            self.inner.clone(),
            SessionRole::Uas,
            events,
            session_timer,
            self.usage_guard.take().expect("taken only here"),
            dialog,
        );

        Ok((session, ack))
    }

    /// Answer the INVITE with a failure response (486, 487, 404, ...)
    pub async fn respond_failure(self, response: OutgoingResponse) -> Result<(), AcceptorError> {
        if let Some((_, transaction, _)) = self.inner.state.lock().await.set_cancelled() {
            transaction
                .respond_failure(response)
                .await
                .map_err(AcceptorError::Core)
        } else {
            Err(AcceptorError::RequestTerminated)
        }
    }
}
