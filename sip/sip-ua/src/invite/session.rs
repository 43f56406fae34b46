use super::timer::SessionTimer;
use super::{AwaitedAck, Inner, UsageEvent};
use crate::dialog::{Dialog, DialogState, UsageGuard};
use sip_core::transaction::{InviteServerTx, ServerTx, TxResponse};
use sip_core::transport::OutgoingResponse;
use sip_core::{Endpoint, IncomingRequest, Result};
use sip_types::{CodeKind, Method, StatusCode};
use std::sync::Arc;
use tokio::select;
use tokio::sync::mpsc::{self, Receiver};
use tokio::sync::oneshot;

#[derive(Debug, Clone, Copy)]
pub enum SessionRole {
    Uac,
    Uas,
}

/// An established INVITE session (a confirmed dialog with media).
///
/// Owned by the call controller's per-leg task; [`run`](InviteSession::run)
/// yields the in-dialog events the controller reacts to.
pub struct InviteSession {
    pub endpoint: Endpoint,
    inner: Arc<Inner>,

    pub role: SessionRole,

    usage_events: Receiver<UsageEvent>,

    pub session_timer: SessionTimer,

    // field order: the usage guard must drop before the dialog
    _usage_guard: UsageGuard,
    pub dialog: Arc<Dialog>,
}

#[derive(Debug, thiserror::Error)]
pub enum SessionRefreshError {
    #[error(transparent)]
    Core(#[from] sip_core::Error),
    #[error("unexpected status code {0:?}")]
    UnexpectedStatus(StatusCode),
}

/// Events surfaced to the session owner
pub enum InviteSessionEvent {
    /// The session timer asks the local side to refresh
    RefreshNeeded,
    /// A re-INVITE arrived (hold, unhold, renegotiation)
    ReInvite(ReInviteReceived),
    /// An UPDATE arrived
    Update(UpdateReceived),
    /// The peer hung up
    Bye(ByeReceived),
    /// The peer asks for a transfer
    Refer(ReferReceived),
    /// In-dialog INFO (DTMF relay)
    Info(InfoReceived),
    /// A NOTIFY arrived, already answered with 200
    Notify(IncomingRequest),
    /// An in-dialog MESSAGE arrived
    Message(InfoReceived),
    Terminated,
}

pub struct ReInviteReceived {
    pub invite: IncomingRequest,
    pub transaction: InviteServerTx,
}

pub struct UpdateReceived {
    pub update: IncomingRequest,
    pub transaction: ServerTx,
}

pub struct ByeReceived {
    pub bye: IncomingRequest,
    pub transaction: ServerTx,
}

pub struct ReferReceived {
    pub refer: IncomingRequest,
    pub transaction: ServerTx,
}

pub struct InfoReceived {
    pub request: IncomingRequest,
    pub transaction: ServerTx,
}

impl InviteSession {
    pub(super) fn new(
        endpoint: Endpoint,
        inner: Arc<Inner>,
        role: SessionRole,
        usage_events: mpsc::Receiver<UsageEvent>,
        session_timer: SessionTimer,
        usage_guard: UsageGuard,
        dialog: Dialog,
    ) -> Self {
        dialog.set_state(DialogState::Confirmed);

        Self {
            endpoint,
            inner,
            role,
            usage_events,
            session_timer,
            _usage_guard: usage_guard,
            dialog: Arc::new(dialog),
        }
    }

    /// Wait for the next session event
    pub async fn run(&mut self) -> Result<InviteSessionEvent> {
        select! {
            _ = self.session_timer.wait() => {
                self.handle_session_timer().await
            }
            event = self.usage_events.recv() => {
                self.handle_usage_event(event).await
            }
        }
    }

    /// Send BYE and terminate the session
    pub async fn terminate(&mut self) -> Result<TxResponse> {
        self.inner.state.lock().await.set_terminated();
        self.dialog.set_state(DialogState::Terminated);

        let request = self.dialog.create_request(Method::BYE);

        let mut target_tp_info = self.dialog.target_tp_info.lock().await;

        let mut transaction = self
            .endpoint
            .send_request(request, &mut target_tp_info)
            .await?;

        drop(target_tp_info);

        transaction.receive_final().await
    }

    async fn handle_usage_event(&mut self, evt: Option<UsageEvent>) -> Result<InviteSessionEvent> {
        let Some(evt) = evt else {
            // the usage event channel closed because the state went Terminated
            return Ok(InviteSessionEvent::Terminated);
        };

        match evt {
            UsageEvent::Notify(mut request) => {
                let transaction = self.endpoint.create_server_tx(&mut request);
                let response = self
                    .dialog
                    .create_response(&request, StatusCode::OK, None)?;
                transaction.respond(response).await?;

                Ok(InviteSessionEvent::Notify(request))
            }
            UsageEvent::Bye(mut request) => {
                let transaction = self.endpoint.create_server_tx(&mut request);

                Ok(InviteSessionEvent::Bye(ByeReceived {
                    bye: request,
                    transaction,
                }))
            }
            UsageEvent::ReInvite(mut invite) => {
                self.session_timer.reset();

                let transaction = self.endpoint.create_invite_server_tx(&mut invite);

                Ok(InviteSessionEvent::ReInvite(ReInviteReceived {
                    invite,
                    transaction,
                }))
            }
            UsageEvent::Update(mut update) => {
                self.session_timer.reset();

                let transaction = self.endpoint.create_server_tx(&mut update);

                Ok(InviteSessionEvent::Update(UpdateReceived {
                    update,
                    transaction,
                }))
            }
            UsageEvent::Refer(mut refer) => {
                let transaction = self.endpoint.create_server_tx(&mut refer);

                Ok(InviteSessionEvent::Refer(ReferReceived {
                    refer,
                    transaction,
                }))
            }
            UsageEvent::Info(mut request) => {
                let transaction = self.endpoint.create_server_tx(&mut request);

                Ok(InviteSessionEvent::Info(InfoReceived {
                    request,
                    transaction,
                }))
            }
            UsageEvent::Message(mut request) => {
                let transaction = self.endpoint.create_server_tx(&mut request);

                Ok(InviteSessionEvent::Message(InfoReceived {
                    request,
                    transaction,
                }))
            }
        }
    }

    async fn handle_session_timer(&mut self) -> Result<InviteSessionEvent> {
        if self.session_timer.local_refresh() {
            self.session_timer.reset();

            Ok(InviteSessionEvent::RefreshNeeded)
        } else {
            // the peer was responsible and never refreshed
            self.terminate().await?;
            Ok(InviteSessionEvent::Terminated)
        }
    }

    /// Send a refresh re-INVITE carrying the current session description
    pub async fn refresh(&mut self, sdp: bytes::Bytes) -> Result<(), SessionRefreshError> {
        self.session_timer.reset();

        let mut invite = self.dialog.create_request(Method::INVITE);
        self.session_timer.populate_refresh(&mut invite);

        invite
            .headers
            .insert_typed(&sip_types::header::typed::ContentType::new("application/sdp"));
        invite.body = sdp;

        let mut target_tp_info = self.dialog.target_tp_info.lock().await;

        let mut transaction = self
            .endpoint
            .send_invite(invite, &mut target_tp_info)
            .await?;

        drop(target_tp_info);

        let mut ack = None;

        while let Some(response) = transaction.receive().await? {
            match response.line.code.kind() {
                CodeKind::Provisional => {}
                CodeKind::Success => {
                    let ack = match &mut ack {
                        Some(ack) => ack,
                        None => {
                            let ack_request =
                                super::create_ack(&self.dialog, response.base_headers.cseq.cseq)
                                    .await?;

                            ack.insert(ack_request)
                        }
                    };

                    self.endpoint
                        .send_outgoing_request(ack)
                        .await
                        .map_err(sip_core::Error::from)?;
                }
                _ => return Err(SessionRefreshError::UnexpectedStatus(response.line.code)),
            }
        }

        Ok(())
    }

    /// Answer a BYE with 200 and terminate
    pub async fn handle_bye(&mut self, event: ByeReceived) -> Result<()> {
        self.inner.state.lock().await.set_terminated();
        self.dialog.set_state(DialogState::Terminated);

        let response = self
            .dialog
            .create_response(&event.bye, StatusCode::OK, None)?;

        event.transaction.respond(response).await?;

        Ok(())
    }

    /// Acknowledge a 2xx response of the INVITE that created this session
    /// (UAC side)
    pub async fn acknowledge(
        &self,
        cseq: u32,
    ) -> Result<sip_core::transport::OutgoingRequest> {
        let mut ack = super::create_ack(&self.dialog, cseq).await?;

        self.endpoint.send_outgoing_request(&mut ack).await?;

        Ok(ack)
    }

    /// Answer a re-INVITE with a success response and wait for the ACK
    pub async fn respond_to_reinvite(
        &mut self,
        event: ReInviteReceived,
        response: OutgoingResponse,
    ) -> Result<IncomingRequest> {
        let (ack_sender, ack_recv) = oneshot::channel();

        *self.inner.awaited_ack.lock() = Some(AwaitedAck {
            cseq: event.invite.base_headers.cseq.cseq,
            ack_sender,
        });

        let accepted = event.transaction.respond_success(response).await?;

        super::receive_ack(accepted, ack_recv, *self.endpoint.timers()).await
    }
}
