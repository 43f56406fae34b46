use super::session::{InviteSession, SessionRole};
use super::timer::SessionTimer;
use super::{Inner, InviteSessionState, InviteUsage};
use crate::dialog::{ClientDialogBuilder, Dialog};
use bytesstr::BytesStr;
use parking_lot as pl;
use sip_core::transaction::{InviteClientTx, TxResponse};
use sip_core::transport::OutgoingRequest;
use sip_core::{Endpoint, Request, Result};
use sip_types::header::typed::Contact;
use sip_types::uri::{NameAddr, SipUri};
use sip_types::{Method, Name};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, mpsc};

/// Outcome of driving the INVITE client transaction one step
pub enum InitiatorResponse {
    /// 100 Trying or an untagged provisional
    Provisional(TxResponse),
    /// Terminal failure of the INVITE
    Failure(TxResponse),
    /// A tagged provisional created an early dialog
    Early(Early, TxResponse),
    /// A 2xx established a session
    Session(InviteSession, TxResponse),
    /// A response was forwarded into an existing early dialog
    EarlyEvent,
    /// The transaction terminated
    Finished,
}

/// UAC side of an outgoing INVITE.
///
/// Each tagged provisional response forks an [`Early`] dialog; the first 2xx
/// per to-tag creates an [`InviteSession`]. Additional 2xx retransmissions
/// are re-answered with the session's ACK.
pub struct InviteInitiator {
    dialog_builder: ClientDialogBuilder,

    transaction: Option<InviteClientTx>,

    /// Early dialogs by their to-tag; responses matching the tag are
    /// forwarded through the channel
    early_list: Vec<(BytesStr, mpsc::Sender<EarlyEvent>)>,

    /// ACKs of created sessions by to-tag, retransmitted when the 2xx is
    /// received again
    created_sessions: HashMap<BytesStr, OutgoingRequest>,
}

impl InviteInitiator {
    pub fn new(
        endpoint: Endpoint,
        local_addr: NameAddr,
        local_contact: Contact,
        target: SipUri,
    ) -> Self {
        Self {
            dialog_builder: ClientDialogBuilder::new(endpoint, local_addr, local_contact, target),
            transaction: None,
            early_list: vec![],
            created_sessions: HashMap::new(),
        }
    }

    /// Build the INVITE request; the caller attaches SDP and extra headers
    pub fn create_invite(&mut self) -> Request {
        self.dialog_builder.create_request(Method::INVITE)
    }

    pub async fn send_invite(&mut self, request: Request) -> Result<()> {
        let transaction = self
            .dialog_builder
            .endpoint
            .send_invite(request, &mut self.dialog_builder.target_tp_info)
            .await?;

        self.transaction = Some(transaction);

        Ok(())
    }

    pub fn transaction(&self) -> Option<&InviteClientTx> {
        self.transaction.as_ref()
    }

    /// Store the ACK for a created session so a retransmitted 2xx can be
    /// re-acknowledged
    pub fn set_acknowledge(&mut self, session: &InviteSession, ack: OutgoingRequest) {
        self.created_sessions.insert(
            session
                .dialog
                .peer_fromto
                .tag
                .clone()
                .expect("confirmed dialog peer has a tag"),
            ack,
        );
    }

    /// Cancel the pending INVITE and clean up whatever state it reached
    pub async fn cancel(mut self) -> Result<()> {
        if let Some(transaction) = &mut self.transaction {
            transaction.cancel().await?;
        }

        loop {
            match self.receive().await? {
                InitiatorResponse::Provisional(_) | InitiatorResponse::EarlyEvent => {}
                InitiatorResponse::Failure(..) | InitiatorResponse::Finished => return Ok(()),
                InitiatorResponse::Early(early, ..) => {
                    early.cancel().await?;
                }
                InitiatorResponse::Session(mut session, ..) => {
                    // the race was lost, the peer answered before our CANCEL
                    session.terminate().await?;
                }
            }
        }
    }

    pub async fn receive(&mut self) -> Result<InitiatorResponse> {
        let transaction = self
            .transaction
            .as_mut()
            .expect("must send invite before calling receive");

        loop {
            let Some(response) = transaction.receive().await? else {
                return Ok(InitiatorResponse::Finished);
            };

            let code = response.line.code.into_u16();

            if code <= 100 {
                return Ok(InitiatorResponse::Provisional(response));
            }

            if code >= 300 {
                for (_, early) in self.early_list.drain(..) {
                    if early.send(EarlyEvent::Terminate).await.is_err() {
                        log::debug!("early dialog receiver dropped before termination");
                    }
                }

                return Ok(InitiatorResponse::Failure(response));
            }

            let Some(to_tag) = response.base_headers.to.tag.as_ref() else {
                log::warn!("cannot handle success response without To tag, ignoring");
                continue;
            };

            // retransmitted 2xx for an established session: re-ACK
            if let Some(ack) = self.created_sessions.get_mut(to_tag) {
                self.dialog_builder
                    .endpoint
                    .send_outgoing_request(ack)
                    .await?;
                continue;
            }

            // response belonging to a forked early dialog
            if let Some((_, early)) = self.early_list.iter().find(|(tag, _)| tag == to_tag) {
                if early.send(EarlyEvent::Response(response)).await.is_err() {
                    log::debug!("early dialog receiver dropped, response lost");
                }

                return Ok(InitiatorResponse::EarlyEvent);
            }

            match code {
                101..=199 => {
                    if !response.headers.contains(&Name::CONTACT) {
                        // cannot form a dialog without the peer's contact
                        return Ok(InitiatorResponse::Provisional(response));
                    }

                    let early = self.create_early_dialog(&response)?;

                    return Ok(InitiatorResponse::Early(early, response));
                }
                200..=299 => {
                    let session = self.create_session(&response)?;

                    return Ok(InitiatorResponse::Session(session, response));
                }
                _ => unreachable!(),
            }
        }
    }

    fn create_early_dialog(&mut self, response: &TxResponse) -> Result<Early> {
        let dialog = self.dialog_builder.create_dialog_from_response(response)?;
        let to_tag = dialog.peer_fromto.tag.clone().expect("tag checked by caller");

        let (tx, response_rx) = mpsc::channel(4);

        self.early_list.push((to_tag, tx));

        Ok(Early {
            endpoint: self.dialog_builder.endpoint.clone(),
            dialog: Some(dialog),
            response_rx,
        })
    }

    fn create_session(&mut self, response: &TxResponse) -> Result<InviteSession> {
        let dialog = self.dialog_builder.create_dialog_from_response(response)?;

        let (evt_sink, usage_events) = mpsc::channel(4);

        let inner = Arc::new(Inner {
            state: Mutex::new(InviteSessionState::Established { evt_sink }),
            awaited_ack: pl::Mutex::new(None),
        });

        let usage_guard = dialog.register_usage(InviteUsage {
            inner: inner.clone(),
        });

        let session_timer = SessionTimer::uac_from_response(response);

        Ok(InviteSession::new(
            self.dialog_builder.endpoint.clone(),
            inner,
            SessionRole::Uac,
            usage_events,
            session_timer,
            usage_guard,
            dialog,
        ))
    }
}

enum EarlyEvent {
    Response(TxResponse),
    Terminate,
}

/// An early dialog forked off the INVITE by a tagged provisional response
pub struct Early {
    endpoint: Endpoint,
    dialog: Option<Dialog>,

    response_rx: mpsc::Receiver<EarlyEvent>,
}

pub enum EarlyResponse {
    Provisional(TxResponse),
    Success(InviteSession, TxResponse),
    Terminated,
}

impl Early {
    pub async fn receive(&mut self) -> Result<EarlyResponse> {
        // the initiator going away terminates every early dialog it forked
        let Some(event) = self.response_rx.recv().await else {
            return Ok(EarlyResponse::Terminated);
        };

        match event {
            EarlyEvent::Response(response) => match response.line.code.into_u16() {
                101..=199 => Ok(EarlyResponse::Provisional(response)),
                200..=299 => {
                    let dialog = self.dialog.take().expect("success consumes the dialog");

                    let (evt_sink, usage_events) = mpsc::channel(4);

                    let inner = Arc::new(Inner {
                        state: Mutex::new(InviteSessionState::Established { evt_sink }),
                        awaited_ack: pl::Mutex::new(None),
                    });

                    let usage_guard = dialog.register_usage(InviteUsage {
                        inner: inner.clone(),
                    });

                    let session_timer = SessionTimer::uac_from_response(&response);

                    let session = InviteSession::new(
                        self.endpoint.clone(),
                        inner,
                        SessionRole::Uac,
                        usage_events,
                        session_timer,
                        usage_guard,
                        dialog,
                    );

                    Ok(EarlyResponse::Success(session, response))
                }
                _ => unreachable!("initiator only forwards 101..=299"),
            },
            EarlyEvent::Terminate => Ok(EarlyResponse::Terminated),
        }
    }

    /// Terminate this early dialog after the INVITE was cancelled
    pub async fn cancel(mut self) -> Result<()> {
        loop {
            match self.response_rx.recv().await {
                Some(EarlyEvent::Response(response)) => {
                    if response.line.code.into_u16() >= 200 {
                        return Ok(());
                    }
                }
                Some(EarlyEvent::Terminate) | None => return Ok(()),
            }
        }
    }
}
