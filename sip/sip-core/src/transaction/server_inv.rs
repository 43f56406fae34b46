use super::{Retransmit, TxInbox, TxMessage};
use crate::transport::OutgoingResponse;
use crate::{Error, IncomingRequest, Result};
use sip_types::{CodeKind, Method};
use std::io;
use tokio::time::{Instant, sleep_until};

/// INVITE server transaction (RFC 3261 §17.2.1), timers G/H/I.
///
/// The response class dictates which method must be used: provisional,
/// success and failure responses all need different retransmission handling.
/// Dropping the transaction before a final response leaves the request
/// unanswered.
#[derive(Debug)]
pub struct InviteServerTx {
    inbox: TxInbox,
}

/// What an inbox message means to a completed INVITE server transaction
enum Peer {
    /// The retransmitted INVITE, the final response got lost
    RepeatedInvite,
    /// The ACK completing the transaction
    Acknowledged,
    /// Anything else is noise
    Other,
}

fn classify(message: &TxMessage) -> Peer {
    match message.request_method() {
        Some(method) if *method == Method::INVITE => Peer::RepeatedInvite,
        Some(method) if *method == Method::ACK => Peer::Acknowledged,
        _ => Peer::Other,
    }
}

impl InviteServerTx {
    /// Internal: use [`Endpoint::create_invite_server_tx`](crate::Endpoint::create_invite_server_tx)
    pub(crate) fn new(request: &mut IncomingRequest) -> Self {
        assert_eq!(
            request.line.method,
            Method::INVITE,
            "tried to create INVITE transaction from {} request",
            request.line.method
        );

        Self {
            inbox: request.take_inbox(),
        }
    }

    /// Respond with a provisional response (1xx)
    pub async fn respond_provisional(&mut self, response: &mut OutgoingResponse) -> Result<()> {
        assert_eq!(response.msg.line.code.kind(), CodeKind::Provisional);

        self.inbox
            .endpoint
            .send_outgoing_response(response)
            .await?;

        Ok(())
    }

    /// Respond with a success response (2xx).
    ///
    /// Returns [`InviteAccepted`]; the TU is responsible for retransmitting
    /// the 2xx until its ACK arrives, since the ACK is addressed to the TU
    /// and not this transaction.
    pub async fn respond_success(
        mut self,
        mut response: OutgoingResponse,
    ) -> Result<InviteAccepted> {
        assert_eq!(response.msg.line.code.kind(), CodeKind::Success);

        // some peers reuse the INVITE branch for the 2xx ACK; turn ACKs away
        // at the slot so they surface to the TU as standalone requests
        self.inbox
            .add_filter(|message| !matches!(classify(message), Peer::Acknowledged));

        self.inbox
            .endpoint
            .send_outgoing_response(&mut response)
            .await?;

        Ok(InviteAccepted {
            inbox: self.inbox,
            response,
        })
    }

    /// Respond with a failure response (3xx-6xx).
    ///
    /// Retransmits on timer G until the peer's ACK arrives; timer H bounds
    /// the wait.
    pub async fn respond_failure(mut self, mut response: OutgoingResponse) -> Result<()> {
        assert!(matches!(
            response.msg.line.code.kind(),
            CodeKind::Redirect
                | CodeKind::RequestFailure
                | CodeKind::ServerFailure
                | CodeKind::GlobalFailure
        ));

        let endpoint = self.inbox.endpoint.clone();
        let timers = *endpoint.timers();

        endpoint.send_outgoing_response(&mut response).await?;

        if response.parts.transport.reliable() {
            // no retransmissions to manage; the ACK needs no confirmation
            return Ok(());
        }

        // timer H caps the whole exchange, timer G paces the retransmissions
        let give_up = Instant::now() + timers.tx_timeout();
        let mut cadence = Retransmit::start(&timers);

        loop {
            enum Wake {
                Message(TxMessage),
                Resend,
                GaveUp,
            }

            let wake = tokio::select! {
                message = self.inbox.receive() => Wake::Message(message),
                _ = sleep_until(cadence.deadline()) => Wake::Resend,
                _ = sleep_until(give_up) => Wake::GaveUp,
            };

            match wake {
                Wake::Message(message) => match classify(&message) {
                    Peer::Acknowledged => return Ok(()),
                    Peer::RepeatedInvite => {
                        endpoint.send_outgoing_response(&mut response).await?;
                    }
                    Peer::Other => {}
                },
                Wake::Resend => {
                    endpoint.send_outgoing_response(&mut response).await?;
                    cadence.advance();
                }
                Wake::GaveUp => return Err(Error::RequestTimedOut),
            }
        }
    }
}

/// The accepted state of an INVITE server transaction.
///
/// Used to retransmit the 2xx until the peer's ACK arrives at the TU.
#[must_use]
#[derive(Debug)]
pub struct InviteAccepted {
    inbox: TxInbox,
    response: OutgoingResponse,
}

impl InviteAccepted {
    /// Retransmit the final success response
    pub async fn retransmit(&mut self) -> io::Result<()> {
        self.inbox
            .endpoint
            .send_outgoing_response(&mut self.response)
            .await
    }
}
