use super::{Retransmit, TxInbox, TxKey, TxMessage, TxResponse, absorb};
use crate::transport::{OutgoingParts, OutgoingRequest, TargetTransportInfo};
use crate::{Endpoint, Error, Request, Result};
use sip_types::header::typed::{CSeq, MaxForwards};
use sip_types::{CodeKind, Method, Name};
use std::time::Duration;
use tokio::time::{Instant, sleep_until, timeout_at};

#[derive(Debug)]
enum State {
    /// No response seen yet, timer A retransmits, timer B bounds
    Calling,
    /// Provisional response seen, waiting for a final response
    Proceeding,
    /// 2xx seen, lingering so retransmitted 2xx reach the TU for re-ACKing
    Accepted { until: Instant },
    Terminated,
}

/// INVITE client transaction (RFC 3261 §17.1.1), timers A/B/D.
///
/// The ACK for a negative final response is generated here; the ACK for a 2xx
/// is the TU's responsibility.
#[derive(Debug)]
pub struct InviteClientTx {
    inbox: Option<TxInbox>,
    request: OutgoingRequest,
    reliable: bool,
    state: State,

    cadence: Retransmit,

    /// Timer B deadline
    timeout_at: Instant,
}

impl InviteClientTx {
    pub(crate) async fn send(
        endpoint: Endpoint,
        mut request: Request,
        target: &mut TargetTransportInfo,
    ) -> Result<Self> {
        assert_eq!(request.line.method, Method::INVITE);

        let key = TxKey::client(Method::INVITE);

        if !request.headers.contains(&Name::MAX_FORWARDS) {
            request.headers.insert_typed(&MaxForwards(70));
        }

        let mut outgoing = endpoint.create_outgoing(request, target).await?;

        let via = endpoint.create_via(
            &outgoing.parts.transport,
            &key,
            target.via_host_port.clone(),
        );
        outgoing.msg.headers.insert_typed_front(&via);

        let inbox = endpoint.transactions().open(&endpoint, key);

        endpoint.send_outgoing_request(&mut outgoing).await?;

        let timers = endpoint.timers();

        Ok(Self {
            inbox: Some(inbox),
            reliable: outgoing.parts.transport.reliable(),
            state: State::Calling,
            cadence: Retransmit::start(timers),
            timeout_at: Instant::now() + timers.tx_timeout(),
            request: outgoing,
        })
    }

    pub fn request(&self) -> &OutgoingRequest {
        &self.request
    }

    /// Receive the next response.
    ///
    /// Returns `None` once the transaction terminated. Errors with
    /// [`Error::RequestTimedOut`] when timer B fires without any response.
    pub async fn receive(&mut self) -> Result<Option<TxResponse>> {
        loop {
            let endpoint = match &self.inbox {
                Some(inbox) => inbox.endpoint.clone(),
                None => return Ok(None),
            };

            // which clock bounds the current state
            let expiry = match &self.state {
                State::Calling => Some(self.timeout_at),
                // provisional responses pin the transaction open; the TU
                // applies its own ring timeout and cancels
                State::Proceeding => None,
                State::Accepted { until } => Some(*until),
                State::Terminated => return Ok(None),
            };

            enum Wake {
                Message(TxMessage),
                RetransmitDue,
                Expired,
            }

            let retransmitting = matches!(self.state, State::Calling) && !self.reliable;

            let inbox = self.inbox.as_mut().expect("checked above");

            let wake = tokio::select! {
                message = inbox.receive() => Wake::Message(message),
                _ = sleep_until(self.cadence.deadline()), if retransmitting => {
                    Wake::RetransmitDue
                }
                _ = sleep_until(expiry.unwrap_or_else(far_future)), if expiry.is_some() => {
                    Wake::Expired
                }
            };

            match wake {
                Wake::Message(message) => {
                    let Some(response) = message.into_response() else {
                        continue;
                    };

                    return self.handle_response(endpoint, response).await;
                }
                Wake::RetransmitDue => {
                    endpoint.send_outgoing_request(&mut self.request).await?;
                    self.cadence.advance();
                }
                Wake::Expired => match &self.state {
                    State::Calling => {
                        // timer B
                        self.inbox = None;
                        self.state = State::Terminated;
                        return Err(Error::RequestTimedOut);
                    }
                    _ => {
                        self.inbox = None;
                        self.state = State::Terminated;
                        return Ok(None);
                    }
                },
            }
        }
    }

    async fn handle_response(
        &mut self,
        endpoint: Endpoint,
        response: TxResponse,
    ) -> Result<Option<TxResponse>> {
        match response.line.code.kind() {
            CodeKind::Provisional => {
                if matches!(self.state, State::Calling) {
                    self.state = State::Proceeding;
                }

                Ok(Some(response))
            }
            CodeKind::Success => {
                if !matches!(self.state, State::Accepted { .. }) {
                    self.state = State::Accepted {
                        until: Instant::now() + endpoint.timers().tx_timeout(),
                    };
                }

                Ok(Some(response))
            }
            _ => {
                // negative final response: ACK it here and keep the slot
                // alive for timer D, re-ACKing retransmissions
                let mut ack = self.build_failure_ack(&response);
                endpoint.send_outgoing_request(&mut ack).await?;

                let window = endpoint.timers().timer_d(self.reliable);
                let inbox = self.inbox.take().expect("alive in handle_response");

                spawn_reack(endpoint, inbox, ack, window);

                self.state = State::Terminated;

                Ok(Some(response))
            }
        }
    }

    /// Cancel the pending INVITE (RFC 3261 §9).
    ///
    /// Sends a CANCEL through its own non-INVITE transaction sharing the
    /// INVITE's branch and waits for its final response. The INVITE
    /// transaction itself still terminates through a 487 final response.
    pub async fn cancel(&mut self) -> Result<()> {
        let Some(invite_inbox) = &self.inbox else {
            return Ok(());
        };

        let endpoint = invite_inbox.endpoint.clone();
        let key = invite_inbox.key.cancel_of();

        let mut outgoing = self.build_cancel()?;

        let mut inbox = endpoint.transactions().open(&endpoint, key);

        endpoint.send_outgoing_request(&mut outgoing).await?;

        let timers = *endpoint.timers();
        let give_up = Instant::now() + timers.tx_timeout();
        let mut cadence = Retransmit::start(&timers);

        loop {
            let deadline = if self.reliable {
                give_up
            } else {
                cadence.deadline().min(give_up)
            };

            match timeout_at(deadline, inbox.receive()).await {
                Ok(message) => {
                    let Some(response) = message.into_response() else {
                        continue;
                    };

                    if response.line.code.kind() == CodeKind::Provisional {
                        continue;
                    }

                    // a 481 means the INVITE already completed at the peer,
                    // either way the cancel exchange is done
                    absorb(inbox, timers.absorb_window(self.reliable));

                    return Ok(());
                }
                Err(_) => {
                    if Instant::now() >= give_up {
                        return Err(Error::RequestTimedOut);
                    }

                    endpoint.send_outgoing_request(&mut outgoing).await?;
                    cadence.advance();
                }
            }
        }
    }

    /// The CANCEL matches the INVITE on the server: same Via branch, same
    /// dialog identifying headers, CSeq number with method CANCEL
    fn build_cancel(&self) -> Result<OutgoingRequest> {
        let invite = &self.request.msg;

        let mut cancel = Request::new(Method::CANCEL, invite.line.uri.clone());

        for name in [Name::VIA, Name::FROM, Name::TO, Name::CALL_ID] {
            invite.headers.clone_into(&mut cancel.headers, name);
        }

        let cseq = invite.headers.typed::<CSeq>()?;
        cancel
            .headers
            .insert_typed(&CSeq::new(cseq.cseq, Method::CANCEL));
        cancel.headers.insert_typed(&MaxForwards(70));

        Ok(OutgoingRequest {
            msg: cancel,
            parts: OutgoingParts {
                transport: self.request.parts.transport.clone(),
                destination: self.request.parts.destination,
                buffer: Default::default(),
            },
        })
    }

    /// Build the ACK for a negative final response (same branch transaction)
    fn build_failure_ack(&self, response: &TxResponse) -> OutgoingRequest {
        let invite = &self.request.msg;

        let mut ack = Request::new(Method::ACK, invite.line.uri.clone());

        for name in [Name::VIA, Name::FROM, Name::CALL_ID] {
            invite.headers.clone_into(&mut ack.headers, name);
        }

        // the To of the response, which may carry a tag
        ack.headers
            .insert_typed_named(Name::TO, &response.base_headers.to);

        ack.headers
            .insert_typed(&CSeq::new(response.base_headers.cseq.cseq, Method::ACK));
        ack.headers.insert_typed(&MaxForwards(70));

        OutgoingRequest {
            msg: ack,
            parts: OutgoingParts {
                transport: self.request.parts.transport.clone(),
                destination: self.request.parts.destination,
                buffer: Default::default(),
            },
        }
    }
}

fn far_future() -> Instant {
    Instant::now() + Duration::from_secs(24 * 60 * 60)
}

/// Timer D: absorb retransmitted final responses, answering each with the
/// same ACK
fn spawn_reack(endpoint: Endpoint, mut inbox: TxInbox, mut ack: OutgoingRequest, window: Duration) {
    if window.is_zero() {
        return;
    }

    tokio::spawn(async move {
        let deadline = Instant::now() + window;

        loop {
            match timeout_at(deadline, inbox.receive()).await {
                Ok(message) => {
                    if message.into_response().is_some() {
                        if let Err(e) = endpoint.send_outgoing_request(&mut ack).await {
                            log::debug!("failed to re-ACK retransmitted response: {e}");
                            break;
                        }
                    }
                }
                Err(_) => break,
            }
        }
    });
}
