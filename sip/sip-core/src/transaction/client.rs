use super::{Retransmit, TxInbox, TxKey, TxResponse, absorb};
use crate::transport::{OutgoingRequest, TargetTransportInfo};
use crate::{Endpoint, Error, Request, Result};
use sip_types::header::typed::MaxForwards;
use sip_types::{CodeKind, Name};
use tokio::time::{Instant, sleep_until};

/// Non-INVITE client transaction (RFC 3261 §17.1.2), timers E/F/K.
///
/// Created by [`Endpoint::send_request`], must be driven via
/// [`receive`](NonInviteClientTx::receive) until a final response arrives.
#[derive(Debug)]
pub struct NonInviteClientTx {
    inbox: Option<TxInbox>,
    request: OutgoingRequest,
    reliable: bool,

    /// Timer E schedule
    cadence: Retransmit,

    /// Timer F deadline
    timeout_at: Instant,
}

impl NonInviteClientTx {
    pub(crate) async fn send(
        endpoint: Endpoint,
        mut request: Request,
        target: &mut TargetTransportInfo,
    ) -> Result<Self> {
        let key = TxKey::client(request.line.method.clone());

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
            cadence: Retransmit::start(timers),
            timeout_at: Instant::now() + timers.tx_timeout(),
            request: outgoing,
        })
    }

    /// The request this transaction was created from
    pub fn request(&self) -> &OutgoingRequest {
        &self.request
    }

    /// Receive the next response.
    ///
    /// Retransmits the request on timer E until a final response is seen;
    /// errors with [`Error::RequestTimedOut`] when timer F fires.
    pub async fn receive(&mut self) -> Result<TxResponse> {
        let endpoint = self
            .inbox
            .as_ref()
            .expect("receive called after final response")
            .endpoint
            .clone();

        loop {
            enum Wake {
                Message(super::TxMessage),
                RetransmitDue,
                TimedOut,
            }

            let inbox = self.inbox.as_mut().expect("checked above");

            let wake = tokio::select! {
                message = inbox.receive() => Wake::Message(message),
                _ = sleep_until(self.cadence.deadline()), if !self.reliable => {
                    Wake::RetransmitDue
                }
                _ = sleep_until(self.timeout_at) => Wake::TimedOut,
            };

            match wake {
                Wake::Message(message) => {
                    let Some(response) = message.into_response() else {
                        continue;
                    };

                    if response.line.code.kind() == CodeKind::Provisional {
                        // Proceeding, retransmissions slow down to T2
                        self.cadence.slow_down();

                        return Ok(response);
                    }

                    // final response; the registration lingers for timer K
                    // to absorb retransmissions
                    let timers = *endpoint.timers();
                    let inbox = self.inbox.take().expect("borrowed above");
                    absorb(inbox, timers.absorb_window(self.reliable));

                    return Ok(response);
                }
                Wake::RetransmitDue => {
                    endpoint.send_outgoing_request(&mut self.request).await?;
                    self.cadence.advance();
                }
                Wake::TimedOut => {
                    self.inbox = None;
                    return Err(Error::RequestTimedOut);
                }
            }
        }
    }

    /// Receive responses until a final one arrives
    pub async fn receive_final(&mut self) -> Result<TxResponse> {
        loop {
            let response = self.receive().await?;

            if response.line.code.kind() != CodeKind::Provisional {
                return Ok(response);
            }
        }
    }
}
