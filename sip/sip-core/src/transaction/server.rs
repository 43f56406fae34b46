use super::TxInbox;
use crate::transport::OutgoingResponse;
use crate::{IncomingRequest, Result};
use sip_types::{CodeKind, Method};
use tokio::time::{Instant, timeout_at};

/// Non-INVITE server transaction (RFC 3261 §17.2.2), timer J.
///
/// Used to form and send responses to a non-INVITE request.
#[derive(Debug)]
pub struct ServerTx {
    inbox: TxInbox,
}

impl ServerTx {
    /// Internal: use [`Endpoint::create_server_tx`](crate::Endpoint::create_server_tx)
    pub(crate) fn new(request: &mut IncomingRequest) -> Self {
        assert_ne!(
            request.line.method,
            Method::INVITE,
            "tried to create non-INVITE transaction from INVITE request"
        );

        Self {
            inbox: request.take_inbox(),
        }
    }

    /// Send a provisional response, keeping the transaction open
    pub async fn respond_provisional(&mut self, response: &mut OutgoingResponse) -> Result<()> {
        assert_eq!(response.msg.line.code.kind(), CodeKind::Provisional);

        self.inbox
            .endpoint
            .send_outgoing_response(response)
            .await?;

        Ok(())
    }

    /// Send the final response.
    ///
    /// On unreliable transports the slot stays registered for timer J and a
    /// background task replays the response to retransmitted requests.
    pub async fn respond(mut self, mut response: OutgoingResponse) -> Result<()> {
        assert_ne!(response.msg.line.code.kind(), CodeKind::Provisional);

        let endpoint = self.inbox.endpoint.clone();

        endpoint.send_outgoing_response(&mut response).await?;

        if response.parts.transport.reliable() {
            return Ok(());
        }

        let window = endpoint.timers().tx_timeout();

        tokio::spawn(async move {
            let gone_at = Instant::now() + window;

            while let Ok(message) = timeout_at(gone_at, self.inbox.receive()).await {
                if message.request_method().is_none() {
                    continue;
                }

                if let Err(e) = endpoint.send_outgoing_response(&mut response).await {
                    log::debug!("failed to answer retransmitted request: {e}");
                    return;
                }
            }
        });

        Ok(())
    }
}
