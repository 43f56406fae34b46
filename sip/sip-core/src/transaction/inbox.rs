use super::{TxKey, TxMessage};
use crate::Endpoint;
use tokio::sync::mpsc;

/// Receiving side of a registered transaction.
///
/// While the inbox lives, the registry routes every message matching its key
/// into it; dropping the inbox closes the slot and unregisters the
/// transaction.
pub(crate) struct TxInbox {
    pub(crate) endpoint: Endpoint,
    pub(crate) key: TxKey,
    receiver: mpsc::UnboundedReceiver<TxMessage>,
}

impl TxInbox {
    pub(crate) fn new(
        endpoint: Endpoint,
        key: TxKey,
        receiver: mpsc::UnboundedReceiver<TxMessage>,
    ) -> Self {
        Self {
            endpoint,
            key,
            receiver,
        }
    }

    /// Receive the next message routed into this transaction
    pub(crate) async fn receive(&mut self) -> TxMessage {
        self.receiver
            .recv()
            .await
            .expect("slot sender lives while the inbox is registered")
    }

    /// Install a predicate on the registry slot; messages it turns away
    /// re-enter the endpoint as unmatched traffic
    pub(crate) fn add_filter<F>(&mut self, filter: F)
    where
        F: Fn(&TxMessage) -> bool + Send + 'static,
    {
        self.endpoint
            .transactions()
            .set_filter(&self.key, Box::new(filter));
    }
}

impl Drop for TxInbox {
    fn drop(&mut self) {
        self.endpoint.transactions().close(&self.key);
    }
}

impl std::fmt::Debug for TxInbox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TxInbox")
            .field("key", &self.key)
            .finish_non_exhaustive()
    }
}
