//! RFC 3261 §17 transaction layer.
//!
//! Transactions are owned state machines driven by the layer above. Each
//! alive transaction has a slot in the shared registry; the endpoint hands
//! incoming messages to [`TransactionRegistry::deliver`], which either drops
//! them into the owning transaction's inbox or opens a fresh inbox so a
//! server transaction can be built around the message. Retransmissions are
//! the only frames a transaction emits on its own.

use crate::transport::MessageTpInfo;
use crate::{BaseHeaders, Endpoint};
use bytes::Bytes;
use bytesstr::BytesStr;
use parking_lot::Mutex;
use sip_types::msg::{MessageLine, StatusLine};
use sip_types::Headers;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::mpsc;

mod client;
mod client_inv;
mod inbox;
mod key;
mod server;
mod server_inv;

pub use client::NonInviteClientTx;
pub use client_inv::InviteClientTx;
pub use key::TxKey;
pub use server::ServerTx;
pub use server_inv::{InviteAccepted, InviteServerTx};

pub(crate) use inbox::TxInbox;

pub const RFC3261_BRANCH_PREFIX: &str = "z9hG4bK";

/// Base timer values from RFC 3261, globally overridable on the endpoint
#[derive(Debug, Clone, Copy)]
pub struct TimerConfig {
    /// RTT estimate, controls retransmission cadence
    pub t1: Duration,
    /// Retransmission cap
    pub t2: Duration,
    /// Maximum lifetime of a message in the network
    pub t4: Duration,
}

impl Default for TimerConfig {
    fn default() -> Self {
        Self {
            t1: Duration::from_millis(500),
            t2: Duration::from_secs(4),
            t4: Duration::from_secs(5),
        }
    }
}

impl TimerConfig {
    /// Timer B/F/H: overall transaction timeout
    pub fn tx_timeout(&self) -> Duration {
        64 * self.t1
    }

    /// Timer D: absorb window for retransmitted final responses (UAC side)
    pub(crate) fn timer_d(&self, reliable: bool) -> Duration {
        if reliable {
            Duration::ZERO
        } else {
            Duration::from_secs(32)
        }
    }

    /// Timer K/I: absorb window after completion
    pub(crate) fn absorb_window(&self, reliable: bool) -> Duration {
        if reliable { Duration::ZERO } else { self.t4 }
    }
}

/// Doubling retransmission cadence: starts at T1, caps at T2.
///
/// Shared by every state machine that retransmits on an unreliable
/// transport (timers A, E and G all follow this schedule).
#[derive(Debug)]
pub(crate) struct Retransmit {
    delta: Duration,
    at: tokio::time::Instant,
    cap: Duration,
}

impl Retransmit {
    pub(crate) fn start(timers: &TimerConfig) -> Self {
        Self {
            delta: timers.t1,
            at: tokio::time::Instant::now() + timers.t1,
            cap: timers.t2,
        }
    }

    pub(crate) fn deadline(&self) -> tokio::time::Instant {
        self.at
    }

    /// Double the interval (bounded by T2) and schedule the next shot
    pub(crate) fn advance(&mut self) {
        self.delta = (self.delta * 2).min(self.cap);
        self.at = tokio::time::Instant::now() + self.delta;
    }

    /// Drop to the slow T2 cadence, used once a provisional response proves
    /// the far end is alive
    pub(crate) fn slow_down(&mut self) {
        self.delta = self.cap;
        self.at = tokio::time::Instant::now() + self.delta;
    }
}

/// Predicate a transaction can install to turn messages away from its inbox
type MessageFilter = Box<dyn Fn(&TxMessage) -> bool + Send>;

/// Sending side of one registered transaction
struct TxSlot {
    to_inbox: mpsc::UnboundedSender<TxMessage>,
    filter: Option<MessageFilter>,
}

/// What happened to a message handed to [`TransactionRegistry::deliver`]
pub(crate) enum Delivery {
    /// The owning transaction consumed the message
    Done,
    /// A matching slot exists but turned the message away (filter, or the
    /// inbox is already gone)
    Refused(TxMessage),
    /// Nothing matched; a fresh inbox was opened under the message's key
    Opened(TxInbox, TxMessage),
    /// Nothing matched and opening was not requested (responses)
    Unmatched,
}

/// Shared registry of alive transactions, keyed by [`TxKey`]
#[derive(Default)]
pub(crate) struct TransactionRegistry {
    slots: Mutex<HashMap<TxKey, TxSlot>>,
}

impl TransactionRegistry {
    /// Route a message to its transaction.
    ///
    /// With `open_on_miss` (requests), a miss atomically opens an inbox so
    /// the retransmission of the same request finds the slot even before the
    /// TU built its server transaction.
    pub(crate) fn deliver(
        &self,
        endpoint: &Endpoint,
        key: &TxKey,
        message: TxMessage,
        open_on_miss: bool,
    ) -> Delivery {
        let mut slots = self.slots.lock();

        if let Some(slot) = slots.get(key) {
            if let Some(filter) = &slot.filter {
                if !filter(&message) {
                    return Delivery::Refused(message);
                }
            }

            return match slot.to_inbox.send(message) {
                Ok(()) => Delivery::Done,
                Err(rejected) => Delivery::Refused(rejected.0),
            };
        }

        if !open_on_miss {
            return Delivery::Unmatched;
        }

        let inbox = open_slot(&mut slots, endpoint, key.clone());

        Delivery::Opened(inbox, message)
    }

    /// Open the inbox for a client transaction before its request is sent
    pub(crate) fn open(&self, endpoint: &Endpoint, key: TxKey) -> TxInbox {
        open_slot(&mut self.slots.lock(), endpoint, key)
    }

    pub(crate) fn set_filter(&self, key: &TxKey, filter: MessageFilter) {
        if let Some(slot) = self.slots.lock().get_mut(key) {
            slot.filter = Some(filter);
        }
    }

    pub(crate) fn close(&self, key: &TxKey) {
        self.slots.lock().remove(key);
    }
}

fn open_slot(
    slots: &mut HashMap<TxKey, TxSlot>,
    endpoint: &Endpoint,
    key: TxKey,
) -> TxInbox {
    let (to_inbox, receiver) = mpsc::unbounded_channel();

    let evicted = slots.insert(
        key.clone(),
        TxSlot {
            to_inbox,
            filter: None,
        },
    );

    // branches are 23 bits of randomness per RFC 3261; a collision here
    // would mean two live transactions share one
    debug_assert!(evicted.is_none(), "transaction key collision on {key}");

    TxInbox::new(endpoint.clone(), key, receiver)
}

/// Response received inside a client transaction
#[derive(Debug)]
pub struct TxResponse {
    pub tp_info: MessageTpInfo,

    pub line: StatusLine,
    pub base_headers: BaseHeaders,
    pub headers: Headers,
    pub body: Bytes,
}

/// Any message routed into a transaction's inbox
#[derive(Debug)]
pub struct TxMessage {
    pub tp_info: MessageTpInfo,

    pub line: MessageLine,
    pub base_headers: BaseHeaders,
    pub headers: Headers,
    pub body: Bytes,
}

impl TxMessage {
    pub(crate) fn into_response(self) -> Option<TxResponse> {
        match self.line {
            MessageLine::Response(line) => Some(TxResponse {
                tp_info: self.tp_info,
                line,
                base_headers: self.base_headers,
                headers: self.headers,
                body: self.body,
            }),
            MessageLine::Request(_) => None,
        }
    }

    /// The method of a request message, `None` for responses
    pub(crate) fn request_method(&self) -> Option<&sip_types::Method> {
        match &self.line {
            MessageLine::Request(line) => Some(&line.method),
            MessageLine::Response(_) => None,
        }
    }
}

pub(crate) fn generate_branch() -> BytesStr {
    use rand::Rng;

    let mut rng = rand::rng();

    let mut branch = String::with_capacity(RFC3261_BRANCH_PREFIX.len() + 16);
    branch.push_str(RFC3261_BRANCH_PREFIX);

    for _ in 0..16 {
        branch.push(char::from(rng.sample(rand::distr::Alphanumeric)));
    }

    branch.into()
}

/// Keep an inbox registered for `window`, absorbing late retransmissions
pub(crate) fn absorb(mut inbox: TxInbox, window: Duration) {
    if window.is_zero() {
        return;
    }

    tokio::spawn(async move {
        let deadline = tokio::time::Instant::now() + window;

        loop {
            if tokio::time::timeout_at(deadline, inbox.receive()).await.is_err() {
                break;
            }
        }
    });
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn branches_carry_the_magic_cookie() {
        let a = generate_branch();
        let b = generate_branch();

        assert!(a.starts_with(RFC3261_BRANCH_PREFIX));
        assert_eq!(a.len(), RFC3261_BRANCH_PREFIX.len() + 16);
        assert_ne!(a, b);
    }

    #[tokio::test(start_paused = true)]
    async fn retransmit_cadence_doubles_up_to_t2() {
        let timers = TimerConfig::default();
        let mut cadence = Retransmit::start(&timers);

        let start = tokio::time::Instant::now();
        assert_eq!(cadence.deadline() - start, timers.t1);

        cadence.advance();
        assert_eq!(cadence.deadline() - start, timers.t1 * 2);

        for _ in 0..8 {
            cadence.advance();
        }

        // long since capped
        assert!(cadence.deadline() - tokio::time::Instant::now() <= timers.t2);
    }
}
