//! Push adapter contract: waking mobile devices that keep no registration.

use std::time::{Duration, SystemTime};

/// Grace window a woken device has to register before the fan-out moves on
pub const WAKE_GRACE: Duration = Duration::from_secs(8);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WakeOutcome {
    /// The wake event was handed to the gateway
    Ok,
    /// The extension has no usable push token
    NoToken,
}

/// A "ring your phone" wake event
#[derive(Debug, Clone)]
pub struct WakeEvent {
    pub extension: String,
    pub call_id: String,
    pub caller: String,
    /// When ringing will have moved on without the device
    pub deadline: SystemTime,
}

/// Gateway delivering wake events to FCM/APNs, implemented outside the core
#[async_trait::async_trait]
pub trait PushAdapter: Send + Sync + 'static {
    async fn wake(&self, event: WakeEvent) -> WakeOutcome;
}

/// Adapter used when no push gateway is wired up
pub struct NoPush;

#[async_trait::async_trait]
impl PushAdapter for NoPush {
    async fn wake(&self, _event: WakeEvent) -> WakeOutcome {
        WakeOutcome::NoToken
    }
}

#[cfg(test)]
pub(crate) mod mock {
    use super::*;
    use parking_lot::Mutex;

    pub(crate) struct MockPush {
        pub(crate) woken: Mutex<Vec<WakeEvent>>,
    }

    impl MockPush {
        pub(crate) fn new() -> Self {
            Self {
                woken: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait::async_trait]
    impl PushAdapter for MockPush {
        async fn wake(&self, event: WakeEvent) -> WakeOutcome {
            self.woken.lock().push(event);
            WakeOutcome::Ok
        }
    }
}
