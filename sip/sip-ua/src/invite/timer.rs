//! Opportunistic session timer support (RFC 4028).
//!
//! A Session-Expires offered by the peer is honored; the extension is never
//! required from peers that do not offer it.

use sip_core::transaction::TxResponse;
use sip_core::transport::OutgoingResponse;
use sip_core::{IncomingRequest, Request};
use sip_types::header::typed::{MinSe, Refresher, SessionExpires};
use std::future::pending;
use std::time::Duration;
use tokio::time::{Instant, sleep_until};

/// The smallest interval we accept before answering 422
pub const MIN_SESSION_EXPIRES_SECS: u32 = 90;

#[derive(Debug)]
pub struct SessionTimer {
    pub refresher: Refresher,
    interval: Option<Duration>,
    wake_at: Option<Instant>,
    /// True when the local side is responsible for refreshing
    local_refresh: bool,
}

impl SessionTimer {
    /// Peer did not offer the timer extension; [`wait`](Self::wait) never
    /// fires
    pub fn new_unsupported() -> Self {
        Self {
            refresher: Refresher::Unspecified,
            interval: None,
            wake_at: None,
            local_refresh: false,
        }
    }

    /// UAS side: honor a Session-Expires offered in the INVITE and echo the
    /// negotiated value into the success response
    pub fn uas_from_invite(invite: &IncomingRequest, response: &mut OutgoingResponse) -> Self {
        let Ok(Some(offered)) = invite.headers.try_typed::<SessionExpires>() else {
            return Self::new_unsupported();
        };

        let delta_secs = offered.delta_secs.max(MIN_SESSION_EXPIRES_SECS);

        // when the peer leaves the refresher open the UAC takes the role
        let refresher = match offered.refresher {
            Refresher::Unspecified => Refresher::Uac,
            other => other,
        };

        let negotiated = SessionExpires {
            delta_secs,
            refresher,
        };

        response.msg.headers.insert_typed(&negotiated);

        Self::from_negotiated(negotiated, /* we are uas */ refresher == Refresher::Uas)
    }

    /// UAC side: adopt the Session-Expires from the success response
    pub fn uac_from_response(response: &TxResponse) -> Self {
        let Ok(Some(negotiated)) = response.headers.try_typed::<SessionExpires>() else {
            return Self::new_unsupported();
        };

        let local_refresh = negotiated.refresher == Refresher::Uac;

        Self::from_negotiated(negotiated, local_refresh)
    }

    fn from_negotiated(negotiated: SessionExpires, local_refresh: bool) -> Self {
        let interval = Duration::from_secs(u64::from(negotiated.delta_secs));

        let mut timer = Self {
            refresher: negotiated.refresher,
            interval: Some(interval),
            wake_at: None,
            local_refresh,
        };

        timer.reset();
        timer
    }

    /// Re-arm the timer after a refresh or re-INVITE
    pub fn reset(&mut self) {
        self.wake_at = self.interval.map(|interval| {
            // refreshers act at half time, the passive side waits the full
            // interval before declaring the session dead
            let wait = if self.local_refresh {
                interval / 2
            } else {
                interval
            };

            Instant::now() + wait
        });
    }

    /// True when the local side must send the refresh re-INVITE
    pub fn local_refresh(&self) -> bool {
        self.local_refresh
    }

    /// Wait for the timer to fire; pending forever when the extension is not
    /// in use
    pub async fn wait(&mut self) {
        match self.wake_at {
            Some(at) => sleep_until(at).await,
            None => pending().await,
        }
    }

    /// Add the negotiated Session-Expires to a refresh request
    pub fn populate_refresh(&self, request: &mut Request) {
        if let Some(interval) = self.interval {
            request.headers.insert_typed(&SessionExpires {
                delta_secs: interval.as_secs() as u32,
                refresher: self.refresher,
            });
            request.headers.insert_typed(&MinSe(MIN_SESSION_EXPIRES_SECS));
        }
    }

    pub fn in_use(&self) -> bool {
        self.interval.is_some()
    }
}
