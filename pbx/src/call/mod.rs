//! Routing and call control.
//!
//! The [`CallControllerLayer`] claims every out-of-dialog request the
//! registrar did not take: INVITEs enter the routing pipeline, OPTIONS and
//! MESSAGE are answered inline. Each admitted call runs as its own task; the
//! controller only holds the shared lookups and counters.

use crate::cdr::CdrSink;
use crate::config::{FeatureCodeConfig, RingGroupConfig};
use crate::media::MediaRelay;
use crate::metrics::Metrics;
use crate::push::PushAdapter;
use crate::ratelimit::RateLimiter;
use crate::registrar::Registrar;
use crate::snapshot::{ConfigSnapshot, SnapshotStore};
use crate::trunk::TrunkManager;
use parking_lot::Mutex;
use sip_auth::{DigestUser, VerifyOutcome};
use sip_types::header::typed::{AuthResponse, RetryAfter};
use sip_types::{Method, Name, StatusCode};
use sip_core::{Endpoint, IncomingRequest, Layer, MayClaim};
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use tokio_util::sync::CancellationToken;

mod bridge;
mod fanout;
mod inbound;
mod outbound;
mod transfer;

pub use fanout::RingTarget;
pub use outbound::{pattern_matches, transform_digits};

/// Who a new INVITE is from, determining the authentication policy
#[derive(Debug)]
pub(crate) enum CallSource {
    /// Matched a trunk by source address, digest is skipped
    Trunk(String),
    /// An authenticated extension
    Extension(String),
}

/// Where an INVITE's request URI resolves to
#[derive(Debug)]
pub(crate) enum Destination {
    /// Ring an extension's bindings (plus follow-me)
    Extension(String),
    /// Ring all members of a group
    RingGroup(RingGroupConfig),
    /// A feature code action
    Feature(FeatureCodeConfig),
    /// Digits matched the outbound routing table
    External(String),
    /// Nothing matched
    Unknown,
}

/// The long-lived call controller state shared by all call tasks
pub struct CallController {
    pub(crate) snapshots: Arc<SnapshotStore>,
    pub(crate) registrar: Arc<Registrar>,
    pub(crate) relay: Arc<dyn MediaRelay>,
    pub(crate) push: Arc<dyn PushAdapter>,
    pub(crate) cdr: Arc<dyn CdrSink>,
    pub(crate) metrics: Arc<Metrics>,
    pub(crate) shutdown: CancellationToken,

    /// Set once the trunk manager exists (it needs the built endpoint)
    trunks: OnceLock<Arc<TrunkManager>>,

    invite_limiter: RateLimiter<IpAddr>,
    active_calls: AtomicUsize,
    max_calls: usize,

    /// Confirmed dialog count per extension, drives busy handling
    pub(crate) extension_calls: Mutex<HashMap<String, usize>>,
}

impl CallController {
    pub fn new(
        snapshots: Arc<SnapshotStore>,
        registrar: Arc<Registrar>,
        relay: Arc<dyn MediaRelay>,
        push: Arc<dyn PushAdapter>,
        cdr: Arc<dyn CdrSink>,
        metrics: Arc<Metrics>,
        shutdown: CancellationToken,
    ) -> Self {
        let limits = &snapshots.load().config.limits;

        Self {
            invite_limiter: RateLimiter::new(limits.invite_rate, limits.invite_burst),
            max_calls: limits.max_calls,
            snapshots,
            registrar,
            relay,
            push,
            cdr,
            metrics,
            shutdown,
            trunks: OnceLock::new(),
            active_calls: AtomicUsize::new(0),
            extension_calls: Mutex::new(HashMap::new()),
        }
    }

    /// Wire up the trunk manager after the endpoint was built
    pub fn set_trunks(&self, trunks: Arc<TrunkManager>) {
        let _ = self.trunks.set(trunks);
    }

    pub(crate) fn trunks(&self) -> Option<&Arc<TrunkManager>> {
        self.trunks.get()
    }

    pub fn active_calls(&self) -> usize {
        self.active_calls.load(Ordering::Relaxed)
    }

    /// Reserve a call slot; None when the configured maximum is reached
    pub(crate) fn try_admit_call(self: Arc<Self>) -> Option<CallSlot> {
        let previous = self.active_calls.fetch_add(1, Ordering::Relaxed);

        if previous >= self.max_calls {
            self.active_calls.fetch_sub(1, Ordering::Relaxed);
            return None;
        }

        self.metrics.calls_in_progress.set(previous as i64 + 1);

        Some(CallSlot { controller: self })
    }

    /// Identify and, where required, authenticate the caller.
    ///
    /// Trunks are recognized by source address; everything else must present
    /// digest credentials of a configured extension.
    pub(crate) fn classify_source(
        &self,
        snapshot: &ConfigSnapshot,
        request: &IncomingRequest,
    ) -> Result<CallSource, AuthFailure> {
        let source_ip = request.tp_info.source.ip().to_string();

        if let Some(trunk) = snapshot.trunk_for_source(&source_ip) {
            return Ok(CallSource::Trunk(trunk.id.clone()));
        }

        // also accept the registered binding source of a register trunk
        let from_user = request
            .base_headers
            .from
            .uri
            .uri
            .user
            .as_ref()
            .map(|user| user.as_str().to_owned())
            .unwrap_or_default();

        let Some(extension) = snapshot.extension(&from_user) else {
            return Err(AuthFailure::Unknown);
        };

        let user = DigestUser::new(extension.number.clone(), extension.password.clone());

        let Ok(Some(AuthResponse::Digest(digest))) =
            request.headers.try_typed::<AuthResponse>()
        else {
            return Err(AuthFailure::Challenge { stale: false });
        };

        match self
            .registrar
            .verifier()
            .verify(&request.line.method, &digest, &user)
        {
            VerifyOutcome::Ok => Ok(CallSource::Extension(from_user)),
            VerifyOutcome::Stale => Err(AuthFailure::Challenge { stale: true }),
            VerifyOutcome::Rejected => Err(AuthFailure::Challenge { stale: false }),
        }
    }

    /// Resolve the request URI's user part: extension, then ring group,
    /// inbound number, feature code, and finally the outbound routing table
    /// for authenticated extensions
    pub(crate) fn resolve_destination(
        &self,
        snapshot: &ConfigSnapshot,
        source: &CallSource,
        dialed: &str,
    ) -> Destination {
        if snapshot.extension(dialed).is_some() {
            return Destination::Extension(dialed.to_owned());
        }

        if let Some(group) = snapshot.ring_group(dialed) {
            return Destination::RingGroup(group.clone());
        }

        if let Some(entry) = snapshot.inbound_number(dialed) {
            if snapshot.extension(&entry.target).is_some() {
                return Destination::Extension(entry.target.clone());
            }

            if let Some(group) = snapshot.ring_group(&entry.target) {
                return Destination::RingGroup(group.clone());
            }

            log::warn!(
                "inbound number {dialed} targets unknown extension {}",
                entry.target
            );
            return Destination::Unknown;
        }

        if let Some(feature) = snapshot.feature_code(dialed) {
            return Destination::Feature(feature.clone());
        }

        // only extensions may reach the outbound routing table
        if matches!(source, CallSource::Extension(_))
            && snapshot
                .routes()
                .any(|route| pattern_matches(&route.pattern, dialed))
        {
            return Destination::External(dialed.to_owned());
        }

        Destination::Unknown
    }

    pub(crate) fn extension_busy(&self, snapshot: &ConfigSnapshot, extension: &str) -> bool {
        let limit = snapshot
            .extension(extension)
            .map(|ext| ext.max_registrations)
            .unwrap_or(1);

        let calls = self.extension_calls.lock();

        calls.get(extension).copied().unwrap_or(0) >= limit
    }

    pub(crate) fn mark_extension_in_call(self: Arc<Self>, extension: &str) -> ExtensionCallGuard {
        *self
            .extension_calls
            .lock()
            .entry(extension.to_owned())
            .or_insert(0) += 1;

        ExtensionCallGuard {
            extension: extension.to_owned(),
            controller: self,
        }
    }
}

pub(crate) enum AuthFailure {
    /// From user is not a configured extension
    Unknown,
    Challenge {
        stale: bool,
    },
}

/// Releases the call slot (and gauge) when the call task ends
pub(crate) struct CallSlot {
    controller: Arc<CallController>,
}

impl Drop for CallSlot {
    fn drop(&mut self) {
        let now = self
            .controller
            .active_calls
            .fetch_sub(1, Ordering::Relaxed)
            .saturating_sub(1);

        self.controller.metrics.calls_in_progress.set(now as i64);
    }
}

/// Decrements the per-extension call count on drop
pub(crate) struct ExtensionCallGuard {
    controller: Arc<CallController>,
    extension: String,
}

impl Drop for ExtensionCallGuard {
    fn drop(&mut self) {
        let mut calls = self.controller.extension_calls.lock();

        if let Some(count) = calls.get_mut(&self.extension) {
            *count = count.saturating_sub(1);

            if *count == 0 {
                calls.remove(&self.extension);
            }
        }
    }
}

/// Endpoint layer feeding the controller
pub struct CallControllerLayer {
    pub controller: Arc<CallController>,
}

#[async_trait::async_trait]
impl Layer for CallControllerLayer {
    fn name(&self) -> &'static str {
        "call-controller"
    }

    async fn receive(&self, endpoint: &Endpoint, request: MayClaim<'_, IncomingRequest>) {
        let method = request.line.method.clone();

        if method == Method::INVITE {
            inbound::handle_invite(self.controller.clone(), endpoint.clone(), request.claim())
                .await;
        } else if method == Method::OPTIONS {
            let mut request = request.claim();

            let mut response = endpoint.create_response(&request, StatusCode::OK, None);
            for allow in endpoint.allowed() {
                response.msg.headers.insert_typed(allow);
            }

            let tx = endpoint.create_server_tx(&mut request);
            if let Err(e) = tx.respond(response).await {
                log::warn!("failed to answer OPTIONS: {e}");
            }
        } else if method == Method::MESSAGE {
            self.handle_message(endpoint, request.claim()).await;
        } else if method == Method::ACK {
            // stray ACK outside any dialog, nothing to do
            request.claim();
        } else {
            // unsupported out-of-dialog method
            let mut request = request.claim();

            let mut response =
                endpoint.create_response(&request, StatusCode::METHOD_NOT_ALLOWED, None);
            for allow in endpoint.allowed() {
                response.msg.headers.insert_typed(allow);
            }

            let tx = endpoint.create_server_tx(&mut request);
            if let Err(e) = tx.respond(response).await {
                log::warn!("failed to reject {}: {e}", request.line.method);
            }
        }
    }
}

impl CallControllerLayer {
    /// MESSAGE pass-through: relay to the target extension's first binding
    async fn handle_message(&self, endpoint: &Endpoint, mut request: IncomingRequest) {
        let controller = &self.controller;

        let target = request
            .line
            .uri
            .user
            .as_ref()
            .map(|user| user.as_str().to_owned())
            .unwrap_or_default();

        let bindings = controller.registrar.lookup(&target);

        let code = if let Some(binding) = bindings.first() {
            let mut forward = request.clone_request();
            forward.line.uri = binding.contact.addr.uri.clone();
            forward.headers.remove(&Name::VIA);

            let mut target_info = sip_core::transport::TargetTransportInfo::default();

            match endpoint.send_request(forward, &mut target_info).await {
                Ok(mut tx) => {
                    tokio::spawn(async move {
                        let _ = tx.receive_final().await;
                    });

                    StatusCode::ACCEPTED
                }
                Err(e) => {
                    log::warn!("failed to forward MESSAGE to {target}: {e}");
                    StatusCode::SERVICE_UNAVAILABLE
                }
            }
        } else {
            StatusCode::NOT_FOUND
        };

        let response = endpoint.create_response(&request, code, None);
        let tx = endpoint.create_server_tx(&mut request);

        if let Err(e) = tx.respond(response).await {
            log::warn!("failed to answer MESSAGE: {e}");
        }
    }
}

/// Build a 503 with Retry-After for resource exhaustion responses
pub(crate) fn overload_response(
    endpoint: &Endpoint,
    request: &IncomingRequest,
) -> sip_core::transport::OutgoingResponse {
    let mut response =
        endpoint.create_response(request, StatusCode::SERVICE_UNAVAILABLE, None);

    response.msg.headers.insert_typed(&RetryAfter(10));

    response
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::cdr::ChannelCdrSink;
    use crate::media::mock::MockRelay;
    use crate::push::mock::MockPush;
    use crate::snapshot::ConfigSnapshot;

    fn controller() -> Arc<CallController> {
        let config: crate::config::PbxConfig = toml::from_str(
            r#"
            [sip]
            domain = "pbx.test"

            [[extension]]
            number = "100"
            password = "pw"
            max_registrations = 1

            [[inbound_number]]
            number = "+15551234567"
            target = "100"

            [[feature_code]]
            code = "*98"
            action = "voicemail_retrieval"

            [[trunk]]
            id = "carrier"
            type = "ip"
            host = "203.0.113.50"
            remote_hosts = ["198.51.100.9"]

            [[outbound_route]]
            pattern = "9."
            trunk = "carrier"
            "#,
        )
        .unwrap();

        let snapshots = Arc::new(SnapshotStore::new(ConfigSnapshot::compile(config)));
        let metrics = Arc::new(Metrics::new());
        let registrar = Arc::new(Registrar::new("pbx.test", snapshots.clone(), metrics.clone()));
        let (cdr_sink, _cdr_rx) = ChannelCdrSink::new();

        Arc::new(CallController::new(
            snapshots,
            registrar,
            Arc::new(MockRelay::new()),
            Arc::new(MockPush::new()),
            Arc::new(cdr_sink),
            metrics,
            CancellationToken::new(),
        ))
    }

    #[tokio::test]
    async fn destination_resolution_order() {
        let controller = controller();
        let snapshot = controller.snapshots.load();

        let from_extension = CallSource::Extension("100".into());
        let from_trunk = CallSource::Trunk("carrier".into());

        assert!(matches!(
            controller.resolve_destination(&snapshot, &from_trunk, "100"),
            Destination::Extension(ext) if ext == "100"
        ));

        assert!(matches!(
            controller.resolve_destination(&snapshot, &from_trunk, "+15551234567"),
            Destination::Extension(ext) if ext == "100"
        ));

        assert!(matches!(
            controller.resolve_destination(&snapshot, &from_extension, "*98"),
            Destination::Feature(code) if code.action == "voicemail_retrieval"
        ));

        // only extensions may use the outbound routing table
        assert!(matches!(
            controller.resolve_destination(&snapshot, &from_extension, "915551234"),
            Destination::External(_)
        ));
        assert!(matches!(
            controller.resolve_destination(&snapshot, &from_trunk, "915551234"),
            Destination::Unknown
        ));

        assert!(matches!(
            controller.resolve_destination(&snapshot, &from_trunk, "12345"),
            Destination::Unknown
        ));
    }

    #[tokio::test]
    async fn busy_accounting_follows_call_guards() {
        let controller = controller();
        let snapshot = controller.snapshots.load();

        assert!(!controller.extension_busy(&snapshot, "100"));

        let guard = controller.clone().mark_extension_in_call("100");

        // max_registrations = 1, so one confirmed call makes it busy
        assert!(controller.extension_busy(&snapshot, "100"));

        drop(guard);

        assert!(!controller.extension_busy(&snapshot, "100"));
    }

    #[tokio::test]
    async fn call_slots_cap_concurrency() {
        let controller = controller();

        let mut slots = Vec::new();

        for _ in 0..controller.max_calls {
            slots.push(controller.clone().try_admit_call().expect("slot free"));
        }

        assert!(controller.clone().try_admit_call().is_none());

        slots.pop();

        assert!(controller.clone().try_admit_call().is_some());
    }
}
