//! Trunk lifecycle management.
//!
//! Every configured trunk runs as its own task: register-type trunks keep a
//! REGISTER binding alive with digest auth and exponential backoff, ip-type
//! trunks probe the peer with OPTIONS. The registry owns the tasks and offers
//! atomic start/stop/restart plus a full reload.

use crate::config::{TrunkConfig, TrunkType};
use crate::metrics::Metrics;
use parking_lot::Mutex;
use rand::Rng;
use sip_auth::{ClientAuthenticator, DigestAuthenticator, DigestCredentials, DigestUser,
    RequestParts, ResponseParts};
use sip_core::transport::TargetTransportInfo;
use sip_core::{Endpoint, Request};
use sip_types::header::typed::Contact;
use sip_types::host::HostPort;
use sip_types::uri::{NameAddr, SipUri};
use sip_types::{CodeKind, Method, StatusCode};
use sip_ua::register::RegisterSession;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Base delay of the registration retry backoff
const BACKOFF_BASE: Duration = Duration::from_secs(5);
/// Ceiling of the retry backoff
const BACKOFF_CAP: Duration = Duration::from_secs(300);
/// OPTIONS probe cadence; an unhealthy trunk is never probed faster
const OPTIONS_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrunkStatus {
    Registering,
    Registered,
    Failed,
    OptionsHealthy,
    OptionsUnhealthy,
}

impl TrunkStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TrunkStatus::Registering => "registering",
            TrunkStatus::Registered => "registered",
            TrunkStatus::Failed => "failed",
            TrunkStatus::OptionsHealthy => "options_healthy",
            TrunkStatus::OptionsUnhealthy => "options_unhealthy",
        }
    }

    /// Whether outbound routes may select this trunk
    pub fn selectable(&self) -> bool {
        matches!(self, TrunkStatus::Registered | TrunkStatus::OptionsHealthy)
    }
}

/// Live state of one trunk, the single source of truth for route selection
#[derive(Debug, Clone)]
pub struct TrunkState {
    pub id: String,
    pub trunk_type: TrunkType,
    pub status: TrunkStatus,
    pub retry_attempt: u32,
    pub registered_at: Option<SystemTime>,
    pub expires_at: Option<SystemTime>,
    pub failed_at: Option<SystemTime>,
    pub last_options_at: Option<SystemTime>,
    pub last_error: Option<String>,
}

impl TrunkState {
    fn new(config: &TrunkConfig) -> Self {
        Self {
            id: config.id.clone(),
            trunk_type: config.trunk_type,
            status: match config.trunk_type {
                TrunkType::Register => TrunkStatus::Registering,
                TrunkType::Ip => TrunkStatus::OptionsUnhealthy,
            },
            retry_attempt: 0,
            registered_at: None,
            expires_at: None,
            failed_at: None,
            last_options_at: None,
            last_error: None,
        }
    }
}

struct TrunkEntry {
    config: TrunkConfig,
    state: Arc<Mutex<TrunkState>>,
    cancel: CancellationToken,
}

/// Result of a one-shot TestRegister / TestOptions probe
#[derive(Debug, Clone)]
pub struct ProbeResult {
    pub status_code: u16,
    pub elapsed: Duration,
}

#[derive(Debug, thiserror::Error)]
pub enum TrunkError {
    #[error("unknown trunk {0}")]
    Unknown(String),
    #[error(transparent)]
    Core(#[from] sip_core::Error),
    #[error("registration rejected with status {0}")]
    Rejected(StatusCode),
    #[error("authentication failed: {0}")]
    Auth(#[from] sip_auth::DigestError),
}

/// Owns all trunk tasks, indexed by trunk id
pub struct TrunkManager {
    endpoint: Endpoint,
    metrics: Arc<Metrics>,
    /// Host placed into From/To/Contact of trunk requests
    local_domain: String,
    entries: Mutex<HashMap<String, TrunkEntry>>,
}

impl TrunkManager {
    pub fn new(endpoint: Endpoint, metrics: Arc<Metrics>, local_domain: String) -> Self {
        Self {
            endpoint,
            metrics,
            local_domain,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Current state of one trunk
    pub fn state(&self, id: &str) -> Option<TrunkState> {
        self.entries
            .lock()
            .get(id)
            .map(|entry| entry.state.lock().clone())
    }

    /// States of all managed trunks
    pub fn states(&self) -> Vec<TrunkState> {
        self.entries
            .lock()
            .values()
            .map(|entry| entry.state.lock().clone())
            .collect()
    }

    /// Whether a trunk is currently eligible for outbound routing
    pub fn is_selectable(&self, id: &str) -> bool {
        self.state(id)
            .map(|state| state.status.selectable())
            .unwrap_or(false)
    }

    /// Start (or restart) the task for a trunk
    pub fn start(self: Arc<Self>, config: TrunkConfig) {
        let mut entries = self.entries.lock();

        if let Some(previous) = entries.remove(&config.id) {
            previous.cancel.cancel();
        }

        let state = Arc::new(Mutex::new(TrunkState::new(&config)));
        let cancel = CancellationToken::new();

        let entry = TrunkEntry {
            config: config.clone(),
            state: state.clone(),
            cancel: cancel.clone(),
        };

        entries.insert(config.id.clone(), entry);
        drop(entries);

        let manager = self.clone();

        tokio::spawn(async move {
            match config.trunk_type {
                TrunkType::Register => {
                    manager.register_loop(config, state, cancel).await;
                }
                TrunkType::Ip => {
                    manager.options_loop(config, state, cancel).await;
                }
            }
        });

        self.refresh_status_metric();
    }

    /// Stop a trunk's task; register trunks unbind on a best-effort basis
    pub fn stop(&self, id: &str) -> Result<(), TrunkError> {
        let mut entries = self.entries.lock();

        let entry = entries
            .remove(id)
            .ok_or_else(|| TrunkError::Unknown(id.to_owned()))?;

        entry.cancel.cancel();

        self.refresh_status_metric();

        Ok(())
    }

    pub fn restart(self: Arc<Self>, id: &str) -> Result<(), TrunkError> {
        let config = {
            let entries = self.entries.lock();
            entries
                .get(id)
                .map(|entry| entry.config.clone())
                .ok_or_else(|| TrunkError::Unknown(id.to_owned()))?
        };

        self.start(config);

        Ok(())
    }

    /// Stop everything and start the enabled trunks of a new configuration.
    ///
    /// Callers keep the previous trunk set when reading the new configuration
    /// failed; this function is only reached with a valid config.
    pub fn reload(self: Arc<Self>, trunks: &[TrunkConfig]) {
        let old: Vec<String> = self.entries.lock().keys().cloned().collect();

        for id in old {
            let _ = self.stop(&id);
        }

        for config in trunks.iter().filter(|t| t.enabled) {
            self.clone().start(config.clone());
        }
    }

    /// One-shot registration probe on a cloned configuration; the persistent
    /// loop is not touched
    pub async fn test_register(&self, config: &TrunkConfig) -> Result<ProbeResult, TrunkError> {
        let started = Instant::now();

        let mut session = self.register_session(config);
        let mut authenticator = self.authenticator(config);
        let mut target = TargetTransportInfo::default();

        let code = register_exchange(
            &self.endpoint,
            &mut session,
            &mut authenticator,
            &mut target,
            false,
        )
        .await
        .map(|_| StatusCode::OK)
        .or_else(|e| match e {
            TrunkError::Rejected(code) => Ok(code),
            other => Err(other),
        })?;

        Ok(ProbeResult {
            status_code: code.into_u16(),
            elapsed: started.elapsed(),
        })
    }

    /// One-shot OPTIONS probe
    pub async fn test_options(&self, config: &TrunkConfig) -> Result<ProbeResult, TrunkError> {
        let started = Instant::now();

        let code = self.options_exchange(config).await?;

        Ok(ProbeResult {
            status_code: code.into_u16(),
            elapsed: started.elapsed(),
        })
    }

    fn trunk_uri(&self, config: &TrunkConfig) -> SipUri {
        let mut host_port: HostPort = HostPort::host_name(config.host.as_str());
        host_port.port = Some(config.port);

        let mut uri = SipUri::new(host_port);

        if !config.transport.eq_ignore_ascii_case("udp") {
            uri.uri_params
                .push_or_edit("transport", config.transport.to_ascii_lowercase());
        }

        uri
    }

    fn register_session(&self, config: &TrunkConfig) -> RegisterSession {
        let username = config.username.clone().unwrap_or_else(|| config.id.clone());

        let registrar = self.trunk_uri(config);

        let id = NameAddr::uri(registrar.clone().user(username.clone()));

        let contact = Contact::new(NameAddr::uri(
            SipUri::new(HostPort::host_name(self.local_domain.as_str())).user(username),
        ));

        RegisterSession::new(
            id,
            contact,
            registrar,
            Duration::from_secs(config.expiry),
        )
    }

    fn authenticator(&self, config: &TrunkConfig) -> DigestAuthenticator {
        let mut credentials = DigestCredentials::new();

        if let (Some(username), Some(password)) = (&config.username, &config.password) {
            credentials.set_default(DigestUser::new(username.clone(), password.clone()));
        }

        DigestAuthenticator::new(credentials)
    }

    /// Persistent REGISTER loop with refresh at 0.75x and backoff on failure
    async fn register_loop(
        self: Arc<Self>,
        config: TrunkConfig,
        state: Arc<Mutex<TrunkState>>,
        cancel: CancellationToken,
    ) {
        let mut session = self.register_session(&config);
        let mut target = TargetTransportInfo::default();

        loop {
            {
                let mut state = state.lock();
                state.status = TrunkStatus::Registering;
            }
            self.refresh_status_metric();

            // a fresh authenticator per attempt, nonces do not survive backoff
            let mut authenticator = self.authenticator(&config);

            let wait = match register_exchange(
                &self.endpoint,
                &mut session,
                &mut authenticator,
                &mut target,
                false,
            )
            .await
            {
                Ok(granted) => {
                    let mut state = state.lock();
                    state.status = TrunkStatus::Registered;
                    state.retry_attempt = 0;
                    state.registered_at = Some(SystemTime::now());
                    state.expires_at = Some(SystemTime::now() + granted);
                    state.last_error = None;

                    log::info!(
                        "trunk {} registered, binding expires in {granted:?}",
                        config.id
                    );

                    granted.mul_f64(0.75)
                }
                Err(e) => {
                    let attempt = {
                        let mut state = state.lock();
                        state.status = TrunkStatus::Failed;
                        state.retry_attempt += 1;
                        state.failed_at = Some(SystemTime::now());
                        state.last_error = Some(e.to_string());
                        state.retry_attempt
                    };

                    self.metrics.trunk_failures.inc();

                    let wait = backoff_delay(attempt);

                    log::warn!(
                        "trunk {} registration failed (attempt {attempt}): {e}; retrying in {wait:?}",
                        config.id
                    );

                    // a failed transport target is re-resolved on retry
                    target = TargetTransportInfo::default();

                    wait
                }
            };

            self.refresh_status_metric();

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(wait) => {}
            }
        }

        // best-effort unbind on the way out
        let mut authenticator = self.authenticator(&config);

        let remove = tokio::time::timeout(
            Duration::from_secs(5),
            register_exchange(
                &self.endpoint,
                &mut session,
                &mut authenticator,
                &mut target,
                true,
            ),
        )
        .await;

        if !matches!(remove, Ok(Ok(_))) {
            log::debug!("trunk {} unbind did not complete", config.id);
        }

        state.lock().status = TrunkStatus::Failed;
    }

    /// Periodic OPTIONS health probe for ip-type trunks
    async fn options_loop(
        self: Arc<Self>,
        config: TrunkConfig,
        state: Arc<Mutex<TrunkState>>,
        cancel: CancellationToken,
    ) {
        let mut interval = tokio::time::interval(OPTIONS_INTERVAL);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {}
            }

            let healthy = match self.options_exchange(&config).await {
                // 405 still proves the peer is reachable and speaking SIP
                Ok(code) => {
                    code.kind() == CodeKind::Success || code == StatusCode::METHOD_NOT_ALLOWED
                }
                Err(e) => {
                    log::debug!("trunk {} OPTIONS probe failed: {e}", config.id);
                    false
                }
            };

            {
                let mut state = state.lock();
                state.last_options_at = Some(SystemTime::now());
                state.status = if healthy {
                    TrunkStatus::OptionsHealthy
                } else {
                    state.failed_at = Some(SystemTime::now());
                    TrunkStatus::OptionsUnhealthy
                };
            }

            if !healthy {
                self.metrics.trunk_failures.inc();
            }

            self.refresh_status_metric();
        }
    }

    async fn options_exchange(&self, config: &TrunkConfig) -> Result<StatusCode, TrunkError> {
        let uri = self.trunk_uri(config);

        let mut request = Request::new(Method::OPTIONS, uri.clone());

        let local = NameAddr::uri(
            SipUri::new(HostPort::host_name(self.local_domain.as_str())).user("flowpbx"),
        );

        request.headers.insert_typed(&sip_types::header::typed::FromTo::new(
            local,
            Some(sip_ua::random_tag()),
        ));
        request.headers.insert_typed_named(
            sip_types::Name::TO,
            &sip_types::header::typed::FromTo::new(NameAddr::uri(uri), None),
        );
        request
            .headers
            .insert_typed(&sip_types::header::typed::CallID::new(sip_ua::random_call_id()));
        request.headers.insert_typed(&sip_types::header::typed::CSeq::new(
            sip_ua::random_sequence_number(),
            Method::OPTIONS,
        ));

        let mut target = TargetTransportInfo::default();

        let mut transaction = self.endpoint.send_request(request, &mut target).await?;
        let response = transaction.receive_final().await?;

        Ok(response.line.code)
    }

    fn refresh_status_metric(&self) {
        let mut counts: HashMap<&'static str, i64> = HashMap::from([
            ("registering", 0),
            ("registered", 0),
            ("failed", 0),
            ("options_healthy", 0),
            ("options_unhealthy", 0),
        ]);

        for state in self.states() {
            *counts.entry(state.status.as_str()).or_insert(0) += 1;
        }

        for (status, count) in counts {
            self.metrics
                .trunk_status
                .with_label_values(&[status])
                .set(count);
        }
    }
}

/// Drive one REGISTER exchange to a final conclusion, solving digest
/// challenges and 423 adjustments along the way
async fn register_exchange(
    endpoint: &Endpoint,
    session: &mut RegisterSession,
    authenticator: &mut DigestAuthenticator,
    target: &mut TargetTransportInfo,
    remove_binding: bool,
) -> Result<Duration, TrunkError> {
    loop {
        let mut request = session.create_register(remove_binding);

        for allow in endpoint.allowed() {
            request.headers.insert_typed(allow);
        }

        authenticator.authorize_request(&mut request.headers);

        let mut transaction = endpoint.send_request(request, target).await?;
        let response = transaction.receive_final().await?;

        match response.line.code.kind() {
            CodeKind::Success => {
                let granted = session.receive_success_response(&response);
                return Ok(granted);
            }
            _ => match response.line.code {
                StatusCode::UNAUTHORIZED | StatusCode::PROXY_AUTHENTICATION_REQUIRED => {
                    authenticator.handle_rejection(
                        RequestParts {
                            line: &transaction.request().msg.line,
                            headers: &transaction.request().msg.headers,
                            body: &transaction.request().msg.body,
                        },
                        ResponseParts {
                            line: &response.line,
                            headers: &response.headers,
                            body: &response.body,
                        },
                    )?;
                }
                StatusCode::INTERVAL_TOO_BRIEF => {
                    if !session.receive_error_response(&response) {
                        return Err(TrunkError::Rejected(response.line.code));
                    }
                }
                code => return Err(TrunkError::Rejected(code)),
            },
        }
    }
}

/// Exponential backoff: 5s * 2^(attempt-1), +-20% jitter, capped at 300s
fn backoff_delay(attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(16);
    let base = BACKOFF_BASE * 2u32.saturating_pow(exponent);
    let capped = base.min(BACKOFF_CAP);

    let jitter = rand::rng().random_range(0.8..=1.2);

    capped.mul_f64(jitter)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn backoff_schedule() {
        for (attempt, expected_secs) in [(1u32, 5u64), (2, 10), (3, 20), (4, 40), (5, 80)] {
            let delay = backoff_delay(attempt);
            let expected = Duration::from_secs(expected_secs);

            assert!(
                delay >= expected.mul_f64(0.8) && delay <= expected.mul_f64(1.2),
                "attempt {attempt}: {delay:?} outside +-20% of {expected:?}"
            );
        }
    }

    #[test]
    fn backoff_caps_at_five_minutes() {
        for _ in 0..32 {
            assert!(backoff_delay(30) <= BACKOFF_CAP.mul_f64(1.2));
        }
    }

    #[test]
    fn selectable_statuses() {
        assert!(TrunkStatus::Registered.selectable());
        assert!(TrunkStatus::OptionsHealthy.selectable());
        assert!(!TrunkStatus::Failed.selectable());
        assert!(!TrunkStatus::Registering.selectable());
        assert!(!TrunkStatus::OptionsUnhealthy.selectable());
    }
}
