//! Extension registrar: inbound REGISTER handling and the contact binding
//! table used by the bell fan-out.

use crate::metrics::Metrics;
use crate::ratelimit::RateLimiter;
use crate::snapshot::SnapshotStore;
use bytesstr::BytesStr;
use parking_lot::Mutex;
use sip_auth::{DigestUser, DigestVerifier, VerifyOutcome};
use sip_core::{Endpoint, IncomingRequest, Layer, MayClaim};
use sip_types::header::typed::{AuthResponse, Contact, Expires};
use sip_types::uri::SipUri;
use sip_types::{Method, Name, StatusCode};
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::Instant;

const DEFAULT_EXPIRY_SECS: u32 = 300;
const MIN_EXPIRY_SECS: u32 = 60;
const SWEEP_INTERVAL: Duration = Duration::from_secs(30);

/// One registered contact of an extension
#[derive(Debug, Clone)]
pub struct Binding {
    pub extension: String,
    /// Contact as usable for reaching the device (NAT rewritten)
    pub contact: Contact,
    pub source: SocketAddr,
    pub transport_name: &'static str,
    pub user_agent: Option<BytesStr>,
    pub expires_at: Instant,
}

impl Binding {
    fn is_expired(&self) -> bool {
        self.expires_at <= Instant::now()
    }
}

/// Shared binding table plus the digest verifier challenging REGISTERs
pub struct Registrar {
    verifier: DigestVerifier,
    snapshots: Arc<SnapshotStore>,
    metrics: Arc<Metrics>,
    auth_limiter: RateLimiter<IpAddr>,
    bindings: Mutex<HashMap<String, Vec<Binding>>>,

    /// Fired with the extension number whenever a binding appears, the
    /// push-wake grace window listens here
    registered_tx: broadcast::Sender<String>,
}

impl Registrar {
    pub fn new(realm: &str, snapshots: Arc<SnapshotStore>, metrics: Arc<Metrics>) -> Self {
        let (registered_tx, _) = broadcast::channel(64);

        Self {
            verifier: DigestVerifier::new(BytesStr::from(realm)),
            snapshots,
            metrics,
            auth_limiter: RateLimiter::new(5, 10),
            bindings: Mutex::new(HashMap::new()),
            registered_tx,
        }
    }

    pub fn verifier(&self) -> &DigestVerifier {
        &self.verifier
    }

    /// Subscribe to "extension registered" notifications
    pub fn subscribe_registrations(&self) -> broadcast::Receiver<String> {
        self.registered_tx.subscribe()
    }

    /// Unexpired bindings of an extension
    pub fn lookup(&self, extension: &str) -> Vec<Binding> {
        let mut bindings = self.bindings.lock();

        let Some(list) = bindings.get_mut(extension) else {
            return Vec::new();
        };

        list.retain(|binding| !binding.is_expired());

        list.clone()
    }

    /// True when the extension has at least one active binding
    pub fn is_registered(&self, extension: &str) -> bool {
        !self.lookup(extension).is_empty()
    }

    /// Count of bindings of an extension currently in a confirmed call is
    /// tracked by the controller; the registrar only counts contacts
    pub fn binding_count(&self) -> usize {
        self.bindings.lock().values().map(Vec::len).sum()
    }

    /// Periodically purge expired bindings
    pub fn spawn_sweeper(self: Arc<Self>) {
        let registrar = Arc::downgrade(&self);

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(SWEEP_INTERVAL);

            loop {
                interval.tick().await;

                let Some(registrar) = registrar.upgrade() else {
                    break;
                };

                let mut bindings = registrar.bindings.lock();

                for list in bindings.values_mut() {
                    list.retain(|binding| !binding.is_expired());
                }
                bindings.retain(|_, list| !list.is_empty());

                registrar.metrics.registrations.set(
                    bindings.values().map(Vec::len).sum::<usize>() as i64,
                );
            }
        });
    }

    async fn handle_register(&self, endpoint: &Endpoint, mut request: IncomingRequest) {
        let result = self.process_register(endpoint, &mut request).await;

        if let Err(e) = result {
            log::warn!("failed to answer REGISTER: {e}");
        }
    }

    async fn process_register(
        &self,
        endpoint: &Endpoint,
        request: &mut IncomingRequest,
    ) -> sip_core::Result<()> {
        let aor_user = request
            .base_headers
            .to
            .uri
            .uri
            .user
            .clone()
            .unwrap_or_else(|| BytesStr::from_static(""));

        let snapshot = self.snapshots.load();

        let Some(extension) = snapshot.extension(aor_user.as_str()) else {
            let response = endpoint.create_response(request, StatusCode::NOT_FOUND, None);
            let tx = endpoint.create_server_tx(request);
            return tx.respond(response).await;
        };

        let user = DigestUser::new(extension.number.clone(), extension.password.clone());

        match self.check_digest(request, &user) {
            AuthCheck::Ok => {}
            AuthCheck::Challenge { stale } => {
                // repeated failures from one source are throttled before any
                // crypto work happens on the next attempt
                if !stale && !self.auth_limiter.check(&request.tp_info.source.ip()) {
                    let response =
                        endpoint.create_response(request, StatusCode::FORBIDDEN, None);
                    let tx = endpoint.create_server_tx(request);
                    return tx.respond(response).await;
                }

                let mut response =
                    endpoint.create_response(request, StatusCode::UNAUTHORIZED, None);

                // SHA-256 preferred, MD5 offered for older phones
                response
                    .msg
                    .headers
                    .insert_typed(&self.verifier.challenge(stale));
                response
                    .msg
                    .headers
                    .insert_typed(&self.verifier.challenge_md5(stale));

                let tx = endpoint.create_server_tx(request);
                return tx.respond(response).await;
            }
        }

        // global registration cap; refreshes of already bound extensions
        // stay allowed
        if self.binding_count() >= snapshot.config.limits.max_registrations
            && self.lookup(aor_user.as_str()).is_empty()
        {
            let response =
                endpoint.create_response(request, StatusCode::SERVICE_UNAVAILABLE, None);
            let tx = endpoint.create_server_tx(request);
            return tx.respond(response).await;
        }

        // authenticated, apply the contact changes
        let granted = self.apply_contacts(request, extension.max_registrations);

        let mut response = endpoint.create_response(request, StatusCode::OK, None);

        match granted {
            Ok(bindings) => {
                for binding in &bindings {
                    let remaining = binding
                        .expires_at
                        .saturating_duration_since(Instant::now())
                        .as_secs() as u32;

                    let mut contact = binding.contact.clone();
                    contact
                        .params
                        .push_or_edit("expires", remaining.to_string());

                    response.msg.headers.insert_typed(&contact);
                }

                self.metrics.registrations.set(self.binding_count() as i64);

                let tx = endpoint.create_server_tx(request);
                tx.respond(response).await?;

                let _ = self.registered_tx.send(aor_user.as_str().to_owned());

                Ok(())
            }
            Err(code) => {
                let response = endpoint.create_response(request, code, None);
                let tx = endpoint.create_server_tx(request);
                tx.respond(response).await
            }
        }
    }

    fn check_digest(&self, request: &IncomingRequest, user: &DigestUser) -> AuthCheck {
        let Ok(Some(AuthResponse::Digest(digest))) =
            request.headers.try_typed::<AuthResponse>()
        else {
            return AuthCheck::Challenge { stale: false };
        };

        match self.verifier.verify(&request.line.method, &digest, user) {
            VerifyOutcome::Ok => AuthCheck::Ok,
            VerifyOutcome::Stale => AuthCheck::Challenge { stale: true },
            VerifyOutcome::Rejected => AuthCheck::Challenge { stale: false },
        }
    }

    /// Apply the REGISTER's contact changes and return the active bindings
    fn apply_contacts(
        &self,
        request: &IncomingRequest,
        max_registrations: usize,
    ) -> Result<Vec<Binding>, StatusCode> {
        let extension = request
            .base_headers
            .to
            .uri
            .uri
            .user
            .clone()
            .unwrap_or_else(|| BytesStr::from_static(""))
            .as_str()
            .to_owned();

        let top_expires = request
            .headers
            .try_typed::<Expires>()
            .ok()
            .flatten()
            .map(|Expires(secs)| secs);

        // wildcard unbind: "Contact: *" with Expires: 0
        let is_wildcard = request
            .headers
            .get(&Name::CONTACT)
            .is_some_and(|value| value.as_str().trim() == "*");

        let mut bindings = self.bindings.lock();

        if is_wildcard {
            if top_expires == Some(0) {
                bindings.remove(&extension);
                return Ok(Vec::new());
            }

            return Err(StatusCode::BAD_REQUEST);
        }

        let contacts = request
            .headers
            .typed_list::<Contact>()
            .map_err(|_| StatusCode::BAD_REQUEST)?;

        let list = bindings.entry(extension.clone()).or_default();
        list.retain(|binding| !binding.is_expired());

        for contact in contacts {
            let mut expires = contact.expires().or(top_expires).unwrap_or(DEFAULT_EXPIRY_SECS);

            if expires != 0 {
                expires = expires.clamp(MIN_EXPIRY_SECS, DEFAULT_EXPIRY_SECS);
            }

            let rewritten = nat_rewrite(&contact, request.tp_info.source);

            let existing = list.iter_mut().position(|binding| {
                binding.contact.addr.uri.compare(&rewritten.addr.uri)
            });

            if expires == 0 {
                // Expires=0 removes exactly the matching contact
                if let Some(idx) = existing {
                    list.remove(idx);
                }
                continue;
            }

            let binding = Binding {
                extension: extension.clone(),
                contact: rewritten,
                source: request.tp_info.source,
                transport_name: request.tp_info.transport.name(),
                user_agent: request.headers.get(&Name::USER_AGENT).cloned(),
                expires_at: Instant::now() + Duration::from_secs(u64::from(expires)),
            };

            match existing {
                // a refresh updates in place, no duplicate row appears
                Some(idx) => list[idx] = binding,
                None => {
                    if list.len() >= max_registrations {
                        return Err(StatusCode::SERVICE_UNAVAILABLE);
                    }
                    list.push(binding);
                }
            }
        }

        Ok(list.clone())
    }
}

enum AuthCheck {
    Ok,
    Challenge { stale: bool },
}

/// Rewrite the contact's host to the observed source when the device is
/// behind NAT and registered an unreachable private address
fn nat_rewrite(contact: &Contact, source: SocketAddr) -> Contact {
    let mut contact = contact.clone();

    let advertised_ip = contact.addr.uri.host_port.ip();
    let advertised_port = contact.addr.uri.host_port.port.unwrap_or(5060);

    let matches_source =
        advertised_ip == Some(source.ip()) && advertised_port == source.port();

    if !matches_source {
        contact.addr.uri.host_port = source.into();
    }

    contact
}

/// Endpoint layer claiming REGISTER requests
pub struct RegistrarLayer {
    pub registrar: Arc<Registrar>,
}

#[async_trait::async_trait]
impl Layer for RegistrarLayer {
    fn name(&self) -> &'static str {
        "registrar"
    }

    async fn receive(&self, endpoint: &Endpoint, request: MayClaim<'_, IncomingRequest>) {
        if request.line.method != Method::REGISTER {
            return;
        }

        self.registrar
            .handle_register(endpoint, request.claim())
            .await;
    }
}

/// Build a SIP URI pointing at a registered binding
pub fn binding_uri(binding: &Binding) -> SipUri {
    binding.contact.addr.uri.clone()
}

#[cfg(test)]
mod test {
    use super::*;
    use sip_types::uri::NameAddr;

    #[test]
    fn nat_rewrite_replaces_private_addr() {
        let contact = Contact::new(NameAddr::uri(
            "sip:100@192.168.1.50:5060".parse().unwrap(),
        ));

        let rewritten = nat_rewrite(&contact, "203.0.113.9:31337".parse().unwrap());

        assert_eq!(
            rewritten.addr.uri.to_string(),
            "sip:100@203.0.113.9:31337"
        );
    }

    #[test]
    fn matching_addr_is_untouched() {
        let contact = Contact::new(NameAddr::uri(
            "sip:100@203.0.113.9:5060".parse().unwrap(),
        ));

        let rewritten = nat_rewrite(&contact, "203.0.113.9:5060".parse().unwrap());

        assert_eq!(rewritten.addr.uri.to_string(), "sip:100@203.0.113.9:5060");
    }
}
