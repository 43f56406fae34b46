//! Outbound routing: digit patterns, transforms, trunk selection and
//! failover.

use super::{CallController, CallSource, bridge, inbound};
use crate::cdr::{CdrBuilder, Disposition};
use crate::config::{CallerIdMode, OutboundRouteConfig, TrunkConfig};
use crate::snapshot::ConfigSnapshot;
use bytes::Bytes;
use sip_core::{Endpoint, IncomingRequest};
use sip_types::header::typed::ContentType;
use sip_types::host::HostPort;
use sip_types::uri::{NameAddr, SipUri};
use sip_types::{CodeKind, StatusCode};
use sip_ua::dialog::Dialog;
use sip_ua::invite::{InitiatorResponse, InviteAcceptor, InviteInitiator};
use std::sync::Arc;
use std::time::Duration;

/// Cap on route failover attempts for one call
const MAX_ROUTE_ATTEMPTS: usize = 3;

/// Deadline for an outbound attempt to produce a final response
const OUTBOUND_RING_TIMEOUT: Duration = Duration::from_secs(120);

/// Check a dialed number against a route pattern.
///
/// `X` matches any digit, `N` matches 2-9, `Z` matches 1-9, a trailing `.`
/// matches any non-empty remainder; everything else matches literally.
pub fn pattern_matches(pattern: &str, digits: &str) -> bool {
    let mut digits_iter = digits.chars();

    let mut pattern_iter = pattern.chars().peekable();

    while let Some(p) = pattern_iter.next() {
        if p == '.' && pattern_iter.peek().is_none() {
            // trailing wildcard needs at least one more digit
            return digits_iter.next().is_some();
        }

        let Some(d) = digits_iter.next() else {
            return false;
        };

        let matched = match p {
            'X' | 'x' => d.is_ascii_digit(),
            'N' | 'n' => matches!(d, '2'..='9'),
            'Z' | 'z' => matches!(d, '1'..='9'),
            literal => literal == d,
        };

        if !matched {
            return false;
        }
    }

    digits_iter.next().is_none()
}

/// Apply a route's strip/prepend transform
pub fn transform_digits(route: &OutboundRouteConfig, digits: &str) -> String {
    let stripped = digits.get(route.strip..).unwrap_or("");

    format!("{}{}", route.prepend, stripped)
}

/// The URI an external number would be dialed at, using the first eligible
/// route. Used by follow-me and transfer target resolution.
pub(crate) fn route_uri_for_digits(
    controller: &Arc<CallController>,
    snapshot: &ConfigSnapshot,
    digits: &str,
) -> Option<SipUri> {
    for route in snapshot.routes() {
        if !pattern_matches(&route.pattern, digits) {
            continue;
        }

        let selectable = controller
            .trunks()
            .map(|trunks| trunks.is_selectable(&route.trunk))
            .unwrap_or(false);

        if !selectable {
            continue;
        }

        let trunk = snapshot.trunk(&route.trunk)?;

        return Some(trunk_target_uri(trunk, &transform_digits(route, digits)));
    }

    None
}

fn trunk_target_uri(trunk: &TrunkConfig, digits: &str) -> SipUri {
    let mut host_port = HostPort::host_name(trunk.host.as_str());
    host_port.port = Some(trunk.port);

    let mut uri = SipUri::new(host_port).user(digits.to_owned());

    if !trunk.transport.eq_ignore_ascii_case("udp") {
        uri.uri_params
            .push_or_edit("transport", trunk.transport.to_ascii_lowercase());
    }

    uri
}

/// The From identity placed on the trunk leg, per the trunk's caller-id
/// policy
fn caller_identity(trunk: &TrunkConfig, caller: &str, domain: &str) -> NameAddr {
    let number = match trunk.caller_id_mode {
        CallerIdMode::Substitute => trunk
            .caller_id_number
            .clone()
            .unwrap_or_else(|| caller.to_owned()),
        CallerIdMode::PassThrough | CallerIdMode::PrependName => caller.to_owned(),
    };

    let uri = SipUri::new(HostPort::host_name(domain.to_owned())).user(number);

    match trunk.caller_id_mode {
        CallerIdMode::PrependName => match &trunk.caller_id_name {
            Some(name) => NameAddr::new(name.clone(), uri),
            None => NameAddr::uri(uri),
        },
        _ => NameAddr::uri(uri),
    }
}

enum AttemptOutcome {
    /// The trunk answered; the far session is ready to bridge
    Answered {
        far_session: sip_ua::invite::InviteSession,
    },
    /// Covers 486/487/408, which must not trigger failover
    FinalNoFailover(StatusCode),
    /// 4xx (other than the above) or transport error, try the next route
    Failover(StatusCode),
    CallerCancelled,
}

/// Place a call from an authenticated extension out through the routing
/// table
pub(crate) async fn place_outbound_call(
    controller: Arc<CallController>,
    endpoint: Endpoint,
    mut request: IncomingRequest,
    source: CallSource,
    digits: String,
    mut cdr: CdrBuilder,
) {
    let snapshot = controller.snapshots.load();

    let CallSource::Extension(caller_ext) = &source else {
        // trunks cannot dial back out
        inbound_reject(&controller, &endpoint, request, cdr, StatusCode::FORBIDDEN).await;
        return;
    };

    let call_id = cdr.call_id.clone();

    let local_contact = inbound::local_contact(&snapshot.config.sip.domain);

    let dialog = match Dialog::new_server(endpoint.clone(), &request, local_contact) {
        Ok(dialog) => dialog,
        Err(_) => {
            inbound_reject(&controller, &endpoint, request, cdr, StatusCode::BAD_REQUEST).await;
            return;
        }
    };

    let trying = endpoint.create_response(&request, StatusCode::TRYING, None);
    let offer = request.body.clone();

    let mut acceptor = Some(InviteAcceptor::new(dialog, request));

    if let Err(e) = acceptor
        .as_mut()
        .expect("just constructed")
        .respond_provisional(trying)
        .await
    {
        log::warn!("failed to send 100 Trying: {e}");
    }

    // relay first, the trunk leg is offered the relay's SDP
    let (answer_sdp, media_session) =
        match controller.relay.allocate(&call_id, offer).await {
            Ok(allocated) => allocated,
            Err(e) => {
                log::warn!("media relay allocation failed: {e}");
                let _ = respond_failure(
                    acceptor.take().expect("still held"),
                    StatusCode::SERVICE_UNAVAILABLE,
                )
                .await;
                controller
                    .cdr
                    .emit(cdr.finalize(Disposition::Failed, "media_unavailable"));
                return;
            }
        };

    let eligible: Vec<&OutboundRouteConfig> = snapshot
        .routes()
        .filter(|route| pattern_matches(&route.pattern, &digits))
        .collect();

    if eligible.is_empty() {
        let _ = respond_failure(acceptor.take().expect("still held"), StatusCode::NOT_FOUND)
            .await;
        controller.relay.release(&media_session).await;
        controller
            .cdr
            .emit(cdr.finalize(Disposition::Failed, "no_route"));
        return;
    }

    let mut attempts = 0usize;
    let mut last_code = StatusCode::SERVICE_UNAVAILABLE;

    for route in eligible {
        if attempts >= MAX_ROUTE_ATTEMPTS {
            break;
        }

        let selectable = controller
            .trunks()
            .map(|trunks| trunks.is_selectable(&route.trunk))
            .unwrap_or(false);

        if !selectable {
            log::debug!("route via {} skipped, trunk not selectable", route.trunk);
            continue;
        }

        let Some(trunk) = snapshot.trunk(&route.trunk) else {
            continue;
        };

        attempts += 1;

        let dialed = transform_digits(route, &digits);
        cdr.push_flow_node(format!("route:{}:{}", route.trunk, dialed));

        let outcome = attempt_trunk_call(
            &controller,
            &endpoint,
            &snapshot,
            acceptor.as_mut().expect("still held"),
            trunk,
            &dialed,
            caller_ext,
            &answer_sdp,
            &media_session,
        )
        .await;

        match outcome {
            AttemptOutcome::Answered { mut far_session } => {
                cdr.answered();

                let acceptor = acceptor.take().expect("still held");

                let ok = match acceptor.create_response(StatusCode::OK, None).await {
                    Ok(mut ok) => {
                        ok.msg
                            .headers
                            .insert_typed(&ContentType::new("application/sdp"));
                        ok.msg.body = answer_sdp.clone();
                        ok
                    }
                    Err(_) => {
                        let _ = far_session.terminate().await;
                        controller.relay.release(&media_session).await;
                        controller
                            .cdr
                            .emit(cdr.finalize(Disposition::NoAnswer, "caller_cancelled"));
                        return;
                    }
                };

                match acceptor.respond_success(ok).await {
                    Ok((near_session, _ack)) => {
                        let _in_call = controller.clone().mark_extension_in_call(caller_ext);

                        bridge::run_bridge(
                            controller.clone(),
                            endpoint,
                            near_session,
                            far_session,
                            media_session,
                            answer_sdp,
                            cdr,
                        )
                        .await;
                    }
                    Err(e) => {
                        log::warn!("failed to answer caller: {e}");
                        let _ = far_session.terminate().await;
                        controller.relay.release(&media_session).await;
                        controller
                            .cdr
                            .emit(cdr.finalize(Disposition::Failed, "answer_failed"));
                    }
                }

                return;
            }
            AttemptOutcome::CallerCancelled => {
                let _ = respond_failure(
                    acceptor.take().expect("still held"),
                    StatusCode::REQUEST_TERMINATED,
                )
                .await;
                controller.relay.release(&media_session).await;
                controller
                    .cdr
                    .emit(cdr.finalize(Disposition::NoAnswer, "caller_cancelled"));
                return;
            }
            AttemptOutcome::FinalNoFailover(code) => {
                let (disposition, cause) = match code {
                    StatusCode::BUSY_HERE => (Disposition::Busy, "busy"),
                    StatusCode::REQUEST_TIMEOUT => (Disposition::Failed, "timeout"),
                    _ => (Disposition::Failed, "trunk_final"),
                };

                let _ = respond_failure(acceptor.take().expect("still held"), code).await;
                controller.relay.release(&media_session).await;
                controller.cdr.emit(cdr.finalize(disposition, cause));
                return;
            }
            AttemptOutcome::Failover(code) => {
                last_code = code;
                continue;
            }
        }
    }

    // all routes exhausted
    let _ = respond_failure(acceptor.take().expect("still held"), last_code).await;
    controller.relay.release(&media_session).await;
    controller
        .cdr
        .emit(cdr.finalize(Disposition::Failed, "routes_exhausted"));
}

/// Drive one attempt towards one trunk up to its final response; 2xx
/// completes with an acknowledged far session
#[allow(clippy::too_many_arguments)]
async fn attempt_trunk_call(
    controller: &Arc<CallController>,
    endpoint: &Endpoint,
    snapshot: &ConfigSnapshot,
    acceptor: &mut InviteAcceptor,
    trunk: &TrunkConfig,
    dialed: &str,
    caller_ext: &str,
    relay_sdp: &Bytes,
    media_session: &crate::media::SessionHandle,
) -> AttemptOutcome {
    let target = trunk_target_uri(trunk, dialed);
    let identity = caller_identity(trunk, caller_ext, &snapshot.config.sip.domain);

    let mut initiator = InviteInitiator::new(
        endpoint.clone(),
        identity,
        inbound::local_contact(&snapshot.config.sip.domain),
        target,
    );

    let mut invite = initiator.create_invite();
    invite
        .headers
        .insert_typed(&ContentType::new("application/sdp"));
    invite.body = relay_sdp.clone();

    if let Err(e) = initiator.send_invite(invite).await {
        log::debug!("INVITE to trunk {} failed: {e}", trunk.id);
        return AttemptOutcome::Failover(StatusCode::SERVICE_UNAVAILABLE);
    }

    let deadline = tokio::time::Instant::now() + OUTBOUND_RING_TIMEOUT;
    let mut forwarded_ringing = false;

    loop {
        let received = tokio::select! {
            received = initiator.receive() => received,
            _ = acceptor.cancelled() => {
                let _ = initiator.cancel().await;
                return AttemptOutcome::CallerCancelled;
            }
            _ = tokio::time::sleep_until(deadline) => {
                let _ = initiator.cancel().await;
                return AttemptOutcome::FinalNoFailover(StatusCode::REQUEST_TIMEOUT);
            }
        };

        match received {
            Ok(InitiatorResponse::Provisional(response))
            | Ok(InitiatorResponse::Early(_, response)) => {
                if response.line.code.kind() == CodeKind::Provisional
                    && response.line.code != StatusCode::TRYING
                    && !forwarded_ringing
                {
                    if let Ok(ringing) =
                        acceptor.create_response(StatusCode::RINGING, None).await
                    {
                        if acceptor.respond_provisional(ringing).await.is_ok() {
                            forwarded_ringing = true;
                        }
                    }
                }
            }
            Ok(InitiatorResponse::EarlyEvent) => {}
            Ok(InitiatorResponse::Session(far_session, response)) => {
                if let Err(e) = far_session
                    .acknowledge(response.base_headers.cseq.cseq)
                    .await
                {
                    log::warn!("failed to ACK trunk leg: {e}");
                }

                if !response.body.is_empty() {
                    let _ = controller
                        .relay
                        .update(media_session, response.body.clone())
                        .await;
                }

                return AttemptOutcome::Answered { far_session };
            }
            Ok(InitiatorResponse::Failure(response)) => {
                let code = response.line.code;

                return match code {
                    StatusCode::BUSY_HERE
                    | StatusCode::REQUEST_TERMINATED
                    | StatusCode::REQUEST_TIMEOUT => AttemptOutcome::FinalNoFailover(code),
                    _ => AttemptOutcome::Failover(code),
                };
            }
            Ok(InitiatorResponse::Finished) => {
                return AttemptOutcome::Failover(StatusCode::SERVICE_UNAVAILABLE);
            }
            Err(sip_core::Error::RequestTimedOut) => {
                // timer B fired without any response from the trunk
                return AttemptOutcome::FinalNoFailover(StatusCode::REQUEST_TIMEOUT);
            }
            Err(e) => {
                log::debug!("trunk leg error: {e}");
                return AttemptOutcome::Failover(StatusCode::SERVICE_UNAVAILABLE);
            }
        }
    }
}

async fn respond_failure(acceptor: InviteAcceptor, code: StatusCode) -> bool {
    match acceptor.create_response(code, None).await {
        Ok(response) => acceptor.respond_failure(response).await.is_ok(),
        Err(_) => false,
    }
}

async fn inbound_reject(
    controller: &Arc<CallController>,
    endpoint: &Endpoint,
    mut request: IncomingRequest,
    cdr: CdrBuilder,
    code: StatusCode,
) {
    let response = endpoint.create_response(&request, code, None);
    let tx = endpoint.create_invite_server_tx(&mut request);

    if let Err(e) = tx.respond_failure(response).await {
        log::debug!("failed to reject outbound INVITE: {e}");
    }

    controller.cdr.emit(cdr.finalize(Disposition::Failed, "rejected"));
}

#[cfg(test)]
mod test {
    use super::*;

    fn route(pattern: &str, strip: usize, prepend: &str) -> OutboundRouteConfig {
        OutboundRouteConfig {
            pattern: pattern.to_owned(),
            trunk: "t".to_owned(),
            priority: 100,
            strip,
            prepend: prepend.to_owned(),
        }
    }

    #[test]
    fn patterns() {
        assert!(pattern_matches("9.", "915551234567"));
        assert!(!pattern_matches("9.", "9"));
        assert!(!pattern_matches("9.", "8155"));

        assert!(pattern_matches("NXXXXXX", "5551234"));
        assert!(!pattern_matches("NXXXXXX", "1551234"));
        assert!(!pattern_matches("NXXXXXX", "55512345"));

        assert!(pattern_matches("011.", "01149301234"));
        assert!(pattern_matches("112", "112"));
        assert!(!pattern_matches("112", "1123"));
    }

    #[test]
    fn transforms() {
        assert_eq!(transform_digits(&route("9.", 1, ""), "915551234"), "15551234");
        assert_eq!(
            transform_digits(&route("X.", 0, "+1"), "5551234"),
            "+15551234"
        );
    }
}
