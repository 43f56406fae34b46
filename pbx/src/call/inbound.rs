//! Inbound INVITE pipeline: authenticate, resolve, program media, fan out.

use super::fanout::{self, FanoutOutcome, PendingCall, RingTarget};
use super::{AuthFailure, CallController, CallSource, Destination, bridge, outbound};
use crate::cdr::{CallDirection, CdrBuilder, Disposition};
use crate::config::{RecordingMode, RingStrategy};
use crate::push::{WAKE_GRACE, WakeEvent};
use crate::sdp::SdpView;
use bytes::Bytes;
use bytesstr::BytesStr;
use sip_core::{Endpoint, IncomingRequest};
use sip_types::header::typed::Contact;
use sip_types::host::HostPort;
use sip_types::uri::{NameAddr, SipUri};
use sip_types::StatusCode;
use sip_ua::dialog::Dialog;
use sip_ua::invite::InviteAcceptor;
use std::sync::Arc;
use std::time::Duration;

/// Entry point for a new out-of-dialog INVITE
pub(crate) async fn handle_invite(
    controller: Arc<CallController>,
    endpoint: Endpoint,
    mut request: IncomingRequest,
) {
    controller.metrics.invites_total.inc();

    // during shutdown no new calls are admitted
    if controller.shutdown.is_cancelled() {
        let response = super::overload_response(&endpoint, &request);
        let tx = endpoint.create_invite_server_tx(&mut request);
        if let Err(e) = tx.respond_failure(response).await {
            log::debug!("failed to reject INVITE during shutdown: {e}");
        }
        return;
    }

    // per-peer INVITE rate limiting happens before any state is allocated
    if !controller
        .invite_limiter
        .check(&request.tp_info.source.ip())
    {
        respond_failure_oneshot(&endpoint, request, StatusCode::SERVICE_UNAVAILABLE).await;
        return;
    }

    let Some(slot) = controller.clone().try_admit_call() else {
        let response = super::overload_response(&endpoint, &request);
        let tx = endpoint.create_invite_server_tx(&mut request);
        if let Err(e) = tx.respond_failure(response).await {
            log::warn!("failed to reject INVITE at capacity: {e}");
        }
        return;
    };

    let snapshot = controller.snapshots.load();

    // authentication policy: trunks by address, extensions by digest
    let source = match controller.classify_source(&snapshot, &request) {
        Ok(source) => source,
        Err(AuthFailure::Unknown) => {
            respond_failure_oneshot(&endpoint, request, StatusCode::FORBIDDEN).await;
            return;
        }
        Err(AuthFailure::Challenge { stale }) => {
            let mut response =
                endpoint.create_response(&request, StatusCode::UNAUTHORIZED, None);
            response
                .msg
                .headers
                .insert_typed(&controller.registrar.verifier().challenge(stale));
            response
                .msg
                .headers
                .insert_typed(&controller.registrar.verifier().challenge_md5(stale));

            let tx = endpoint.create_invite_server_tx(&mut request);
            if let Err(e) = tx.respond_failure(response).await {
                log::warn!("failed to challenge INVITE: {e}");
            }
            return;
        }
    };

    let dialed = request
        .line
        .uri
        .user
        .clone()
        .unwrap_or_else(|| BytesStr::from_static(""))
        .as_str()
        .to_owned();

    let destination = controller.resolve_destination(&snapshot, &source, &dialed);

    // the call task owns everything from here; panics must not take the
    // process down with them
    let task = tokio::spawn(run_call(
        controller.clone(),
        endpoint.clone(),
        request,
        source,
        destination,
    ));

    tokio::spawn(async move {
        if let Err(e) = task.await {
            if e.is_panic() {
                log::error!("call task panicked: {e}");
            }
        }

        drop(slot);
    });
}

async fn run_call(
    controller: Arc<CallController>,
    endpoint: Endpoint,
    mut request: IncomingRequest,
    source: CallSource,
    destination: Destination,
) {
    let call_id = request.base_headers.call_id.0.as_str().to_owned();
    let start_time = request.tp_info.timestamp;

    let caller = request
        .base_headers
        .from
        .uri
        .uri
        .user
        .as_ref()
        .map(|u| u.as_str().to_owned())
        .unwrap_or_else(|| "anonymous".to_owned());

    let dialed = request
        .line
        .uri
        .user
        .as_ref()
        .map(|u| u.as_str().to_owned())
        .unwrap_or_default();

    let direction = match (&source, &destination) {
        (CallSource::Trunk(_), _) => CallDirection::Inbound,
        (CallSource::Extension(_), Destination::External(_)) => CallDirection::Outbound,
        (CallSource::Extension(_), _) => CallDirection::Internal,
    };

    let mut cdr = CdrBuilder::new(&call_id, start_time, &caller, &dialed, direction);

    match destination {
        Destination::Extension(extension) => {
            ring_extension(
                controller, endpoint, request, source, extension, cdr,
            )
            .await;
        }
        Destination::RingGroup(group) => {
            ring_group(controller, endpoint, request, group, cdr).await;
        }
        Destination::External(digits) => {
            outbound::place_outbound_call(
                controller, endpoint, request, source, digits, cdr,
            )
            .await;
        }
        Destination::Feature(feature) => {
            cdr.push_flow_node(format!("feature:{}", feature.action));

            match feature.action.as_str() {
                "voicemail_deposit" | "voicemail_retrieval" => {
                    voicemail_answer(controller, endpoint, request, cdr).await;
                }
                other => {
                    log::warn!("unimplemented feature action {other}");
                    finalize_rejected(
                        &controller,
                        &endpoint,
                        request,
                        cdr,
                        StatusCode::NOT_FOUND,
                        "unknown_feature",
                    )
                    .await;
                }
            }
        }
        Destination::Unknown => {
            finalize_rejected(
                &controller,
                &endpoint,
                request,
                cdr,
                StatusCode::NOT_FOUND,
                "no_route",
            )
            .await;
        }
    }
}

/// Ring an extension: relay allocation, push wake, bell fan-out, bridge
async fn ring_extension(
    controller: Arc<CallController>,
    endpoint: Endpoint,
    mut request: IncomingRequest,
    _source: CallSource,
    extension: String,
    mut cdr: CdrBuilder,
) {
    let snapshot = controller.snapshots.load();

    cdr.push_flow_node(format!("extension:{extension}"));

    // busy handling before anything rings
    if controller.extension_busy(&snapshot, &extension) {
        finalize_rejected(
            &controller,
            &endpoint,
            request,
            cdr,
            StatusCode::BUSY_HERE,
            "busy",
        )
        .await;
        return;
    }

    let call_id = cdr.call_id.clone();

    // 100 Trying pins the start of the call
    let local_contact = local_contact(&snapshot.config.sip.domain);

    let dialog = match Dialog::new_server(endpoint.clone(), &request, local_contact) {
        Ok(dialog) => dialog,
        Err(e) => {
            log::warn!("INVITE without usable Contact: {e}");
            finalize_rejected(
                &controller,
                &endpoint,
                request,
                cdr,
                StatusCode::BAD_REQUEST,
                "bad_request",
            )
            .await;
            return;
        }
    };

    let trying = endpoint.create_response(&request, StatusCode::TRYING, None);
    let offer = request.body.clone();

    let mut acceptor = InviteAcceptor::new(dialog, request);

    if let Err(e) = acceptor.respond_provisional(trying).await {
        log::warn!("failed to send 100 Trying: {e}");
    }

    // program the relay before any bell rings
    let (answer_sdp, media_session) =
        match controller.relay.allocate(&call_id, offer.clone()).await {
            Ok(allocated) => allocated,
            Err(e) => {
                log::warn!("media relay allocation failed: {e}");
                reject_acceptor(acceptor, StatusCode::SERVICE_UNAVAILABLE).await;
                controller
                    .cdr
                    .emit(cdr.finalize(Disposition::Failed, "media_unavailable"));
                return;
            }
        };

    if let Some(view) = SdpView::parse(&offer) {
        if view.secure {
            cdr.push_flow_node("srtp".to_owned());
        }

        // the offer must share a codec with the configured priority list
        if !view.codecs.is_empty()
            && view.pick_codec(&snapshot.config.media.codecs).is_none()
        {
            reject_acceptor(acceptor, StatusCode::NOT_ACCEPTABLE_HERE).await;
            relay_release(&controller, &media_session).await;
            controller
                .cdr
                .emit(cdr.finalize(Disposition::Failed, "no_codec"));
            return;
        }
    }

    // wake push-only devices and give them the grace window to register
    let ext_config = snapshot.extension(&extension).cloned();

    if let Some(ext_config) = &ext_config {
        if ext_config.push_token.is_some() && !controller.registrar.is_registered(&extension) {
            let mut registered = controller.registrar.subscribe_registrations();

            let outcome = controller
                .push
                .wake(WakeEvent {
                    extension: extension.clone(),
                    call_id: call_id.clone(),
                    caller: cdr.caller.clone(),
                    deadline: std::time::SystemTime::now() + WAKE_GRACE,
                })
                .await;

            if outcome == crate::push::WakeOutcome::Ok {
                cdr.push_flow_node("push_wake".to_owned());

                let wait = async {
                    loop {
                        match registered.recv().await {
                            Ok(number) if number == extension => break,
                            Ok(_) => continue,
                            Err(_) => break,
                        }
                    }
                };

                // if the device does not appear in time the fan-out continues
                // as if the contact were unreachable
                let _ = tokio::time::timeout(WAKE_GRACE, wait).await;
            }
        }
    }

    // assemble the ring targets: bindings plus follow-me entries
    let default_timeout = ext_config
        .as_ref()
        .map(|ext| Duration::from_secs(ext.ring_timeout))
        .unwrap_or(Duration::from_secs(30));

    let mut targets: Vec<RingTarget> = controller
        .registrar
        .lookup(&extension)
        .into_iter()
        .map(|binding| RingTarget {
            uri: binding.contact.addr.uri.clone(),
            delay: Duration::ZERO,
            timeout: default_timeout,
            label: format!("binding:{}", binding.source),
        })
        .collect();

    let strategy = ext_config
        .as_ref()
        .and_then(|ext| ext.follow_me.as_ref())
        .map(|fm| fm.strategy)
        .unwrap_or(RingStrategy::Simultaneous);

    if let Some(follow_me) = ext_config.as_ref().and_then(|ext| ext.follow_me.as_ref()) {
        for entry in &follow_me.entries {
            if let Some(uri) = resolve_follow_me_target(&controller, &snapshot, &entry.target) {
                targets.push(RingTarget {
                    uri,
                    delay: Duration::from_secs(entry.delay),
                    timeout: Duration::from_secs(entry.timeout),
                    label: format!("follow_me:{}", entry.target),
                });
            }
        }
    }

    if targets.is_empty() {
        // nobody to ring; fall through to voicemail or reject
        if has_voicemail_fallback(&ext_config) {
            cdr.push_flow_node("voicemail".to_owned());
            voicemail_session(
                controller,
                acceptor,
                cdr,
                answer_sdp,
                media_session,
                extension,
            )
            .await;
        } else {
            reject_acceptor(acceptor, StatusCode::TEMPORARILY_UNAVAILABLE).await;
            relay_release(&controller, &media_session).await;
            controller
                .cdr
                .emit(cdr.finalize(Disposition::Failed, "no_bindings"));
        }
        return;
    }

    let pending = PendingCall::new(
        endpoint.clone(),
        snapshot.config.sip.domain.clone(),
        call_id.clone(),
        cdr.caller.clone(),
        answer_sdp.clone(),
        controller.shutdown.clone(),
    );

    let outcome = fanout::ring(pending, &mut acceptor, targets, strategy).await;

    match outcome {
        FanoutOutcome::Answered {
            mut far_session,
            callee_sdp,
        } => {
            // the winning branch is up; answer the caller with the relay SDP
            cdr.answered();

            let _in_call = controller.clone().mark_extension_in_call(&extension);

            let response = match acceptor
                .create_response(StatusCode::OK, None)
                .await
            {
                Ok(mut response) => {
                    response.msg.headers.insert_typed(
                        &sip_types::header::typed::ContentType::new("application/sdp"),
                    );
                    response.msg.body = answer_sdp.clone();
                    response
                }
                Err(e) => {
                    log::warn!("caller vanished before answer: {e}");
                    let _ = far_session.terminate().await;
                    relay_release(&controller, &media_session).await;
                    controller
                        .cdr
                        .emit(cdr.finalize(Disposition::Failed, "caller_gone"));
                    return;
                }
            };

            match acceptor.respond_success(response).await {
                Ok((near_session, _ack)) => {
                    // hand the callee's answer to the relay so both legs are
                    // anchored
                    if !callee_sdp.is_empty() {
                        let _ = controller.relay.update(&media_session, callee_sdp).await;
                    }

                    let recording = recording_path(&snapshot, &extension, &call_id);

                    if let Some(path) = &recording {
                        if controller
                            .relay
                            .start_recording(&media_session, path)
                            .await
                            .is_ok()
                        {
                            cdr.recording_file = Some(path.clone());
                        }
                    }

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
                    // the caller never completed; the half-established far
                    // leg gets a BYE
                    log::warn!("failed to answer caller: {e}");
                    let _ = far_session.terminate().await;
                    relay_release(&controller, &media_session).await;
                    controller
                        .cdr
                        .emit(cdr.finalize(Disposition::Failed, "answer_failed"));
                }
            }
        }
        FanoutOutcome::CallerCancelled => {
            let _ = respond_acceptor(acceptor, StatusCode::REQUEST_TERMINATED).await;
            relay_release(&controller, &media_session).await;
            controller
                .cdr
                .emit(cdr.finalize(Disposition::NoAnswer, "caller_cancelled"));
        }
        FanoutOutcome::AllBusy => {
            if has_voicemail_fallback(&ext_config) {
                cdr.push_flow_node("voicemail".to_owned());
                voicemail_session(
                    controller, acceptor, cdr, answer_sdp, media_session, extension,
                )
                .await;
            } else {
                let _ = respond_acceptor(acceptor, StatusCode::BUSY_HERE).await;
                relay_release(&controller, &media_session).await;
                controller
                    .cdr
                    .emit(cdr.finalize(Disposition::Busy, "busy"));
            }
        }
        FanoutOutcome::NoAnswer => {
            if has_voicemail_fallback(&ext_config) {
                cdr.push_flow_node("voicemail".to_owned());
                voicemail_session(
                    controller, acceptor, cdr, answer_sdp, media_session, extension,
                )
                .await;
            } else {
                let _ = respond_acceptor(acceptor, StatusCode::TEMPORARILY_UNAVAILABLE).await;
                relay_release(&controller, &media_session).await;
                controller
                    .cdr
                    .emit(cdr.finalize(Disposition::NoAnswer, "no_answer"));
            }
        }
        FanoutOutcome::Failed(code) => {
            let _ = respond_acceptor(acceptor, code).await;
            relay_release(&controller, &media_session).await;
            controller
                .cdr
                .emit(cdr.finalize(Disposition::Failed, "branch_failure"));
        }
    }
}

/// Ring every member of a group; the first member to answer takes the call
async fn ring_group(
    controller: Arc<CallController>,
    endpoint: Endpoint,
    request: IncomingRequest,
    group: crate::config::RingGroupConfig,
    mut cdr: CdrBuilder,
) {
    let snapshot = controller.snapshots.load();

    cdr.push_flow_node(format!("ring_group:{}", group.number));

    let local_contact = local_contact(&snapshot.config.sip.domain);

    let dialog = match Dialog::new_server(endpoint.clone(), &request, local_contact) {
        Ok(dialog) => dialog,
        Err(e) => {
            log::warn!("INVITE without usable Contact: {e}");
            finalize_rejected(
                &controller,
                &endpoint,
                request,
                cdr,
                StatusCode::BAD_REQUEST,
                "bad_request",
            )
            .await;
            return;
        }
    };

    let call_id = cdr.call_id.clone();
    let trying = endpoint.create_response(&request, StatusCode::TRYING, None);
    let offer = request.body.clone();

    let mut acceptor = InviteAcceptor::new(dialog, request);

    if let Err(e) = acceptor.respond_provisional(trying).await {
        log::warn!("failed to send 100 Trying: {e}");
    }

    let (answer_sdp, media_session) = match controller.relay.allocate(&call_id, offer).await {
        Ok(allocated) => allocated,
        Err(e) => {
            log::warn!("media relay allocation failed: {e}");
            reject_acceptor(acceptor, StatusCode::SERVICE_UNAVAILABLE).await;
            controller
                .cdr
                .emit(cdr.finalize(Disposition::Failed, "media_unavailable"));
            return;
        }
    };

    let member_timeout = Duration::from_secs(group.ring_timeout);

    let targets: Vec<RingTarget> = group
        .members
        .iter()
        .flat_map(|member| {
            controller
                .registrar
                .lookup(member)
                .into_iter()
                .map(move |binding| RingTarget {
                    uri: binding.contact.addr.uri.clone(),
                    delay: Duration::ZERO,
                    timeout: member_timeout,
                    label: format!("group_member:{member}"),
                })
        })
        .collect();

    if targets.is_empty() {
        reject_acceptor(acceptor, StatusCode::TEMPORARILY_UNAVAILABLE).await;
        relay_release(&controller, &media_session).await;
        controller
            .cdr
            .emit(cdr.finalize(Disposition::Failed, "no_members"));
        return;
    }

    let pending = PendingCall::new(
        endpoint.clone(),
        snapshot.config.sip.domain.clone(),
        call_id.clone(),
        cdr.caller.clone(),
        answer_sdp.clone(),
        controller.shutdown.clone(),
    );

    let outcome = fanout::ring(pending, &mut acceptor, targets, group.strategy).await;

    match outcome {
        FanoutOutcome::Answered {
            mut far_session,
            callee_sdp,
        } => {
            cdr.answered();

            let response = match acceptor.create_response(StatusCode::OK, None).await {
                Ok(mut response) => {
                    response.msg.headers.insert_typed(
                        &sip_types::header::typed::ContentType::new("application/sdp"),
                    );
                    response.msg.body = answer_sdp.clone();
                    response
                }
                Err(_) => {
                    let _ = far_session.terminate().await;
                    relay_release(&controller, &media_session).await;
                    controller
                        .cdr
                        .emit(cdr.finalize(Disposition::Failed, "caller_gone"));
                    return;
                }
            };

            match acceptor.respond_success(response).await {
                Ok((near_session, _ack)) => {
                    if !callee_sdp.is_empty() {
                        let _ = controller.relay.update(&media_session, callee_sdp).await;
                    }

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
                    relay_release(&controller, &media_session).await;
                    controller
                        .cdr
                        .emit(cdr.finalize(Disposition::Failed, "answer_failed"));
                }
            }
        }
        FanoutOutcome::CallerCancelled => {
            let _ = respond_acceptor(acceptor, StatusCode::REQUEST_TERMINATED).await;
            relay_release(&controller, &media_session).await;
            controller
                .cdr
                .emit(cdr.finalize(Disposition::NoAnswer, "caller_cancelled"));
        }
        FanoutOutcome::AllBusy => {
            let _ = respond_acceptor(acceptor, StatusCode::BUSY_HERE).await;
            relay_release(&controller, &media_session).await;
            controller.cdr.emit(cdr.finalize(Disposition::Busy, "busy"));
        }
        FanoutOutcome::NoAnswer => {
            let _ = respond_acceptor(acceptor, StatusCode::TEMPORARILY_UNAVAILABLE).await;
            relay_release(&controller, &media_session).await;
            controller
                .cdr
                .emit(cdr.finalize(Disposition::NoAnswer, "no_answer"));
        }
        FanoutOutcome::Failed(code) => {
            let _ = respond_acceptor(acceptor, code).await;
            relay_release(&controller, &media_session).await;
            controller
                .cdr
                .emit(cdr.finalize(Disposition::Failed, "branch_failure"));
        }
    }
}

/// Answer the call ourselves and record into the voicemail store
async fn voicemail_answer(
    controller: Arc<CallController>,
    endpoint: Endpoint,
    mut request: IncomingRequest,
    mut cdr: CdrBuilder,
) {
    let snapshot = controller.snapshots.load();
    let call_id = cdr.call_id.clone();
    let extension = cdr.callee.clone();

    let local_contact = local_contact(&snapshot.config.sip.domain);

    let dialog = match Dialog::new_server(endpoint.clone(), &request, local_contact) {
        Ok(dialog) => dialog,
        Err(_) => {
            finalize_rejected(
                &controller,
                &endpoint,
                request,
                cdr,
                StatusCode::BAD_REQUEST,
                "bad_request",
            )
            .await;
            return;
        }
    };

    let offer = request.body.clone();
    let acceptor = InviteAcceptor::new(dialog, request);

    let (answer_sdp, media_session) = match controller.relay.allocate(&call_id, offer).await {
        Ok(allocated) => allocated,
        Err(_) => {
            reject_acceptor(acceptor, StatusCode::SERVICE_UNAVAILABLE).await;
            controller
                .cdr
                .emit(cdr.finalize(Disposition::Failed, "media_unavailable"));
            return;
        }
    };

    cdr.answered();

    voicemail_session(
        controller,
        acceptor,
        cdr,
        answer_sdp,
        media_session,
        extension,
    )
    .await;
}

async fn voicemail_session(
    controller: Arc<CallController>,
    acceptor: InviteAcceptor,
    mut cdr: CdrBuilder,
    answer_sdp: Bytes,
    media_session: crate::media::SessionHandle,
    extension: String,
) {
    let response = match acceptor.create_response(StatusCode::OK, None).await {
        Ok(mut response) => {
            response
                .msg
                .headers
                .insert_typed(&sip_types::header::typed::ContentType::new("application/sdp"));
            response.msg.body = answer_sdp;
            response
        }
        Err(_) => {
            relay_release(&controller, &media_session).await;
            controller
                .cdr
                .emit(cdr.finalize(Disposition::Failed, "caller_gone"));
            return;
        }
    };

    match acceptor.respond_success(response).await {
        Ok((mut session, _ack)) => {
            let path = format!("voicemail/{extension}/{}.wav", cdr.call_id);

            if controller
                .relay
                .start_recording(&media_session, &path)
                .await
                .is_ok()
            {
                cdr.recording_file = Some(path);
            }

            // run until the caller hangs up
            loop {
                match session.run().await {
                    Ok(sip_ua::invite::InviteSessionEvent::Bye(bye)) => {
                        let _ = session.handle_bye(bye).await;
                        break;
                    }
                    Ok(sip_ua::invite::InviteSessionEvent::Terminated) | Err(_) => break,
                    Ok(_) => continue,
                }
            }

            let _ = controller.relay.stop_recording(&media_session).await;
            relay_release(&controller, &media_session).await;

            controller
                .cdr
                .emit(cdr.finalize(Disposition::Answered, "voicemail"));
        }
        Err(_) => {
            relay_release(&controller, &media_session).await;
            controller
                .cdr
                .emit(cdr.finalize(Disposition::NoAnswer, "caller_cancelled"));
        }
    }
}

async fn relay_release(
    controller: &Arc<CallController>,
    session: &crate::media::SessionHandle,
) {
    controller.relay.release(session).await;
}

fn has_voicemail_fallback(ext_config: &Option<crate::config::ExtensionConfig>) -> bool {
    ext_config
        .as_ref()
        .and_then(|ext| ext.unanswered_fallback.as_deref())
        .is_some_and(|fallback| fallback == "voicemail")
}

fn recording_path(
    snapshot: &crate::snapshot::ConfigSnapshot,
    extension: &str,
    call_id: &str,
) -> Option<String> {
    let mode = snapshot.extension(extension)?.recording_mode;

    match mode {
        RecordingMode::Always => Some(format!("recordings/{extension}/{call_id}.wav")),
        RecordingMode::OnDemand | RecordingMode::Never => None,
    }
}

fn resolve_follow_me_target(
    controller: &Arc<CallController>,
    snapshot: &crate::snapshot::ConfigSnapshot,
    target: &str,
) -> Option<SipUri> {
    // an extension target rings its first binding; external numbers go out
    // through the routing table
    if snapshot.extension(target).is_some() {
        return controller
            .registrar
            .lookup(target)
            .first()
            .map(|binding| binding.contact.addr.uri.clone());
    }

    outbound::route_uri_for_digits(controller, snapshot, target)
}

pub(crate) fn local_contact(domain: &str) -> Contact {
    Contact::new(NameAddr::uri(SipUri::new(HostPort::host_name(
        domain.to_owned(),
    ))))
}

async fn respond_acceptor(acceptor: InviteAcceptor, code: StatusCode) -> bool {
    match acceptor.create_response(code, None).await {
        Ok(response) => acceptor.respond_failure(response).await.is_ok(),
        Err(_) => false,
    }
}

async fn reject_acceptor(acceptor: InviteAcceptor, code: StatusCode) {
    if !respond_acceptor(acceptor, code).await {
        log::debug!("failed to send {code} to caller");
    }
}

async fn finalize_rejected(
    controller: &Arc<CallController>,
    endpoint: &Endpoint,
    request: IncomingRequest,
    cdr: CdrBuilder,
    code: StatusCode,
    cause: &str,
) {
    respond_failure_oneshot(endpoint, request, code).await;

    let disposition = match code {
        StatusCode::BUSY_HERE => Disposition::Busy,
        _ => Disposition::Failed,
    };

    controller.cdr.emit(cdr.finalize(disposition, cause));
}

async fn respond_failure_oneshot(
    endpoint: &Endpoint,
    mut request: IncomingRequest,
    code: StatusCode,
) {
    let response = endpoint.create_response(&request, code, None);
    let tx = endpoint.create_invite_server_tx(&mut request);

    if let Err(e) = tx.respond_failure(response).await {
        log::debug!("failed to send {code}: {e}");
    }
}
