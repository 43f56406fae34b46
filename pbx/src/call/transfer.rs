//! Blind transfer (RFC 3515 REFER with sipfrag progress).

use super::bridge::Leg;
use super::CallController;
use crate::media::SessionHandle;
use bytes::Bytes;
use sip_core::transport::TargetTransportInfo;
use sip_core::{Endpoint, Result};
use sip_types::header::typed::{ContentType, Event, ReferTo, SubscriptionState};
use sip_types::uri::SipUri;
use sip_types::{Method, StatusCode};
use sip_ua::dialog::Dialog;
use sip_ua::invite::session::ReferReceived;
use sip_ua::invite::{InitiatorResponse, InviteInitiator, InviteSession};
use std::sync::Arc;
use std::time::Duration;

/// Deadline for the transfer target to answer
const TRANSFER_TIMEOUT: Duration = Duration::from_secs(60);

/// Execute a blind transfer requested by `transferor`.
///
/// Returns the replacement session when the transfer target answered; the
/// transferor's dialog is then already torn down.
pub(crate) async fn blind_transfer(
    controller: &Arc<CallController>,
    endpoint: &Endpoint,
    leg: Leg,
    refer: ReferReceived,
    transferor: &mut InviteSession,
    media_session: &SessionHandle,
    relay_sdp: Bytes,
) -> Result<Option<InviteSession>> {
    let Ok(refer_to) = refer.refer.headers.typed::<ReferTo>() else {
        let response =
            transferor
                .dialog
                .create_response(&refer.refer, StatusCode::BAD_REQUEST, None)?;
        refer.transaction.respond(response).await?;
        return Ok(None);
    };

    log::info!(
        "blind transfer from {leg:?} towards {}",
        refer_to.addr.uri
    );

    // the REFER is accepted; progress follows via NOTIFY
    let response =
        transferor
            .dialog
            .create_response(&refer.refer, StatusCode::ACCEPTED, None)?;
    refer.transaction.respond(response).await?;

    let target = resolve_transfer_target(controller, &refer_to.addr.uri);

    notify_progress(transferor, StatusCode::TRYING, false).await;

    let snapshot = controller.snapshots.load();

    let mut initiator = InviteInitiator::new(
        endpoint.clone(),
        transferor.dialog.local_fromto.uri.clone(),
        super::inbound::local_contact(&snapshot.config.sip.domain),
        target,
    );

    let mut invite = initiator.create_invite();
    invite
        .headers
        .insert_typed(&ContentType::new("application/sdp"));
    invite.body = relay_sdp;

    if let Err(e) = initiator.send_invite(invite).await {
        log::warn!("transfer INVITE failed to send: {e}");
        notify_progress(transferor, StatusCode::SERVICE_UNAVAILABLE, true).await;
        return Ok(None);
    }

    let deadline = tokio::time::Instant::now() + TRANSFER_TIMEOUT;

    loop {
        let received = match tokio::time::timeout_at(deadline, initiator.receive()).await {
            Ok(received) => received,
            Err(_) => {
                let _ = initiator.cancel().await;
                notify_progress(transferor, StatusCode::REQUEST_TIMEOUT, true).await;
                return Ok(None);
            }
        };

        match received {
            Ok(InitiatorResponse::Provisional(response)) => {
                if response.line.code != StatusCode::TRYING {
                    notify_progress(transferor, response.line.code, false).await;
                }
            }
            Ok(InitiatorResponse::Early(_, response)) => {
                notify_progress(transferor, response.line.code, false).await;
            }
            Ok(InitiatorResponse::EarlyEvent) => {}
            Ok(InitiatorResponse::Session(session, response)) => {
                if let Err(e) = session.acknowledge(response.base_headers.cseq.cseq).await {
                    log::warn!("failed to ACK transfer target: {e}");
                }

                // anchor the transferee on the existing relay session
                if !response.body.is_empty() {
                    let _ = controller
                        .relay
                        .update(media_session, response.body.clone())
                        .await;
                }

                notify_progress(transferor, StatusCode::OK, true).await;

                // replacement is up, the original dialog is torn down
                if let Err(e) = transferor.terminate().await {
                    log::debug!("failed to BYE transferor: {e}");
                }

                return Ok(Some(session));
            }
            Ok(InitiatorResponse::Failure(response)) => {
                notify_progress(transferor, response.line.code, true).await;
                return Ok(None);
            }
            Ok(InitiatorResponse::Finished) => {
                notify_progress(transferor, StatusCode::REQUEST_TIMEOUT, true).await;
                return Ok(None);
            }
            Err(e) => {
                log::warn!("transfer leg error: {e}");
                notify_progress(transferor, StatusCode::SERVICE_UNAVAILABLE, true).await;
                return Ok(None);
            }
        }
    }
}

/// An extension target is replaced by its first registered binding
fn resolve_transfer_target(controller: &Arc<CallController>, uri: &SipUri) -> SipUri {
    let Some(user) = uri.user.as_ref() else {
        return uri.clone();
    };

    let snapshot = controller.snapshots.load();

    if snapshot.extension(user.as_str()).is_some() {
        if let Some(binding) = controller.registrar.lookup(user.as_str()).first() {
            return binding.contact.addr.uri.clone();
        }
    }

    uri.clone()
}

/// Send a NOTIFY with a `message/sipfrag` body reporting transfer progress
async fn notify_progress(transferor: &InviteSession, code: StatusCode, terminal: bool) {
    let dialog: &Dialog = &transferor.dialog;

    let mut notify = dialog.create_request(Method::NOTIFY);

    notify
        .headers
        .insert_typed(&Event(bytesstr::BytesStr::from_static("refer")));

    let state = if terminal {
        SubscriptionState::terminated("noresource")
    } else {
        SubscriptionState::active(60)
    };
    notify.headers.insert_typed(&state);

    notify
        .headers
        .insert_typed(&ContentType::new("message/sipfrag;version=2.0"));

    let reason = code.text().unwrap_or("Unknown");
    notify.body = Bytes::from(format!("SIP/2.0 {code} {reason}\r\n"));

    let result = async {
        let mut target_tp_info: tokio::sync::MutexGuard<'_, TargetTransportInfo> =
            dialog.target_tp_info.lock().await;

        let mut transaction = dialog
            .endpoint
            .send_request(notify, &mut target_tp_info)
            .await?;

        drop(target_tp_info);

        transaction.receive_final().await
    }
    .await;

    if let Err(e) = result {
        log::debug!("failed to NOTIFY transfer progress: {e}");
    }
}
