//! Bridging two established legs of a B2BUA call.
//!
//! The bridge task owns both [`InviteSession`]s and the relay session. Either
//! side's BYE unwinds the other leg, releases the media session and finalizes
//! the CDR. Re-INVITEs drive hold/unhold and renegotiation through the relay;
//! REFER triggers a blind transfer.

use super::transfer;
use super::CallController;
use crate::cdr::{CdrBuilder, Disposition};
use crate::media::{MediaSide, SessionHandle};
use crate::sdp::SdpView;
use sip_core::Endpoint;
use sip_types::header::typed::ContentType;
use sip_types::StatusCode;
use sip_ua::invite::session::{
    ByeReceived, InfoReceived, ReInviteReceived, UpdateReceived,
};
use sip_ua::invite::{InviteSession, InviteSessionEvent};
use std::sync::Arc;

/// Which leg an event came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Leg {
    Caller,
    Callee,
}

impl Leg {
    fn media_side(self) -> MediaSide {
        match self {
            Leg::Caller => MediaSide::Caller,
            Leg::Callee => MediaSide::Callee,
        }
    }

}

/// Run both legs until either side hangs up
pub(crate) async fn run_bridge(
    controller: Arc<CallController>,
    endpoint: Endpoint,
    mut caller: InviteSession,
    mut callee: InviteSession,
    media_session: SessionHandle,
    relay_sdp: bytes::Bytes,
    mut cdr: CdrBuilder,
) {
    let mut hold_state = HoldState::default();

    let (disposition, cause) = loop {
        // handlers run outside the select so the idle leg is borrowable
        let wake = tokio::select! {
            event = caller.run() => Some((Leg::Caller, event)),
            event = callee.run() => Some((Leg::Callee, event)),
            _ = controller.shutdown.cancelled() => None,
        };

        let Some((leg, event)) = wake else {
            // process shutdown: both legs get BYE
            let _ = caller.terminate().await;
            let _ = callee.terminate().await;
            break (Disposition::Answered, "shutdown".to_owned());
        };

        let event = match event {
            Ok(event) => event,
            Err(e) => {
                // transport error mid-dialog tears the call down
                log::warn!("bridge leg {leg:?} failed: {e}");

                let other = match leg {
                    Leg::Caller => &mut callee,
                    Leg::Callee => &mut caller,
                };
                let _ = other.terminate().await;

                break (Disposition::Failed, "transport_error".to_owned());
            }
        };

        match event {
            InviteSessionEvent::Bye(bye) => {
                handle_bye(leg, bye, &mut caller, &mut callee).await;
                break (Disposition::Answered, "normal_clearing".to_owned());
            }
            InviteSessionEvent::Terminated => {
                let other = match leg {
                    Leg::Caller => &mut callee,
                    Leg::Callee => &mut caller,
                };
                let _ = other.terminate().await;
                break (Disposition::Answered, "normal_clearing".to_owned());
            }
            InviteSessionEvent::ReInvite(reinvite) => {
                let session = match leg {
                    Leg::Caller => &mut caller,
                    Leg::Callee => &mut callee,
                };

                if let Err(e) = handle_reinvite(
                    &controller,
                    session,
                    leg,
                    reinvite,
                    &media_session,
                    &mut hold_state,
                )
                .await
                {
                    log::warn!("re-INVITE handling failed: {e}");
                }
            }
            InviteSessionEvent::Update(update) => {
                let session = match leg {
                    Leg::Caller => &caller,
                    Leg::Callee => &callee,
                };

                if let Err(e) = handle_update(&controller, session, update, &media_session).await
                {
                    log::warn!("UPDATE handling failed: {e}");
                }
            }
            InviteSessionEvent::Refer(refer) => {
                cdr.push_flow_node("transfer".to_owned());

                let outcome = transfer::blind_transfer(
                    &controller,
                    &endpoint,
                    leg,
                    refer,
                    match leg {
                        Leg::Caller => &mut caller,
                        Leg::Callee => &mut callee,
                    },
                    &media_session,
                    relay_sdp.clone(),
                )
                .await;

                match outcome {
                    Ok(Some(replacement)) => {
                        // the transferor's leg is replaced by the new session
                        match leg {
                            Leg::Caller => caller = replacement,
                            Leg::Callee => callee = replacement,
                        }
                    }
                    Ok(None) => {}
                    Err(e) => log::warn!("blind transfer failed: {e}"),
                }
            }
            InviteSessionEvent::Info(info) => {
                handle_info(leg, info, &caller, &callee).await;
            }
            InviteSessionEvent::Message(message) => {
                // in-dialog MESSAGE is acknowledged and dropped
                let session = match leg {
                    Leg::Caller => &caller,
                    Leg::Callee => &callee,
                };

                if let Ok(response) = session
                    .dialog
                    .create_response(&message.request, StatusCode::OK, None)
                {
                    let _ = message.transaction.respond(response).await;
                }
            }
            InviteSessionEvent::Notify(_) => {
                // already answered by the session
            }
            InviteSessionEvent::RefreshNeeded => {
                let session = match leg {
                    Leg::Caller => &mut caller,
                    Leg::Callee => &mut callee,
                };

                // refresh with the relay's current description
                if let Err(e) = session.refresh(bytes::Bytes::new()).await {
                    log::debug!("session refresh failed: {e}");
                }
            }
        }
    };

    controller.relay.release(&media_session).await;

    controller.cdr.emit(cdr.finalize(disposition, cause));
}

#[derive(Default)]
struct HoldState {
    caller_holds: bool,
    callee_holds: bool,
}

async fn handle_bye(
    leg: Leg,
    bye: ByeReceived,
    caller: &mut InviteSession,
    callee: &mut InviteSession,
) {
    let (hung_up, other) = match leg {
        Leg::Caller => (&mut *caller, &mut *callee),
        Leg::Callee => (&mut *callee, &mut *caller),
    };

    if let Err(e) = hung_up.handle_bye(bye).await {
        log::debug!("failed to answer BYE: {e}");
    }

    if let Err(e) = other.terminate().await {
        log::debug!("failed to BYE the far leg: {e}");
    }
}

/// Hold, unhold and renegotiation through the relay
async fn handle_reinvite(
    controller: &Arc<CallController>,
    session: &mut InviteSession,
    leg: Leg,
    reinvite: ReInviteReceived,
    media_session: &SessionHandle,
    hold_state: &mut HoldState,
) -> sip_core::Result<()> {
    let offer = reinvite.invite.body.clone();
    let view = SdpView::parse(&offer);

    let holds = view.as_ref().map(SdpView::is_hold).unwrap_or(false);

    let held_flag = match leg {
        Leg::Caller => &mut hold_state.caller_holds,
        Leg::Callee => &mut hold_state.callee_holds,
    };

    if holds != *held_flag {
        let result = if holds {
            controller.relay.hold(media_session, leg.media_side()).await
        } else {
            controller
                .relay
                .unhold(media_session, leg.media_side())
                .await
        };

        if let Err(e) = result {
            log::warn!("relay hold/unhold failed: {e}");
        } else {
            *held_flag = holds;
        }
    }

    // renegotiate the relay with the new offer and answer with its SDP
    let answer_sdp = if offer.is_empty() {
        bytes::Bytes::new()
    } else {
        match controller.relay.update(media_session, offer).await {
            Ok(answer) => answer,
            Err(e) => {
                log::warn!("relay renegotiation failed: {e}");

                let response = session.dialog.create_response(
                    &reinvite.invite,
                    StatusCode::NOT_ACCEPTABLE_HERE,
                    None,
                )?;

                return reinvite
                    .transaction
                    .respond_failure(response)
                    .await
                    .map(|_| ());
            }
        }
    };

    let mut response =
        session
            .dialog
            .create_response(&reinvite.invite, StatusCode::OK, None)?;

    if !answer_sdp.is_empty() {
        response
            .msg
            .headers
            .insert_typed(&ContentType::new("application/sdp"));
        response.msg.body = answer_sdp;
    }

    session.respond_to_reinvite(reinvite, response).await?;

    Ok(())
}

async fn handle_update(
    controller: &Arc<CallController>,
    session: &InviteSession,
    update: UpdateReceived,
    media_session: &SessionHandle,
) -> sip_core::Result<()> {
    let offer = update.update.body.clone();

    let answer_sdp = if offer.is_empty() {
        bytes::Bytes::new()
    } else {
        controller
            .relay
            .update(media_session, offer)
            .await
            .unwrap_or_default()
    };

    let mut response =
        session
            .dialog
            .create_response(&update.update, StatusCode::OK, None)?;

    if !answer_sdp.is_empty() {
        response
            .msg
            .headers
            .insert_typed(&ContentType::new("application/sdp"));
        response.msg.body = answer_sdp;
    }

    update.transaction.respond(response).await
}

/// DTMF via INFO is acknowledged and surfaced in the log
async fn handle_info(leg: Leg, info: InfoReceived, caller: &InviteSession, callee: &InviteSession) {
    let session = match leg {
        Leg::Caller => caller,
        Leg::Callee => callee,
    };

    if let Some(digit) = parse_dtmf(&info.request.body) {
        log::debug!("DTMF digit {digit} from {leg:?}");
    }

    if let Ok(response) = session
        .dialog
        .create_response(&info.request, StatusCode::OK, None)
    {
        let _ = info.transaction.respond(response).await;
    }
}

/// Extract the digit of an `application/dtmf-relay` body
fn parse_dtmf(body: &[u8]) -> Option<char> {
    let text = std::str::from_utf8(body).ok()?;

    text.lines().find_map(|line| {
        let (key, value) = line.split_once('=')?;

        if key.trim().eq_ignore_ascii_case("signal") {
            value.trim().chars().next()
        } else {
            None
        }
    })
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn dtmf_body() {
        assert_eq!(parse_dtmf(b"Signal=5\r\nDuration=160\r\n"), Some('5'));
        assert_eq!(parse_dtmf(b"Duration=160\r\n"), None);
        assert_eq!(parse_dtmf(b"\xff\xfe"), None);
    }
}
