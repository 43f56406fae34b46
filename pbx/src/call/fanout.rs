//! Bell fan-out: ringing one or many contacts for a pending call.
//!
//! Each branch is its own task driving a UAC INVITE; the first branch to
//! answer wins, all others are cancelled. Ringing state flows back and is
//! forwarded to the caller per policy: the first 180 is forwarded, later 18x
//! only when they carry the first early-media SDP.

use bytes::Bytes;
use sip_core::Endpoint;
use sip_types::header::typed::ContentType;
use sip_types::host::HostPort;
use sip_types::uri::{NameAddr, SipUri};
use sip_types::{CodeKind, StatusCode};
use sip_ua::invite::{
    EarlyResponse, InitiatorResponse, InviteAcceptor, InviteInitiator, InviteSession,
};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::{Instant, sleep_until};
use tokio_util::sync::CancellationToken;

use crate::config::RingStrategy;

/// One contact (or follow-me number) to ring
#[derive(Debug, Clone)]
pub struct RingTarget {
    pub uri: SipUri,
    /// Start offset, honored by the simultaneous strategy
    pub delay: Duration,
    /// Branch deadline
    pub timeout: Duration,
    pub label: String,
}

/// Context shared by every branch of one pending call
pub(crate) struct PendingCall {
    pub(crate) endpoint: Endpoint,
    pub(crate) domain: String,
    pub(crate) call_id: String,
    pub(crate) caller: String,
    /// Relay anchored SDP offered to every branch
    pub(crate) offer_sdp: Bytes,
    pub(crate) shutdown: CancellationToken,
}

impl PendingCall {
    pub(crate) fn new(
        endpoint: Endpoint,
        domain: String,
        call_id: String,
        caller: String,
        offer_sdp: Bytes,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            endpoint,
            domain,
            call_id,
            caller,
            offer_sdp,
            shutdown,
        }
    }

    fn local_addr(&self) -> NameAddr {
        NameAddr::uri(
            SipUri::new(HostPort::host_name(self.domain.clone())).user(self.caller.clone()),
        )
    }

    fn local_contact(&self) -> sip_types::header::typed::Contact {
        sip_types::header::typed::Contact::new(NameAddr::uri(SipUri::new(
            HostPort::host_name(self.domain.clone()),
        )))
    }
}

pub(crate) enum FanoutOutcome {
    Answered {
        far_session: InviteSession,
        /// The winning callee's answer SDP, handed to the relay
        callee_sdp: Bytes,
    },
    CallerCancelled,
    AllBusy,
    NoAnswer,
    Failed(StatusCode),
}

/// Ringing progress flowing from branches to the fan-out
struct RingingEvent {
    early_sdp: Option<Bytes>,
}

enum BranchTerminal {
    Answered { session: InviteSession, sdp: Bytes },
    Busy,
    Failed(StatusCode),
    Timeout,
    Cancelled,
}

/// Run the fan-out to completion
pub(crate) async fn ring(
    pending: PendingCall,
    acceptor: &mut InviteAcceptor,
    targets: Vec<RingTarget>,
    strategy: RingStrategy,
) -> FanoutOutcome {
    let (ringing_tx, mut ringing_rx) = mpsc::channel::<RingingEvent>(8);

    let cancel = pending.shutdown.child_token();

    let mut forwarder = RingingForwarder::new();

    match strategy {
        RingStrategy::Sequential => {
            let mut attempted = 0usize;
            let mut busy = 0usize;

            for target in targets {
                let branch_cancel = cancel.child_token();

                let mut branch = Box::pin(run_branch(
                    &pending,
                    target,
                    ringing_tx.clone(),
                    branch_cancel.clone(),
                ));

                let terminal = loop {
                    tokio::select! {
                        terminal = &mut branch => break terminal,
                        _ = acceptor.cancelled() => {
                            branch_cancel.cancel();
                            let _ = branch.await;
                            return FanoutOutcome::CallerCancelled;
                        }
                        Some(event) = ringing_rx.recv() => {
                            forwarder.forward(acceptor, event).await;
                        }
                    }
                };

                attempted += 1;

                match terminal {
                    BranchTerminal::Answered { session, sdp } => {
                        return FanoutOutcome::Answered {
                            far_session: session,
                            callee_sdp: sdp,
                        };
                    }
                    // busy or failed branches fall through to the next entry
                    BranchTerminal::Busy => {
                        busy += 1;
                        continue;
                    }
                    BranchTerminal::Failed(_) | BranchTerminal::Timeout => continue,
                    BranchTerminal::Cancelled => return FanoutOutcome::CallerCancelled,
                }
            }

            if attempted > 0 && busy == attempted {
                FanoutOutcome::AllBusy
            } else {
                FanoutOutcome::NoAnswer
            }
        }
        RingStrategy::Simultaneous => {
            let mut branches: JoinSet<BranchTerminal> = JoinSet::new();

            for target in targets {
                let ringing_tx = ringing_tx.clone();
                let branch_cancel = cancel.child_token();
                let delay = target.delay;

                let ctx = PendingCall {
                    endpoint: pending.endpoint.clone(),
                    domain: pending.domain.clone(),
                    call_id: pending.call_id.clone(),
                    caller: pending.caller.clone(),
                    offer_sdp: pending.offer_sdp.clone(),
                    shutdown: pending.shutdown.clone(),
                };

                branches.spawn(async move {
                    if !delay.is_zero() {
                        tokio::select! {
                            _ = tokio::time::sleep(delay) => {}
                            _ = branch_cancel.cancelled() => return BranchTerminal::Cancelled,
                        }
                    }

                    run_branch(&ctx, target, ringing_tx, branch_cancel).await
                });
            }

            let mut saw_busy = false;
            let mut saw_timeout = false;
            let mut last_failure = None;

            loop {
                tokio::select! {
                    joined = branches.join_next() => {
                        let Some(joined) = joined else {
                            break;
                        };

                        match joined {
                            Ok(BranchTerminal::Answered { session, sdp }) => {
                                // first 2xx wins, the rest get CANCEL
                                cancel.cancel();

                                while branches.join_next().await.is_some() {}

                                return FanoutOutcome::Answered {
                                    far_session: session,
                                    callee_sdp: sdp,
                                };
                            }
                            Ok(BranchTerminal::Busy) => saw_busy = true,
                            Ok(BranchTerminal::Timeout) => saw_timeout = true,
                            Ok(BranchTerminal::Failed(code)) => last_failure = Some(code),
                            Ok(BranchTerminal::Cancelled) => {}
                            Err(e) => {
                                log::error!("fan-out branch panicked: {e}");
                            }
                        }
                    }
                    _ = acceptor.cancelled() => {
                        cancel.cancel();

                        while branches.join_next().await.is_some() {}

                        return FanoutOutcome::CallerCancelled;
                    }
                    Some(event) = ringing_rx.recv() => {
                        forwarder.forward(acceptor, event).await;
                    }
                }
            }

            if saw_timeout {
                FanoutOutcome::NoAnswer
            } else if saw_busy && last_failure.is_none() {
                FanoutOutcome::AllBusy
            } else if let Some(code) = last_failure {
                if saw_busy {
                    FanoutOutcome::AllBusy
                } else {
                    FanoutOutcome::Failed(code)
                }
            } else {
                FanoutOutcome::NoAnswer
            }
        }
    }
}

/// Per-call 18x forwarding policy state
struct RingingForwarder {
    forwarded_180: bool,
    forwarded_early_media: bool,
}

impl RingingForwarder {
    fn new() -> Self {
        Self {
            forwarded_180: false,
            forwarded_early_media: false,
        }
    }

    async fn forward(&mut self, acceptor: &mut InviteAcceptor, event: RingingEvent) {
        let has_early_media = event.early_sdp.is_some();

        let should_forward = if !self.forwarded_180 {
            true
        } else {
            // later 18x only when they bring the first early media body
            has_early_media && !self.forwarded_early_media
        };

        if !should_forward {
            return;
        }

        let code = if has_early_media {
            StatusCode::SESSION_PROGRESS
        } else {
            StatusCode::RINGING
        };

        let response = match acceptor.create_response(code, None).await {
            Ok(mut response) => {
                if let Some(sdp) = event.early_sdp {
                    response
                        .msg
                        .headers
                        .insert_typed(&ContentType::new("application/sdp"));
                    response.msg.body = sdp;
                    self.forwarded_early_media = true;
                }
                response
            }
            Err(_) => return,
        };

        if acceptor.respond_provisional(response).await.is_ok() {
            self.forwarded_180 = true;
        }
    }
}

/// Drive one UAC branch to a terminal state
async fn run_branch(
    pending: &PendingCall,
    target: RingTarget,
    ringing_tx: mpsc::Sender<RingingEvent>,
    cancel: CancellationToken,
) -> BranchTerminal {
    log::debug!(
        "call {}: ringing {} ({})",
        pending.call_id,
        target.uri,
        target.label
    );

    let mut initiator = InviteInitiator::new(
        pending.endpoint.clone(),
        pending.local_addr(),
        pending.local_contact(),
        target.uri.clone(),
    );

    let mut invite = initiator.create_invite();

    invite
        .headers
        .insert_typed(&ContentType::new("application/sdp"));
    invite.body = pending.offer_sdp.clone();

    if let Err(e) = initiator.send_invite(invite).await {
        log::warn!("branch {} failed to send INVITE: {e}", target.label);
        return BranchTerminal::Failed(StatusCode::SERVICE_UNAVAILABLE);
    }

    let deadline = Instant::now() + target.timeout;

    // responses forked into early dialogs come back through this channel
    let (early_tx, mut early_rx) = mpsc::channel::<EarlyResponse>(4);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                let _ = initiator.cancel().await;
                return BranchTerminal::Cancelled;
            }
            _ = sleep_until(deadline) => {
                let _ = initiator.cancel().await;
                return BranchTerminal::Timeout;
            }
            Some(early_response) = early_rx.recv() => {
                match early_response {
                    EarlyResponse::Provisional(response) => {
                        emit_ringing(&ringing_tx, &response.line.code, &response.body).await;
                    }
                    EarlyResponse::Success(session, response) => {
                        return answer_branch(session, response.base_headers.cseq.cseq, response.body).await;
                    }
                    EarlyResponse::Terminated => {}
                }
            }
            received = initiator.receive() => {
                match received {
                    Ok(InitiatorResponse::Provisional(response)) => {
                        if response.line.code != StatusCode::TRYING {
                            emit_ringing(&ringing_tx, &response.line.code, &response.body).await;
                        }
                    }
                    Ok(InitiatorResponse::Early(mut early, response)) => {
                        emit_ringing(&ringing_tx, &response.line.code, &response.body).await;

                        let early_tx = early_tx.clone();

                        tokio::spawn(async move {
                            loop {
                                match early.receive().await {
                                    Ok(EarlyResponse::Terminated) => {
                                        let _ = early_tx.send(EarlyResponse::Terminated).await;
                                        break;
                                    }
                                    Ok(other) => {
                                        let done = matches!(other, EarlyResponse::Success(..));

                                        if early_tx.send(other).await.is_err() || done {
                                            break;
                                        }
                                    }
                                    Err(_) => break,
                                }
                            }
                        });
                    }
                    Ok(InitiatorResponse::EarlyEvent) => {}
                    Ok(InitiatorResponse::Session(session, response)) => {
                        return answer_branch(session, response.base_headers.cseq.cseq, response.body).await;
                    }
                    Ok(InitiatorResponse::Failure(response)) => {
                        return match response.line.code {
                            StatusCode::BUSY_HERE | StatusCode::BUSY_EVERYWHERE => {
                                BranchTerminal::Busy
                            }
                            StatusCode::REQUEST_TERMINATED => BranchTerminal::Cancelled,
                            code => BranchTerminal::Failed(code),
                        };
                    }
                    Ok(InitiatorResponse::Finished) => {
                        return BranchTerminal::Failed(StatusCode::REQUEST_TIMEOUT);
                    }
                    Err(sip_core::Error::RequestTimedOut) => {
                        // timer B fired without any response
                        return BranchTerminal::Failed(StatusCode::REQUEST_TIMEOUT);
                    }
                    Err(e) => {
                        // transport errors surface as a synthetic 503
                        log::debug!("branch {} error: {e}", target.label);
                        return BranchTerminal::Failed(StatusCode::SERVICE_UNAVAILABLE);
                    }
                }
            }
        }
    }
}

/// Complete the winning branch: ACK its 2xx and hand the session over
async fn answer_branch(session: InviteSession, cseq: u32, sdp: Bytes) -> BranchTerminal {
    if let Err(e) = session.acknowledge(cseq).await {
        log::warn!("failed to ACK answered branch: {e}");
        return BranchTerminal::Failed(StatusCode::SERVICE_UNAVAILABLE);
    }

    BranchTerminal::Answered { session, sdp }
}

async fn emit_ringing(
    ringing_tx: &mpsc::Sender<RingingEvent>,
    code: &StatusCode,
    body: &Bytes,
) {
    if code.kind() != CodeKind::Provisional {
        return;
    }

    let event = RingingEvent {
        early_sdp: (!body.is_empty()).then(|| body.clone()),
    };

    let _ = ringing_tx.send(event).await;
}
