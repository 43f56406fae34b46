//! Contract towards the out-of-process RTP relay.
//!
//! The core never touches RTP itself; it hands the offered SDP to the relay
//! and receives the answer SDP plus a session handle back. Every established
//! dialog owns exactly one session handle, released before the CDR is
//! finalized.

use bytes::Bytes;
use std::fmt;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

/// Deadline for any single relay command
pub const RELAY_COMMAND_TIMEOUT: Duration = Duration::from_secs(3);

/// Opaque handle to one relay session
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionHandle(pub u64);

impl fmt::Display for SessionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "media-{}", self.0)
    }
}

/// Which leg of a bridged call an operation applies to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaSide {
    Caller,
    Callee,
}

#[derive(Debug, thiserror::Error)]
pub enum MediaError {
    #[error("media relay is unavailable")]
    Unavailable,
    #[error("media relay timed out")]
    Timeout,
    #[error("media relay rejected the request: {0}")]
    Rejected(String),
}

/// The RTP relay the core programs for every call
#[async_trait::async_trait]
pub trait MediaRelay: Send + Sync + 'static {
    /// Allocate a relay session for a call, producing the answer SDP
    async fn allocate(
        &self,
        call_id: &str,
        offer_sdp: Bytes,
    ) -> Result<(Bytes, SessionHandle), MediaError>;

    /// Renegotiate an existing session with a new offer
    async fn update(&self, session: &SessionHandle, offer_sdp: Bytes)
        -> Result<Bytes, MediaError>;

    async fn hold(&self, session: &SessionHandle, side: MediaSide) -> Result<(), MediaError>;

    async fn unhold(&self, session: &SessionHandle, side: MediaSide) -> Result<(), MediaError>;

    async fn release(&self, session: &SessionHandle);

    async fn start_recording(
        &self,
        session: &SessionHandle,
        filepath: &str,
    ) -> Result<(), MediaError>;

    async fn stop_recording(&self, session: &SessionHandle) -> Result<(), MediaError>;
}

/// Command protocol spoken over the local channel to the relay process
#[derive(Debug)]
pub enum RelayCommand {
    Allocate {
        call_id: String,
        offer_sdp: Bytes,
        reply: oneshot::Sender<Result<(Bytes, SessionHandle), MediaError>>,
    },
    Update {
        session: SessionHandle,
        offer_sdp: Bytes,
        reply: oneshot::Sender<Result<Bytes, MediaError>>,
    },
    Hold {
        session: SessionHandle,
        side: MediaSide,
        reply: oneshot::Sender<Result<(), MediaError>>,
    },
    Unhold {
        session: SessionHandle,
        side: MediaSide,
        reply: oneshot::Sender<Result<(), MediaError>>,
    },
    Release {
        session: SessionHandle,
    },
    StartRecording {
        session: SessionHandle,
        filepath: String,
        reply: oneshot::Sender<Result<(), MediaError>>,
    },
    StopRecording {
        session: SessionHandle,
        reply: oneshot::Sender<Result<(), MediaError>>,
    },
}

/// Relay client speaking [`RelayCommand`] over a local channel.
///
/// Every command is bounded by [`RELAY_COMMAND_TIMEOUT`].
pub struct ChannelMediaRelay {
    commands: mpsc::Sender<RelayCommand>,
}

impl ChannelMediaRelay {
    pub fn new(commands: mpsc::Sender<RelayCommand>) -> Self {
        Self { commands }
    }

    async fn send_command<R>(
        &self,
        command: RelayCommand,
        reply: oneshot::Receiver<Result<R, MediaError>>,
    ) -> Result<R, MediaError> {
        self.commands
            .send(command)
            .await
            .map_err(|_| MediaError::Unavailable)?;

        match tokio::time::timeout(RELAY_COMMAND_TIMEOUT, reply).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(MediaError::Unavailable),
            Err(_) => Err(MediaError::Timeout),
        }
    }
}

#[async_trait::async_trait]
impl MediaRelay for ChannelMediaRelay {
    async fn allocate(
        &self,
        call_id: &str,
        offer_sdp: Bytes,
    ) -> Result<(Bytes, SessionHandle), MediaError> {
        let (reply_tx, reply_rx) = oneshot::channel();

        self.send_command(
            RelayCommand::Allocate {
                call_id: call_id.to_owned(),
                offer_sdp,
                reply: reply_tx,
            },
            reply_rx,
        )
        .await
    }

    async fn update(
        &self,
        session: &SessionHandle,
        offer_sdp: Bytes,
    ) -> Result<Bytes, MediaError> {
        let (reply_tx, reply_rx) = oneshot::channel();

        self.send_command(
            RelayCommand::Update {
                session: session.clone(),
                offer_sdp,
                reply: reply_tx,
            },
            reply_rx,
        )
        .await
    }

    async fn hold(&self, session: &SessionHandle, side: MediaSide) -> Result<(), MediaError> {
        let (reply_tx, reply_rx) = oneshot::channel();

        self.send_command(
            RelayCommand::Hold {
                session: session.clone(),
                side,
                reply: reply_tx,
            },
            reply_rx,
        )
        .await
    }

    async fn unhold(&self, session: &SessionHandle, side: MediaSide) -> Result<(), MediaError> {
        let (reply_tx, reply_rx) = oneshot::channel();

        self.send_command(
            RelayCommand::Unhold {
                session: session.clone(),
                side,
                reply: reply_tx,
            },
            reply_rx,
        )
        .await
    }

    async fn release(&self, session: &SessionHandle) {
        let _ = self
            .commands
            .send(RelayCommand::Release {
                session: session.clone(),
            })
            .await;
    }

    async fn start_recording(
        &self,
        session: &SessionHandle,
        filepath: &str,
    ) -> Result<(), MediaError> {
        let (reply_tx, reply_rx) = oneshot::channel();

        self.send_command(
            RelayCommand::StartRecording {
                session: session.clone(),
                filepath: filepath.to_owned(),
                reply: reply_tx,
            },
            reply_rx,
        )
        .await
    }

    async fn stop_recording(&self, session: &SessionHandle) -> Result<(), MediaError> {
        let (reply_tx, reply_rx) = oneshot::channel();

        self.send_command(
            RelayCommand::StopRecording {
                session: session.clone(),
                reply: reply_tx,
            },
            reply_rx,
        )
        .await
    }
}

#[cfg(test)]
pub(crate) mod mock {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicU64, Ordering};

    /// In-memory relay answering with a fixed SDP, used by controller tests
    pub(crate) struct MockRelay {
        next_handle: AtomicU64,
        pub(crate) released: Mutex<Vec<SessionHandle>>,
        pub(crate) recordings: Mutex<Vec<(SessionHandle, String)>>,
    }

    impl MockRelay {
        pub(crate) fn new() -> Self {
            Self {
                next_handle: AtomicU64::new(1),
                released: Mutex::new(Vec::new()),
                recordings: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait::async_trait]
    impl MediaRelay for MockRelay {
        async fn allocate(
            &self,
            _call_id: &str,
            _offer_sdp: Bytes,
        ) -> Result<(Bytes, SessionHandle), MediaError> {
            let handle = SessionHandle(self.next_handle.fetch_add(1, Ordering::Relaxed));

            let answer = Bytes::from_static(
                b"v=0\r\no=- 0 0 IN IP4 198.51.100.5\r\ns=-\r\nc=IN IP4 198.51.100.5\r\nt=0 0\r\nm=audio 40000 RTP/AVP 0\r\na=rtpmap:0 PCMU/8000\r\n",
            );

            Ok((answer, handle))
        }

        async fn update(
            &self,
            _session: &SessionHandle,
            _offer_sdp: Bytes,
        ) -> Result<Bytes, MediaError> {
            Ok(Bytes::from_static(b"v=0\r\n"))
        }

        async fn hold(&self, _: &SessionHandle, _: MediaSide) -> Result<(), MediaError> {
            Ok(())
        }

        async fn unhold(&self, _: &SessionHandle, _: MediaSide) -> Result<(), MediaError> {
            Ok(())
        }

        async fn release(&self, session: &SessionHandle) {
            self.released.lock().push(session.clone());
        }

        async fn start_recording(
            &self,
            session: &SessionHandle,
            filepath: &str,
        ) -> Result<(), MediaError> {
            self.recordings
                .lock()
                .push((session.clone(), filepath.to_owned()));
            Ok(())
        }

        async fn stop_recording(&self, _: &SessionHandle) -> Result<(), MediaError> {
            Ok(())
        }
    }
}
