//! FlowPBX: a self-contained IP telephony server.
//!
//! This crate is the signaling and call control core: it terminates SIP from
//! phones and trunks, applies routing, programs an external RTP relay and
//! emits call detail records. The admin API, persistence and media storage
//! live outside and talk to the seams exported here ([`media::MediaRelay`],
//! [`push::PushAdapter`], [`cdr::CdrSink`]).

pub mod call;
pub mod cdr;
pub mod config;
pub mod media;
pub mod metrics;
pub mod push;
mod ratelimit;
pub mod registrar;
pub mod sdp;
pub mod server;
pub mod snapshot;
pub mod trunk;

pub use server::{Server, ServerError};
