//! SIP grammar for the FlowPBX signaling core.
//!
//! Provides zero-copy message parsing & printing on top of [`bytesstr::BytesStr`]
//! slices. Headers are stored unparsed and decoded into typed values on demand.

#[macro_use]
mod macros;

mod code;
pub mod header;
pub mod host;
mod method;
pub mod msg;
pub mod parse;
pub mod uri;

pub use code::{CodeKind, StatusCode};
pub use header::headers::Headers;
pub use header::Name;
pub use method::Method;
