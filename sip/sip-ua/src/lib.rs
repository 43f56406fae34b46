//! User agent building blocks for FlowPBX: dialog management, INVITE session
//! state machines and the outbound REGISTER protocol.

pub mod dialog;
pub mod invite;
pub mod register;
mod util;

pub use util::{random_call_id, random_sequence_number, random_tag};
