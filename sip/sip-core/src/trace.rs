//! Structured, rate-bounded tracing of every SIP frame on the wire.
//!
//! Frames are pushed onto a bounded channel and logged from a separate task so
//! the transport path never blocks on the subscriber. When the channel is full
//! the frame is dropped and accounted.

use bytes::Bytes;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;

const TRACE_QUEUE_DEPTH: usize = 512;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraceVerbosity {
    Off,
    Brief,
    Full,
}

impl TraceVerbosity {
    pub fn from_str_or_off(s: &str) -> Self {
        match s {
            s if s.eq_ignore_ascii_case("brief") => Self::Brief,
            s if s.eq_ignore_ascii_case("full") => Self::Full,
            _ => Self::Off,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub enum TraceDirection {
    Inbound,
    Outbound,
}

impl fmt::Display for TraceDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TraceDirection::Inbound => f.write_str("in"),
            TraceDirection::Outbound => f.write_str("out"),
        }
    }
}

struct TraceFrame {
    direction: TraceDirection,
    peer: SocketAddr,
    transport: &'static str,
    buffer: Bytes,
}

/// Handle used by transports to offer frames to the trace task
#[derive(Clone)]
pub struct MessageTracer {
    verbosity: TraceVerbosity,
    sender: Option<mpsc::Sender<TraceFrame>>,
    dropped: Arc<AtomicU64>,
}

impl MessageTracer {
    pub fn new(verbosity: TraceVerbosity) -> Self {
        let (sender, receiver) = mpsc::channel(TRACE_QUEUE_DEPTH);

        let sender = match verbosity {
            TraceVerbosity::Off => None,
            _ => {
                tokio::spawn(trace_task(receiver, verbosity));
                Some(sender)
            }
        };

        Self {
            verbosity,
            sender,
            dropped: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn disabled() -> Self {
        Self {
            verbosity: TraceVerbosity::Off,
            sender: None,
            dropped: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Number of frames dropped because the trace queue was full
    pub fn dropped_frames(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn trace(
        &self,
        direction: TraceDirection,
        peer: SocketAddr,
        transport: &'static str,
        buffer: &Bytes,
    ) {
        let Some(sender) = &self.sender else {
            return;
        };

        let frame = TraceFrame {
            direction,
            peer,
            transport,
            buffer: buffer.clone(),
        };

        if sender.try_send(frame).is_err() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn verbosity(&self) -> TraceVerbosity {
        self.verbosity
    }
}

async fn trace_task(mut receiver: mpsc::Receiver<TraceFrame>, verbosity: TraceVerbosity) {
    while let Some(frame) = receiver.recv().await {
        let text = String::from_utf8_lossy(&frame.buffer);

        match verbosity {
            TraceVerbosity::Off => {}
            TraceVerbosity::Brief => {
                let first_line = text.lines().next().unwrap_or_default();

                // structured identifiers when the frame parses, raw first
                // line either way
                let parsed = sip_types::msg::ParsedMessage::parse(frame.buffer.clone()).ok();

                let call_id = parsed
                    .as_ref()
                    .and_then(|msg| msg.headers.get(&sip_types::Name::CALL_ID).cloned());
                let cseq = parsed
                    .as_ref()
                    .and_then(|msg| msg.headers.get(&sip_types::Name::CSEQ).cloned());

                tracing::info!(
                    direction = %frame.direction,
                    peer = %frame.peer,
                    transport = frame.transport,
                    call_id = call_id.as_deref(),
                    cseq = cseq.as_deref(),
                    "{first_line}"
                );
            }
            TraceVerbosity::Full => {
                tracing::info!(
                    direction = %frame.direction,
                    peer = %frame.peer,
                    transport = frame.transport,
                    "\n{}",
                    redact(&text)
                );
            }
        }
    }
}

/// Mask credentials before a frame reaches the log subscriber.
///
/// Covers digest `response`/`password` values in Authorization and
/// Proxy-Authorization headers and the user part of Authentication-Info.
fn redact(text: &str) -> String {
    let mut out = String::with_capacity(text.len());

    for line in text.split_inclusive('\n') {
        let lower = line.to_ascii_lowercase();

        let sensitive = lower.starts_with("authorization:")
            || lower.starts_with("proxy-authorization:")
            || lower.starts_with("authentication-info:");

        if sensitive {
            out.push_str(&mask_params(line, &["response", "password", "username", "cnonce"]));
        } else {
            out.push_str(line);
        }
    }

    out
}

fn mask_params(line: &str, params: &[&str]) -> String {
    let mut out = String::with_capacity(line.len());
    let mut rest = line;

    'outer: while !rest.is_empty() {
        for param in params {
            if let Some(stripped) = strip_param_prefix(rest, param) {
                out.push_str(param);
                out.push('=');

                let (quoted, stripped) = match stripped.strip_prefix('"') {
                    Some(stripped) => (true, stripped),
                    None => (false, stripped),
                };

                let value_end = stripped
                    .find(|c: char| if quoted { c == '"' } else { matches!(c, ',' | ' ' | '\r' | '\n') })
                    .unwrap_or(stripped.len());

                if quoted {
                    out.push_str("\"***\"");
                    rest = stripped[value_end..].strip_prefix('"').unwrap_or(&stripped[value_end..]);
                } else {
                    out.push_str("***");
                    rest = &stripped[value_end..];
                }

                continue 'outer;
            }
        }

        let mut chars = rest.chars();
        if let Some(c) = chars.next() {
            out.push(c);
            rest = chars.as_str();
        }
    }

    out
}

/// Case-insensitively strip `{param}=` from the start of `rest`
fn strip_param_prefix<'s>(rest: &'s str, param: &str) -> Option<&'s str> {
    if rest.len() <= param.len() {
        return None;
    }

    let (head, tail) = rest.split_at(param.len());

    if head.eq_ignore_ascii_case(param) {
        tail.strip_prefix('=')
    } else {
        None
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn redacts_digest_response() {
        let frame = "REGISTER sip:pbx SIP/2.0\r\n\
             Authorization: Digest username=\"100\", response=\"6629fae49393a05397450978507c4ef1\"\r\n\
             \r\n";

        let redacted = redact(frame);

        assert!(!redacted.contains("6629fae49393a05397450978507c4ef1"));
        assert!(redacted.contains("response=\"***\""));
        assert!(redacted.contains("username=\"***\""));
        assert!(redacted.contains("REGISTER sip:pbx"));
    }

    #[test]
    fn leaves_other_lines_untouched() {
        let frame = "INVITE sip:100@pbx SIP/2.0\r\nCall-ID: abc\r\n\r\n";

        assert_eq!(redact(frame), frame);
    }
}
