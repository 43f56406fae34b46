//! Framing and plumbing shared by the stream based transports (TCP, TLS).
//!
//! The decoder is a two-state machine: it collects and parses the message
//! head exactly once, learns the mandatory Content-Length from the parsed
//! headers, then waits for that many body bytes before emitting the message.

use crate::transport::{Direction, ReceivedMessage, TpHandle, Transport};
use crate::Endpoint;
use bytes::{Buf, Bytes, BytesMut};
use sip_types::header::typed::ContentLength;
use sip_types::msg::{HeaderLine, MessageLine, PullParser};
use sip_types::parse::Parse;
use sip_types::Headers;
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;
use tokio_stream::StreamExt;
use tokio_util::codec::{Decoder, FramedRead};

/// Hard cap on the per-connection read buffer; exceeding it closes the
/// connection
const READ_BUFFER_CAP: usize = 1024 * 1024;

/// Maximum body size of a single framed message
const MAX_BODY: usize = u16::MAX as usize;

#[derive(Debug, thiserror::Error)]
pub(crate) enum DecodeError {
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("peer overran the read buffer")]
    BufferOverrun,
    #[error("framed message is malformed")]
    Malformed,
}

#[allow(clippy::large_enum_variant)]
pub(crate) enum Item {
    Message(DecodedMessage),
    Ping,
    Pong,
}

pub(crate) struct DecodedMessage {
    pub(crate) line: MessageLine,
    pub(crate) headers: Headers,
    pub(crate) body: Bytes,

    /// Head and body stitched together, for tracing
    pub(crate) buffer: Bytes,
}

enum DecodeState {
    /// Collecting head bytes; `progress` remembers how far scanning got
    Head { progress: usize },
    /// Head parsed, waiting for the body to be complete
    Body {
        line: MessageLine,
        headers: Headers,
        head: Bytes,
        content_len: usize,
    },
}

pub(crate) struct StreamingDecoder {
    state: DecodeState,
}

impl Default for StreamingDecoder {
    fn default() -> Self {
        Self {
            state: DecodeState::Head { progress: 0 },
        }
    }
}

impl Decoder for StreamingDecoder {
    type Item = Item;
    type Error = DecodeError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Item>, DecodeError> {
        loop {
            match &mut self.state {
                DecodeState::Head { progress } => {
                    if *progress == 0 {
                        if let Some(token) = take_keepalive(src) {
                            return Ok(Some(token));
                        }
                    }

                    if src.len() > READ_BUFFER_CAP {
                        return Err(DecodeError::BufferOverrun);
                    }

                    let Some(head_len) = seek_head_end(src, progress) else {
                        return Ok(None);
                    };

                    let head = src.split_to(head_len).freeze();
                    let (line, headers) = parse_head(&head)?;
                    let content_len = framed_body_length(&headers)?;

                    self.state = DecodeState::Body {
                        line,
                        headers,
                        head,
                        content_len,
                    };
                }
                DecodeState::Body { content_len, .. } => {
                    let content_len = *content_len;

                    if src.len() < content_len {
                        src.reserve(content_len - src.len());
                        return Ok(None);
                    }

                    let body = src.split_to(content_len).freeze();

                    let DecodeState::Body {
                        line, headers, head, ..
                    } = std::mem::replace(&mut self.state, DecodeState::Head { progress: 0 })
                    else {
                        unreachable!("state checked by the match arm");
                    };

                    let buffer = if body.is_empty() {
                        head
                    } else {
                        let mut whole = BytesMut::with_capacity(head.len() + body.len());
                        whole.extend_from_slice(&head);
                        whole.extend_from_slice(&body);
                        whole.freeze()
                    };

                    return Ok(Some(Item::Message(DecodedMessage {
                        line,
                        headers,
                        body,
                        buffer,
                    })));
                }
            }
        }
    }
}

/// Consume a keep-alive token sitting at the start of the buffer
fn take_keepalive(src: &mut BytesMut) -> Option<Item> {
    if src.starts_with(b"\r\n\r\n") {
        src.advance(4);
        return Some(Item::Ping);
    }

    if src.starts_with(b"\r\n") {
        src.advance(2);
        return Some(Item::Pong);
    }

    None
}

/// Find the end of the head section (the empty line included).
///
/// `progress` is advanced so the next call resumes scanning where this one
/// left off instead of rereading the whole buffer.
fn seek_head_end(src: &[u8], progress: &mut usize) -> Option<usize> {
    let mut parser = PullParser::new(src, *progress);

    for line in &mut parser {
        if line.is_err() {
            // head still incomplete
            *progress = parser.progress();
            return None;
        }
    }

    match parser.head_end() {
        0 => {
            *progress = parser.progress();
            None
        }
        end => Some(end),
    }
}

/// Parse a complete head buffer into its message line and header map
fn parse_head(head: &Bytes) -> Result<(MessageLine, Headers), DecodeError> {
    use nom::Finish;

    let mut lines = PullParser::new(head, 0);

    let first = lines
        .next()
        .and_then(|item| item.ok())
        .ok_or(DecodeError::Malformed)?;
    let first = std::str::from_utf8(first).map_err(|_| DecodeError::Malformed)?;

    let (_, line) = MessageLine::parse(head)(first)
        .finish()
        .map_err(|_| DecodeError::Malformed)?;

    let mut headers = Headers::new();

    for item in &mut lines {
        let raw = item.map_err(|_| DecodeError::Malformed)?;
        let raw = std::str::from_utf8(raw).map_err(|_| DecodeError::Malformed)?;

        let header = HeaderLine::parse(head, raw).map_err(|_| DecodeError::Malformed)?;
        headers.insert(header.name, header.value);
    }

    Ok((line, headers))
}

/// Content-Length is mandatory on stream transports and bounds the body
fn framed_body_length(headers: &Headers) -> Result<usize, DecodeError> {
    let ContentLength(len) = headers
        .try_typed::<ContentLength>()
        .map_err(|_| DecodeError::Malformed)?
        .ok_or(DecodeError::Malformed)?;

    if len > MAX_BODY {
        return Err(DecodeError::BufferOverrun);
    }

    Ok(len)
}

type WriteHalf = Pin<Box<dyn AsyncWrite + Send>>;
type ReadHalf = Pin<Box<dyn AsyncRead + Send>>;

/// One established stream connection
pub struct StreamingTransport {
    name: &'static str,
    secure: bool,
    bound: SocketAddr,
    sent_by: SocketAddr,
    direction: Direction,
    write: Mutex<WriteHalf>,
}

impl StreamingTransport {
    pub(crate) fn new(
        name: &'static str,
        secure: bool,
        bound: SocketAddr,
        sent_by: SocketAddr,
        direction: Direction,
        write: WriteHalf,
    ) -> Self {
        Self {
            name,
            secure,
            bound,
            sent_by,
            direction,
            write: Mutex::new(write),
        }
    }
}

impl fmt::Debug for StreamingTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamingTransport")
            .field("name", &self.name)
            .field("bound", &self.bound)
            .field("direction", &self.direction)
            .finish_non_exhaustive()
    }
}

impl fmt::Display for StreamingTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.remote_addr() {
            Some(remote) => write!(f, "{}:bound={},remote={}", self.name, self.bound, remote),
            None => write!(f, "{}:bound={}", self.name, self.bound),
        }
    }
}

#[async_trait::async_trait]
impl Transport for StreamingTransport {
    fn name(&self) -> &'static str {
        self.name
    }

    fn secure(&self) -> bool {
        self.secure
    }

    fn reliable(&self) -> bool {
        true
    }

    fn bound(&self) -> SocketAddr {
        self.bound
    }

    fn sent_by(&self) -> SocketAddr {
        self.sent_by
    }

    fn direction(&self) -> Direction {
        self.direction
    }

    async fn send(&self, message: &[u8], _target: SocketAddr) -> io::Result<()> {
        let mut write = self.write.lock().await;

        write.write_all(message).await?;
        write.flush().await
    }
}

/// Register an established stream in the connection cache and spawn its
/// reader task
pub(crate) fn spawn_stream_connection(
    endpoint: Endpoint,
    handle: TpHandle,
    read: ReadHalf,
    remote: SocketAddr,
) {
    let cache = endpoint.transports().connections.clone();

    let reader = tokio::spawn(reader_task(endpoint, handle.clone(), read, remote));

    cache.insert(remote, handle, reader.abort_handle());
}

async fn reader_task(endpoint: Endpoint, handle: TpHandle, read: ReadHalf, remote: SocketAddr) {
    let mut framed = FramedRead::new(read, StreamingDecoder::default());

    loop {
        match framed.next().await {
            Some(Ok(Item::Message(message))) => {
                endpoint.receive(ReceivedMessage::new(
                    remote,
                    message.buffer,
                    handle.clone(),
                    message.line,
                    message.headers,
                    message.body,
                ));
            }
            Some(Ok(Item::Ping)) => {
                if let Err(e) = handle.send(b"\r\n", remote).await {
                    log::debug!("failed to answer keep-alive on {handle}: {e}");
                    break;
                }
            }
            Some(Ok(Item::Pong)) => {}
            Some(Err(e)) => {
                log::warn!("closing {handle}: {e}");
                break;
            }
            None => {
                log::debug!("{handle} closed by peer");
                break;
            }
        }
    }

    endpoint
        .transports()
        .connections
        .remove(handle.name(), remote);
}

#[cfg(test)]
mod test {
    use super::*;

    fn decode_all(decoder: &mut StreamingDecoder, src: &mut BytesMut) -> Vec<Item> {
        let mut items = Vec::new();

        while let Some(item) = decoder.decode(src).expect("valid input") {
            items.push(item);
        }

        items
    }

    #[test]
    fn frames_a_message_split_across_reads() {
        let mut decoder = StreamingDecoder::default();
        let mut src = BytesMut::new();

        src.extend_from_slice(b"OPTIONS sip:pbx.test SIP/2.0\r\nVia: SIP/2.0/TCP 10.0.0.1;br");

        assert!(decoder.decode(&mut src).expect("incomplete is fine").is_none());

        src.extend_from_slice(b"anch=z9hG4bKf\r\nContent-Length: 5\r\n\r\nv=");

        assert!(decoder.decode(&mut src).expect("body missing").is_none());

        src.extend_from_slice(b"0\r\nBYE");

        let items = decode_all(&mut decoder, &mut src);

        let [Item::Message(message)] = &items[..] else {
            panic!("expected exactly one message");
        };

        assert!(message.line.is_request());
        assert_eq!(&message.body[..], b"v=0\r\n");
        assert_eq!(&src[..], b"BYE");
    }

    #[test]
    fn keep_alives_between_messages() {
        let mut decoder = StreamingDecoder::default();
        let mut src = BytesMut::from(&b"\r\n\r\n\r\n"[..]);

        let items = decode_all(&mut decoder, &mut src);

        assert!(matches!(items[..], [Item::Ping, Item::Pong]));
    }

    #[test]
    fn missing_content_length_closes_the_stream() {
        let mut decoder = StreamingDecoder::default();
        let mut src = BytesMut::from(
            &b"BYE sip:100@pbx.test SIP/2.0\r\nCall-ID: x\r\n\r\n"[..],
        );

        assert!(matches!(
            decoder.decode(&mut src),
            Err(DecodeError::Malformed)
        ));
    }

    #[test]
    fn oversized_body_declaration_is_refused() {
        let mut decoder = StreamingDecoder::default();
        let mut src = BytesMut::from(
            &b"BYE sip:100@pbx.test SIP/2.0\r\nContent-Length: 999999\r\n\r\n"[..],
        );

        assert!(matches!(
            decoder.decode(&mut src),
            Err(DecodeError::BufferOverrun)
        ));
    }
}
