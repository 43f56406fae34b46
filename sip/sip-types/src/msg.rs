//! Message lines and the incremental head parser

use crate::code::StatusCode;
use crate::header::typed::ContentLength;
use crate::header::Name;
use crate::parse::{IResult, Parse, ParseError, slice_str};
use crate::uri::SipUri;
use crate::{Headers, Method};
use bytes::Bytes;
use bytesstr::BytesStr;
use nom::branch::alt;
use nom::bytes::complete::{tag, tag_no_case, take_while1};
use nom::character::complete::{char, multispace1, u16};
use nom::combinator::{map, opt};
use nom::sequence::{preceded, tuple};
use std::fmt;
use std::str::from_utf8;

/// First line of a SIP request
#[derive(Debug, Clone)]
pub struct RequestLine {
    pub method: Method,
    pub uri: SipUri,
}

impl Parse for RequestLine {
    fn parse(src: &Bytes) -> impl Fn(&str) -> IResult<&str, Self> + '_ {
        move |i| {
            map(
                tuple((
                    Method::parse(src),
                    multispace1,
                    SipUri::parse(src),
                    multispace1,
                    tag_no_case("SIP"),
                    char('/'),
                    take_while1(|c: char| c.is_ascii_digit() || c == '.'),
                )),
                |(method, _, uri, ..)| RequestLine { method, uri },
            )(i)
        }
    }
}

impl fmt::Display for RequestLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} SIP/2.0", self.method, self.uri)
    }
}

/// First line of a SIP response
#[derive(Debug, Clone)]
pub struct StatusLine {
    pub code: StatusCode,
    pub reason: Option<BytesStr>,
}

impl StatusLine {
    /// Parse from a standalone string, used for `message/sipfrag` bodies
    pub fn parse_str(i: &str) -> Result<Self, ParseError> {
        use nom::Finish;

        let src = BytesStr::from(i);

        Self::parse(src.as_ref())(src.as_str())
            .finish()
            .map(|(_, line)| line)
            .map_err(|_| ParseError("StatusLine"))
    }
}

impl Parse for StatusLine {
    fn parse(src: &Bytes) -> impl Fn(&str) -> IResult<&str, Self> + '_ {
        move |i| {
            map(
                tuple((
                    tag_no_case("SIP"),
                    char('/'),
                    take_while1(|c: char| c.is_ascii_digit() || c == '.'),
                    multispace1,
                    u16,
                    opt(preceded(tag(" "), |i: &str| {
                        Ok(("", slice_str(src, i.trim_end())))
                    })),
                )),
                |(_, _, _, _, code, reason)| StatusLine {
                    code: code.into(),
                    reason: reason.filter(|r| !r.is_empty()),
                },
            )(i)
        }
    }
}

impl fmt::Display for StatusLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SIP/2.0 {}", self.code)?;

        match &self.reason {
            Some(reason) => write!(f, " {reason}"),
            None => match self.code.text() {
                Some(text) => write!(f, " {text}"),
                None => Ok(()),
            },
        }
    }
}

/// Leading line of any SIP message
#[derive(Debug, Clone)]
pub enum MessageLine {
    Request(RequestLine),
    Response(StatusLine),
}

impl MessageLine {
    pub fn is_request(&self) -> bool {
        matches!(self, Self::Request(_))
    }
}

impl Parse for MessageLine {
    fn parse(src: &Bytes) -> impl Fn(&str) -> IResult<&str, Self> + '_ {
        move |i| {
            alt((
                map(StatusLine::parse(src), MessageLine::Response),
                map(RequestLine::parse(src), MessageLine::Request),
            ))(i)
        }
    }
}

impl fmt::Display for MessageLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageLine::Request(line) => line.fmt(f),
            MessageLine::Response(line) => line.fmt(f),
        }
    }
}

/// A single `Name: value` head line
#[derive(Debug)]
pub struct HeaderLine {
    pub name: Name,
    pub value: BytesStr,
}

impl HeaderLine {
    /// Split a logical head line into name and value.
    ///
    /// Folded continuation lines are unfolded into a single space.
    pub fn parse(src: &Bytes, line: &str) -> Result<Self, ParseError> {
        let (name, value) = line.split_once(':').ok_or(ParseError("HeaderLine"))?;

        let name = Name::from(slice_str(src, name.trim()));
        let value = value.trim();

        let value = if value.contains('\n') {
            let mut unfolded = String::with_capacity(value.len());

            for (idx, seg) in value.lines().enumerate() {
                if idx > 0 {
                    unfolded.push(' ');
                }
                unfolded.push_str(seg.trim());
            }

            BytesStr::from(unfolded)
        } else {
            slice_str(src, value)
        };

        Ok(Self { name, value })
    }
}

/// Head parsing did not find a complete line yet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Incomplete;

/// Incremental parser over the head section of a message buffer.
///
/// Yields logical lines (folded continuations included) until the empty line
/// terminating the head. When the buffer ends mid-line a single
/// `Err(Incomplete)` is yielded; [`PullParser::progress`] then marks where a
/// later attempt with more data can resume.
pub struct PullParser<'i> {
    src: &'i [u8],
    pos: usize,
    head_end: usize,
    done: bool,
}

impl<'i> PullParser<'i> {
    pub fn new(src: &'i [u8], progress: usize) -> Self {
        Self {
            src,
            pos: progress.min(src.len()),
            head_end: 0,
            done: false,
        }
    }

    pub fn progress(&self) -> usize {
        self.pos
    }

    /// Offset of the first body byte. Only meaningful after the iterator
    /// finished without yielding `Incomplete`.
    pub fn head_end(&self) -> usize {
        self.head_end
    }

    /// Find the end of the logical line starting at `start`.
    ///
    /// Returns (content-end, next-line-start) or `None` when the buffer ends
    /// before an unfolded line terminator is seen.
    fn find_line_end(&self, start: usize) -> Option<(usize, usize)> {
        let mut search = start;

        loop {
            let nl = memchr::memchr(b'\n', &self.src[search..])? + search;

            let content_end = if nl > start && self.src[nl - 1] == b'\r' {
                nl - 1
            } else {
                nl
            };

            if content_end == start {
                // the empty line terminating the head, no folding possible
                return Some((content_end, nl + 1));
            }

            match self.src.get(nl + 1) {
                // folded continuation, the logical line goes on
                Some(b' ' | b'\t') => search = nl + 1,
                Some(_) => return Some((content_end, nl + 1)),
                // cannot yet tell if the next line is a continuation
                None => return None,
            }
        }
    }
}

impl<'i> Iterator for PullParser<'i> {
    type Item = Result<&'i [u8], Incomplete>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }

        let Some((content_end, next_start)) = self.find_line_end(self.pos) else {
            self.done = true;
            return Some(Err(Incomplete));
        };

        let line = &self.src[self.pos..content_end];

        if line.is_empty() {
            // empty line terminates the head
            self.done = true;
            self.head_end = next_start;
            return None;
        }

        self.pos = next_start;

        Some(Ok(line))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum MessageError {
    #[error("message head is incomplete")]
    Incomplete,
    #[error("message is malformed")]
    Malformed,
}

/// A complete message parsed out of a datagram or framed stream chunk
#[derive(Debug)]
pub struct ParsedMessage {
    pub line: MessageLine,
    pub headers: Headers,
    pub body: Bytes,

    /// The buffer holding the complete message
    pub buffer: Bytes,
}

impl ParsedMessage {
    /// Parse a buffer that must contain one complete message.
    ///
    /// The body length is validated against Content-Length; a missing header
    /// means "no body" for datagram transports.
    pub fn parse(buffer: Bytes) -> Result<Self, MessageError> {
        let mut line = None;
        let mut headers = Headers::new();

        let mut parser = PullParser::new(&buffer, 0);

        for item in &mut parser {
            let item = item.map_err(|_| MessageError::Incomplete)?;
            let item = from_utf8(item).map_err(|_| MessageError::Malformed)?;

            if line.is_none() {
                use nom::Finish;

                line = Some(
                    MessageLine::parse(&buffer)(item)
                        .finish()
                        .map(|(_, line)| line)
                        .map_err(|_| MessageError::Malformed)?,
                );
            } else {
                let header = HeaderLine::parse(&buffer, item)
                    .map_err(|_| MessageError::Malformed)?;

                headers.insert(header.name, header.value);
            }
        }

        let line = line.ok_or(MessageError::Malformed)?;
        let head_end = parser.head_end();

        if head_end == 0 {
            return Err(MessageError::Incomplete);
        }

        let remaining = buffer.len() - head_end;

        let content_len = match headers
            .try_typed::<ContentLength>()
            .map_err(|_| MessageError::Malformed)?
        {
            Some(ContentLength(len)) => {
                if len > remaining {
                    return Err(MessageError::Malformed);
                }
                len
            }
            None => remaining,
        };

        let body = buffer.slice(head_end..head_end + content_len);

        Ok(Self {
            line,
            headers,
            body,
            buffer,
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    const INVITE: &[u8] = b"INVITE sip:100@pbx.example.org SIP/2.0\r\n\
        Via: SIP/2.0/UDP 10.0.0.1:5060;branch=z9hG4bK776asdhds\r\n\
        Max-Forwards: 70\r\n\
        To: <sip:100@pbx.example.org>\r\n\
        From: Alice <sip:alice@example.org>;tag=1928301774\r\n\
        Call-ID: a84b4c76e66710@10.0.0.1\r\n\
        CSeq: 314159 INVITE\r\n\
        Contact: <sip:alice@10.0.0.1>\r\n\
        Content-Length: 4\r\n\
        \r\n\
        v=0\r\n";

    #[test]
    fn parse_request() {
        let msg = ParsedMessage::parse(Bytes::from_static(INVITE)).unwrap();

        let MessageLine::Request(line) = &msg.line else {
            panic!("expected request");
        };

        assert_eq!(line.method, Method::INVITE);
        assert_eq!(line.uri.user.as_deref(), Some("100"));
        assert_eq!(msg.headers.len(), 8);
        assert_eq!(&msg.body[..], b"v=0\r");
    }

    #[test]
    fn parse_folded_header() {
        let raw = b"SIP/2.0 200 OK\r\n\
            Subject: first part\r\n\tsecond part\r\n\
            Content-Length: 0\r\n\
            \r\n";

        let msg = ParsedMessage::parse(Bytes::from_static(raw)).unwrap();

        assert_eq!(
            msg.headers.get(&Name::from("Subject")).unwrap(),
            "first part second part"
        );
    }

    #[test]
    fn content_length_exceeding_buffer_is_malformed() {
        let raw = b"BYE sip:100@pbx SIP/2.0\r\nContent-Length: 999\r\n\r\n";

        assert!(matches!(
            ParsedMessage::parse(Bytes::from_static(raw)),
            Err(MessageError::Malformed)
        ));
    }

    #[test]
    fn incomplete_head() {
        let raw = b"INVITE sip:100@pbx SIP/2.0\r\nVia: SIP/2.0/UDP 10.0.0.1";

        assert!(matches!(
            ParsedMessage::parse(Bytes::from_static(raw)),
            Err(MessageError::Incomplete)
        ));
    }

    #[test]
    fn status_line_roundtrip() {
        let line = StatusLine::parse_str("SIP/2.0 180 Ringing").unwrap();

        assert_eq!(line.code, StatusCode::RINGING);
        assert_eq!(line.to_string(), "SIP/2.0 180 Ringing");
    }
}
