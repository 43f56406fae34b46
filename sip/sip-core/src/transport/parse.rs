use bytes::Bytes;
use sip_types::msg::{MessageError, ParsedMessage};

/// What one datagram turned out to be
pub(crate) enum Datagram {
    /// `\r\n\r\n` keep-alive ping, must be answered with a pong
    Ping,
    /// `\r\n` keep-alive pong
    Pong,
    /// A complete SIP message
    Sip(ParsedMessage),
}

/// Classify a datagram: keep-alive token or one complete SIP message.
///
/// Anything that is neither is an error; the caller drops it without a
/// response.
pub(crate) fn classify_datagram(bytes: &[u8]) -> Result<Datagram, MessageError> {
    match bytes {
        [b'\r', b'\n', b'\r', b'\n', ..] => Ok(Datagram::Ping),
        [b'\r', b'\n', ..] => Ok(Datagram::Pong),
        _ => ParsedMessage::parse(Bytes::copy_from_slice(bytes)).map(Datagram::Sip),
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn keep_alive_tokens() {
        assert!(matches!(classify_datagram(b"\r\n\r\n"), Ok(Datagram::Ping)));
        assert!(matches!(classify_datagram(b"\r\n"), Ok(Datagram::Pong)));
    }

    #[test]
    fn garbage_is_an_error() {
        assert!(classify_datagram(b"\x00\x01\x02").is_err());
        assert!(classify_datagram(b"not sip at all").is_err());
    }
}
