//! Minimal view over SDP bodies.
//!
//! The relay owns real SDP processing; the core only needs to inspect offers
//! for the media direction (hold detection), the RTP profile (SRTP
//! passthrough) and the offered codecs.

use bytes::Bytes;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaDirection {
    SendRecv,
    SendOnly,
    RecvOnly,
    Inactive,
}

/// Parsed-enough view of an SDP body
#[derive(Debug)]
pub struct SdpView {
    pub direction: MediaDirection,
    /// True when the audio media line uses RTP/SAVP (SDES-SRTP offered)
    pub secure: bool,
    /// Codec names from rtpmap attributes, in offer order
    pub codecs: Vec<String>,
}

impl SdpView {
    pub fn parse(body: &Bytes) -> Option<Self> {
        let text = std::str::from_utf8(body).ok()?;

        if !text.starts_with("v=") {
            return None;
        }

        let mut direction = MediaDirection::SendRecv;
        let mut secure = false;
        let mut codecs = Vec::new();

        for line in text.lines() {
            let line = line.trim_end();

            if let Some(media) = line.strip_prefix("m=") {
                if media.starts_with("audio") {
                    secure = media.contains("RTP/SAVP");
                }
            } else if let Some(attr) = line.strip_prefix("a=") {
                match attr {
                    "sendonly" => direction = MediaDirection::SendOnly,
                    "recvonly" => direction = MediaDirection::RecvOnly,
                    "inactive" => direction = MediaDirection::Inactive,
                    "sendrecv" => direction = MediaDirection::SendRecv,
                    _ => {
                        if let Some(rtpmap) = attr.strip_prefix("rtpmap:") {
                            // "0 PCMU/8000" -> "PCMU"
                            if let Some(codec) = rtpmap
                                .split_whitespace()
                                .nth(1)
                                .and_then(|enc| enc.split('/').next())
                            {
                                codecs.push(codec.to_owned());
                            }
                        }
                    }
                }
            }
        }

        Some(Self {
            direction,
            secure,
            codecs,
        })
    }

    /// An offer putting us on hold has the peer only sending or inactive
    pub fn is_hold(&self) -> bool {
        matches!(
            self.direction,
            MediaDirection::SendOnly | MediaDirection::Inactive
        )
    }

    /// First codec from `priority` the offer also carries
    pub fn pick_codec<'p>(&self, priority: &'p [String]) -> Option<&'p str> {
        priority
            .iter()
            .find(|wanted| {
                self.codecs
                    .iter()
                    .any(|offered| offered.eq_ignore_ascii_case(wanted))
            })
            .map(String::as_str)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    const OFFER: &[u8] = b"v=0\r\n\
        o=- 123 123 IN IP4 10.0.0.42\r\n\
        s=-\r\n\
        c=IN IP4 10.0.0.42\r\n\
        t=0 0\r\n\
        m=audio 49170 RTP/AVP 0 8 9\r\n\
        a=rtpmap:0 PCMU/8000\r\n\
        a=rtpmap:8 PCMA/8000\r\n\
        a=rtpmap:9 G722/8000\r\n";

    #[test]
    fn parse_offer() {
        let view = SdpView::parse(&Bytes::from_static(OFFER)).unwrap();

        assert_eq!(view.direction, MediaDirection::SendRecv);
        assert!(!view.secure);
        assert_eq!(view.codecs, vec!["PCMU", "PCMA", "G722"]);
        assert!(!view.is_hold());
    }

    #[test]
    fn hold_offer() {
        let body = Bytes::from(
            [OFFER, b"a=sendonly\r\n".as_slice()].concat(),
        );

        let view = SdpView::parse(&body).unwrap();

        assert!(view.is_hold());
    }

    #[test]
    fn srtp_offer_detected() {
        let body = Bytes::from_static(
            b"v=0\r\nm=audio 5004 RTP/SAVP 0\r\na=crypto:1 AES_CM_128_HMAC_SHA1_80 inline:abc\r\n",
        );

        let view = SdpView::parse(&body).unwrap();

        assert!(view.secure);
    }

    #[test]
    fn codec_priority() {
        let view = SdpView::parse(&Bytes::from_static(OFFER)).unwrap();

        let priority = vec!["opus".to_owned(), "G722".to_owned(), "PCMU".to_owned()];

        assert_eq!(view.pick_codec(&priority), Some("G722"));
    }

    #[test]
    fn non_sdp_is_rejected() {
        assert!(SdpView::parse(&Bytes::from_static(b"hello")).is_none());
    }
}
