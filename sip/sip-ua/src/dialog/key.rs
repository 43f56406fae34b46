use bytesstr::BytesStr;
use sip_core::IncomingRequest;

/// Identifies a dialog: (Call-ID, local tag, remote tag).
///
/// For an incoming request the local tag is the To tag and the peer tag the
/// From tag; requests without a To tag are not part of any dialog.
#[derive(Debug, Clone, Ord, PartialOrd, Eq, PartialEq, Hash)]
pub struct DialogKey {
    pub call_id: BytesStr,
    pub local_tag: BytesStr,
    pub peer_tag: Option<BytesStr>,
}

impl DialogKey {
    pub fn from_incoming(request: &IncomingRequest) -> Option<Self> {
        let base_headers = &request.base_headers;

        Some(Self {
            call_id: base_headers.call_id.0.clone(),
            local_tag: base_headers.to.tag.as_ref()?.clone(),
            peer_tag: base_headers.from.tag.clone(),
        })
    }
}
