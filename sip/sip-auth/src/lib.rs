//! Digest authentication (RFC 7616) for FlowPBX.
//!
//! The client side answers challenges from upstream registrars (trunks), the
//! server side challenges and verifies extensions using stateless
//! HMAC-signed nonces.

use sip_types::msg::{RequestLine, StatusLine};
use sip_types::Headers;
use std::error::Error;
use std::fmt::Debug;

mod digest;
mod server;

pub use digest::{DigestAuthenticator, DigestCredentials, DigestError, DigestUser};
pub use server::{DigestVerifier, NonceOutcome, VerifyOutcome};

/// SIP request authenticator, the client side of a digest exchange
pub trait ClientAuthenticator {
    type Error: Error + Debug;

    /// Add authorization to a request's headers.
    ///
    /// Digest implementations add nothing before the first rejection.
    fn authorize_request(&mut self, request: &mut Headers);

    /// Handle a 401/407 rejection.
    ///
    /// Must return an error when no more attempts should be made.
    fn handle_rejection(
        &mut self,
        rejected_request: RequestParts<'_>,
        reject_response: ResponseParts<'_>,
    ) -> Result<(), Self::Error>;
}

/// The request that has to be authenticated
#[derive(Debug, Clone, Copy)]
pub struct RequestParts<'s> {
    pub line: &'s RequestLine,
    pub headers: &'s Headers,
    pub body: &'s [u8],
}

/// The response rejecting the authentication
#[derive(Debug, Clone, Copy)]
pub struct ResponseParts<'s> {
    pub line: &'s StatusLine,
    pub headers: &'s Headers,
    pub body: &'s [u8],
}

pub(crate) type HashFn = fn(&[u8]) -> String;

pub(crate) fn hash_md5(i: &[u8]) -> String {
    format!("{:x}", md5::compute(i))
}

pub(crate) fn hash_sha256(i: &[u8]) -> String {
    use sha2::Digest;

    let mut hasher = sha2::Sha256::new();
    hasher.update(i);
    format!("{:x}", hasher.finalize())
}
