//! Server side digest verification with stateless HMAC-signed nonces.
//!
//! A nonce carries its creation timestamp and a random salt, signed with a
//! process-local secret, so no nonce store is required. Nonce-count replay is
//! still detected through a small bounded per-nonce counter aged out with the
//! nonce itself.

use crate::{DigestUser, HashFn, hash_md5, hash_sha256};
use bytesstr::BytesStr;
use hmac::{Hmac, Mac};
use parking_lot::Mutex;
use sip_types::header::typed::{
    Algorithm, AuthChallenge, DigestChallenge, DigestResponse, QOP_AUTH,
};
use sip_types::Method;
use std::collections::HashMap;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

type HmacSha256 = Hmac<sha2::Sha256>;

/// Nonces expire after this long; expired nonces trigger `stale=true`
/// inviting a silent retry
const NONCE_VALIDITY: Duration = Duration::from_secs(5 * 60);

/// Upper bound on tracked nonce counters
const MAX_TRACKED_NONCES: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NonceOutcome {
    Valid,
    /// Correctly signed but past its validity window
    Stale,
    Invalid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerifyOutcome {
    /// Credentials check out
    Ok,
    /// The nonce expired, re-challenge with `stale=true`
    Stale,
    /// Wrong credentials or a replayed nonce-count
    Rejected,
}

struct NonceCounter {
    highest_nc: u32,
    seen_at: SystemTime,
}

/// Challenges and verifies digest authentication for inbound requests
pub struct DigestVerifier {
    realm: BytesStr,
    secret: [u8; 32],
    counters: Mutex<HashMap<BytesStr, NonceCounter>>,
}

impl DigestVerifier {
    pub fn new(realm: impl Into<BytesStr>) -> Self {
        let mut secret = [0u8; 32];
        rand::Rng::fill(&mut rand::rng(), &mut secret[..]);

        Self {
            realm: realm.into(),
            secret,
            counters: Mutex::new(HashMap::new()),
        }
    }

    pub fn realm(&self) -> &BytesStr {
        &self.realm
    }

    /// Build a fresh challenge.
    ///
    /// SHA-256 is offered; MD5 responses are still accepted for interop since
    /// the verifier recomputes with whatever supported algorithm the response
    /// declares.
    pub fn challenge(&self, stale: bool) -> AuthChallenge {
        AuthChallenge::Digest(DigestChallenge {
            realm: self.realm.clone(),
            nonce: self.issue_nonce(),
            opaque: None,
            stale,
            algorithm: Algorithm::Sha256,
            qop: vec![BytesStr::from_static(QOP_AUTH)],
            other: vec![],
        })
    }

    /// Same challenge with MD5 for peers that cannot do SHA-256
    pub fn challenge_md5(&self, stale: bool) -> AuthChallenge {
        AuthChallenge::Digest(DigestChallenge {
            realm: self.realm.clone(),
            nonce: self.issue_nonce(),
            opaque: None,
            stale,
            algorithm: Algorithm::Md5,
            qop: vec![BytesStr::from_static(QOP_AUTH)],
            other: vec![],
        })
    }

    /// Verify an Authorization digest against the expected credentials
    pub fn verify(
        &self,
        method: &Method,
        response: &DigestResponse,
        user: &DigestUser,
    ) -> VerifyOutcome {
        match self.check_nonce(&response.nonce) {
            NonceOutcome::Valid => {}
            NonceOutcome::Stale => return VerifyOutcome::Stale,
            NonceOutcome::Invalid => return VerifyOutcome::Rejected,
        }

        if response.realm != self.realm || response.username != user.user.as_str() {
            return VerifyOutcome::Rejected;
        }

        let hash: HashFn = match &response.algorithm {
            Algorithm::Md5 => hash_md5,
            Algorithm::Sha256 => hash_sha256,
            Algorithm::Other(_) => return VerifyOutcome::Rejected,
        };

        let ha1 = user.ha1(&self.realm, hash);
        let ha2 = hash(format!("{}:{}", method, response.uri).as_bytes());

        let expected = match (&response.qop, &response.cnonce, response.nc) {
            (Some(qop), Some(cnonce), Some(nc)) if qop == QOP_AUTH => {
                if !self.check_nonce_count(&response.nonce, nc) {
                    return VerifyOutcome::Rejected;
                }

                hash(
                    format!(
                        "{}:{}:{:08x}:{}:{}:{}",
                        ha1, response.nonce, nc, cnonce, QOP_AUTH, ha2
                    )
                    .as_bytes(),
                )
            }
            (None, _, _) => hash(format!("{}:{}:{}", ha1, response.nonce, ha2).as_bytes()),
            _ => return VerifyOutcome::Rejected,
        };

        if expected == response.response.as_str() {
            VerifyOutcome::Ok
        } else {
            VerifyOutcome::Rejected
        }
    }

    fn issue_nonce(&self) -> BytesStr {
        let ts = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();

        let salt: u64 = rand::Rng::random(&mut rand::rng());

        let payload = format!("{ts:016x}{salt:016x}");
        let tag = self.sign(&payload);

        BytesStr::from(format!("{payload}{tag}"))
    }

    fn sign(&self, payload: &str) -> String {
        let mut mac = HmacSha256::new_from_slice(&self.secret).expect("any key length is valid");
        mac.update(payload.as_bytes());

        // 16 bytes of the tag keep the nonce compact
        hex::encode(&mac.finalize().into_bytes()[..16])
    }

    fn check_nonce(&self, nonce: &BytesStr) -> NonceOutcome {
        // 16 hex chars timestamp + 16 salt + 32 tag
        if nonce.len() != 64 {
            return NonceOutcome::Invalid;
        }

        let (payload, tag) = nonce.as_str().split_at(32);

        if self.sign(payload) != tag {
            return NonceOutcome::Invalid;
        }

        let Ok(ts) = u64::from_str_radix(&payload[..16], 16) else {
            return NonceOutcome::Invalid;
        };

        let issued_at = UNIX_EPOCH + Duration::from_secs(ts);

        match SystemTime::now().duration_since(issued_at) {
            Ok(age) if age <= NONCE_VALIDITY => NonceOutcome::Valid,
            Ok(_) => NonceOutcome::Stale,
            // clock went backwards, treat as fresh
            Err(_) => NonceOutcome::Valid,
        }
    }

    /// The nonce-count must strictly increase per nonce
    fn check_nonce_count(&self, nonce: &BytesStr, nc: u32) -> bool {
        let mut counters = self.counters.lock();

        if counters.len() >= MAX_TRACKED_NONCES {
            let cutoff = SystemTime::now() - NONCE_VALIDITY;
            counters.retain(|_, counter| counter.seen_at > cutoff);
        }

        match counters.get_mut(nonce) {
            Some(counter) => {
                if nc <= counter.highest_nc {
                    return false;
                }

                counter.highest_nc = nc;
                counter.seen_at = SystemTime::now();
                true
            }
            None => {
                counters.insert(
                    nonce.clone(),
                    NonceCounter {
                        highest_nc: nc,
                        seen_at: SystemTime::now(),
                    },
                );
                true
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{ClientAuthenticator, DigestAuthenticator, DigestCredentials, RequestParts, ResponseParts};
    use sip_types::header::typed::AuthResponse;
    use sip_types::msg::{RequestLine, StatusLine};
    use sip_types::uri::SipUri;
    use sip_types::{Headers, StatusCode};

    fn verifier() -> DigestVerifier {
        DigestVerifier::new("flowpbx")
    }

    fn solve(challenge: &AuthChallenge, user: &DigestUser) -> DigestResponse {
        let mut headers = Headers::new();
        headers.insert_typed(challenge);

        let mut credentials = DigestCredentials::new();
        credentials.add_for_realm("flowpbx", user.clone());

        let mut authenticator = DigestAuthenticator::new(credentials);

        let uri: SipUri = "sip:pbx.example.org".parse().unwrap();
        let line = RequestLine {
            method: Method::REGISTER,
            uri,
        };
        let status = StatusLine {
            code: StatusCode::UNAUTHORIZED,
            reason: None,
        };

        authenticator
            .handle_rejection(
                RequestParts {
                    line: &line,
                    headers: &Headers::new(),
                    body: &[],
                },
                ResponseParts {
                    line: &status,
                    headers: &headers,
                    body: &[],
                },
            )
            .unwrap();

        let mut out = Headers::new();
        authenticator.authorize_request(&mut out);

        match out.typed::<AuthResponse>().unwrap() {
            AuthResponse::Digest(digest) => digest,
            AuthResponse::Other { .. } => panic!("expected digest"),
        }
    }

    #[test]
    fn challenge_verify_loop() {
        let verifier = verifier();
        let user = DigestUser::new("100", "hunter2");

        let challenge = verifier.challenge(false);
        let response = solve(&challenge, &user);

        assert_eq!(
            verifier.verify(&Method::REGISTER, &response, &user),
            VerifyOutcome::Ok
        );
    }

    #[test]
    fn wrong_password_is_rejected() {
        let verifier = verifier();

        let challenge = verifier.challenge(false);
        let response = solve(&challenge, &DigestUser::new("100", "wrong"));

        assert_eq!(
            verifier.verify(&Method::REGISTER, &response, &DigestUser::new("100", "right")),
            VerifyOutcome::Rejected
        );
    }

    #[test]
    fn replayed_nonce_count_is_rejected() {
        let verifier = verifier();
        let user = DigestUser::new("100", "hunter2");

        let challenge = verifier.challenge(false);
        let response = solve(&challenge, &user);

        assert_eq!(
            verifier.verify(&Method::REGISTER, &response, &user),
            VerifyOutcome::Ok
        );

        // identical nc replay must fail
        assert_eq!(
            verifier.verify(&Method::REGISTER, &response, &user),
            VerifyOutcome::Rejected
        );
    }

    #[test]
    fn foreign_nonce_is_invalid() {
        let verifier = verifier();
        let other = DigestVerifier::new("flowpbx");

        let AuthChallenge::Digest(challenge) = other.challenge(false) else {
            panic!("expected digest");
        };

        assert_eq!(verifier.check_nonce(&challenge.nonce), NonceOutcome::Invalid);
    }

    #[test]
    fn md5_response_is_accepted() {
        let verifier = verifier();
        let user = DigestUser::new("100", "hunter2");

        let challenge = verifier.challenge_md5(false);
        let response = solve(&challenge, &user);

        assert_eq!(response.algorithm, Algorithm::Md5);
        assert_eq!(
            verifier.verify(&Method::REGISTER, &response, &user),
            VerifyOutcome::Ok
        );
    }
}
