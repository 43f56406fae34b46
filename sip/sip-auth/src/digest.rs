use crate::{ClientAuthenticator, HashFn, RequestParts, ResponseParts, hash_md5, hash_sha256};
use bytesstr::BytesStr;
use sip_types::header::typed::{
    Algorithm, AuthChallenge, AuthResponse, DigestChallenge, DigestResponse, QOP_AUTH,
};
use sip_types::{Headers, Name};

#[derive(Debug, thiserror::Error)]
pub enum DigestError {
    #[error("failed to authenticate realm {0:?}")]
    FailedToAuthenticate(BytesStr),
    #[error("challenge uses unsupported algorithm {0}")]
    UnsupportedAlgorithm(BytesStr),
    #[error("no credentials available for realm {0:?}")]
    MissingCredentials(BytesStr),
    #[error("challenge offers no supported qop")]
    UnsupportedQop,
    #[error("response contained no digest challenge")]
    NoDigestChallenge,
}

/// Credentials for one user
#[derive(Debug, Clone)]
pub struct DigestUser {
    pub user: String,
    pub password: String,
}

impl DigestUser {
    pub fn new<U, P>(user: U, password: P) -> Self
    where
        U: Into<String>,
        P: Into<String>,
    {
        Self {
            user: user.into(),
            password: password.into(),
        }
    }

    /// H(A1) for this user under the given realm and hash
    pub(crate) fn ha1(&self, realm: &str, hash: HashFn) -> String {
        hash(format!("{}:{}:{}", self.user, realm, self.password).as_bytes())
    }
}

/// Credentials mapped to their realm, with an optional default for realms
/// seen for the first time
#[derive(Debug, Default, Clone)]
pub struct DigestCredentials {
    default: Option<DigestUser>,
    realms: Vec<(String, DigestUser)>,
}

impl DigestCredentials {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the credentials used for unknown realms
    pub fn set_default(&mut self, credentials: DigestUser) {
        self.default = Some(credentials);
    }

    pub fn add_for_realm<R>(&mut self, realm: R, credentials: DigestUser)
    where
        R: Into<String>,
    {
        self.realms.push((realm.into(), credentials));
    }

    pub fn get_for_realm(&self, realm: &str) -> Option<&DigestUser> {
        self.realms
            .iter()
            .find_map(|(r, user)| (r == realm).then_some(user))
            .or(self.default.as_ref())
    }
}

/// A cached authorization that is replayed (with an incremented nonce count)
/// on subsequent requests
struct CachedResponse {
    header: DigestResponse,
    ha1: String,
    ha2: String,
    hash: HashFn,
    is_proxy: bool,
    used: bool,
}

/// Solves digest challenges from 401/407 responses (RFC 7616).
///
/// Supports MD5 and SHA-256 with qop `auth` or no qop at all.
pub struct DigestAuthenticator {
    pub credentials: DigestCredentials,
    cached: Option<CachedResponse>,
}

impl DigestAuthenticator {
    pub fn new(credentials: DigestCredentials) -> Self {
        Self {
            credentials,
            cached: None,
        }
    }

    fn solve_challenge(
        &self,
        challenge: DigestChallenge,
        request: RequestParts<'_>,
        is_proxy: bool,
    ) -> Result<CachedResponse, DigestError> {
        let hash: HashFn = match &challenge.algorithm {
            Algorithm::Md5 => hash_md5,
            Algorithm::Sha256 => hash_sha256,
            Algorithm::Other(other) => {
                return Err(DigestError::UnsupportedAlgorithm(other.clone()));
            }
        };

        let user = self
            .credentials
            .get_for_realm(&challenge.realm)
            .ok_or_else(|| DigestError::MissingCredentials(challenge.realm.clone()))?;

        let ha1 = user.ha1(&challenge.realm, hash);

        let uri = request.line.uri.to_string();
        let ha2 = hash(format!("{}:{}", request.line.method, uri).as_bytes());

        let use_qop = if challenge.qop.is_empty() {
            false
        } else if challenge.qop.iter().any(|qop| qop == QOP_AUTH) {
            true
        } else {
            return Err(DigestError::UnsupportedQop);
        };

        let (response, cnonce, qop, nc) = if use_qop {
            let cnonce = BytesStr::from(uuid::Uuid::new_v4().simple().to_string());
            let nc = 1u32;

            let response = hash(
                format!(
                    "{}:{}:{:08x}:{}:{}:{}",
                    ha1, challenge.nonce, nc, cnonce, QOP_AUTH, ha2
                )
                .as_bytes(),
            );

            (
                response,
                Some(cnonce),
                Some(BytesStr::from_static(QOP_AUTH)),
                Some(nc),
            )
        } else {
            let response = hash(format!("{}:{}:{}", ha1, challenge.nonce, ha2).as_bytes());

            (response, None, None, None)
        };

        Ok(CachedResponse {
            header: DigestResponse {
                username: BytesStr::from(user.user.as_str()),
                realm: challenge.realm,
                nonce: challenge.nonce,
                uri: uri.into(),
                response: response.into(),
                algorithm: challenge.algorithm,
                opaque: challenge.opaque,
                qop,
                cnonce,
                nc,
            },
            ha1,
            ha2,
            hash,
            is_proxy,
            used: false,
        })
    }
}

impl ClientAuthenticator for DigestAuthenticator {
    fn authorize_request(&mut self, request_headers: &mut Headers) {
        let Some(cached) = &mut self.cached else {
            return;
        };

        // replaying a qop response requires a new nonce count and response
        if cached.used {
            if let (Some(nc), Some(cnonce)) = (&mut cached.header.nc, &cached.header.cnonce) {
                *nc += 1;

                let response = (cached.hash)(
                    format!(
                        "{}:{}:{:08x}:{}:{}:{}",
                        cached.ha1, cached.header.nonce, *nc, cnonce, QOP_AUTH, cached.ha2
                    )
                    .as_bytes(),
                );

                cached.header.response = response.into();
            }
        }

        cached.used = true;

        let name = if cached.is_proxy {
            Name::PROXY_AUTHORIZATION
        } else {
            Name::AUTHORIZATION
        };

        request_headers.insert_typed_named(name, &AuthResponse::Digest(cached.header.clone()));
    }

    type Error = DigestError;

    fn handle_rejection(
        &mut self,
        rejected_request: RequestParts<'_>,
        reject_response: ResponseParts<'_>,
    ) -> Result<(), DigestError> {
        for (header, is_proxy) in [
            (Name::WWW_AUTHENTICATE, false),
            (Name::PROXY_AUTHENTICATE, true),
        ] {
            let Ok(challenge) = reject_response
                .headers
                .typed_named::<AuthChallenge>(&header)
            else {
                continue;
            };

            let AuthChallenge::Digest(challenge) = challenge else {
                continue;
            };

            // a second challenge without stale=true means the credentials
            // were wrong; give up instead of looping
            if self.cached.is_some() && !challenge.stale {
                return Err(DigestError::FailedToAuthenticate(challenge.realm));
            }

            let solved = self.solve_challenge(challenge, rejected_request, is_proxy)?;
            self.cached = Some(solved);

            return Ok(());
        }

        Err(DigestError::NoDigestChallenge)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use sip_types::msg::{RequestLine, StatusLine};
    use sip_types::uri::SipUri;
    use sip_types::{Method, StatusCode};

    fn challenge_headers(algorithm: &str, qop: bool) -> Headers {
        let mut headers = Headers::new();

        let qop = if qop { ", qop=\"auth\"" } else { "" };

        headers.insert(
            Name::WWW_AUTHENTICATE,
            format!(
                "Digest realm=\"flowpbx\", nonce=\"YWmh5GFpoLjiTDCA\", algorithm={algorithm}{qop}"
            ),
        );

        headers
    }

    fn reject<'s>(headers: &'s Headers, line: &'s StatusLine) -> ResponseParts<'s> {
        ResponseParts {
            line,
            headers,
            body: &[],
        }
    }

    #[test]
    fn md5_without_qop_solves_challenge() {
        // the RFC 2617 example identities: user Mufasa, realm testrealm@host.com
        let mut headers = Headers::new();
        headers.insert(
            Name::WWW_AUTHENTICATE,
            "Digest realm=\"testrealm@host.com\", nonce=\"dcd98b7102dd2f0e8b11d0f600bfb0c093\", algorithm=MD5",
        );

        let mut credentials = DigestCredentials::new();
        credentials.add_for_realm(
            "testrealm@host.com",
            DigestUser::new("Mufasa", "Circle Of Life"),
        );

        let mut authenticator = DigestAuthenticator::new(credentials);

        let uri: SipUri = "sip:dir.example.com".parse().unwrap();
        let line = RequestLine {
            method: Method::from("GET"),
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
                reject(&headers, &status),
            )
            .unwrap();

        let mut out = Headers::new();
        authenticator.authorize_request(&mut out);

        let AuthResponse::Digest(digest) = out.typed::<AuthResponse>().unwrap() else {
            panic!("expected digest response");
        };

        assert_eq!(digest.username, "Mufasa");
        assert_eq!(digest.realm, "testrealm@host.com");
        assert_eq!(digest.qop, None);
    }

    #[test]
    fn qop_replay_increments_nonce_count() {
        let headers = challenge_headers("MD5", true);

        let mut credentials = DigestCredentials::new();
        credentials.add_for_realm("flowpbx", DigestUser::new("trunk1", "secret"));

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
                reject(&headers, &status),
            )
            .unwrap();

        let mut first = Headers::new();
        authenticator.authorize_request(&mut first);

        let mut second = Headers::new();
        authenticator.authorize_request(&mut second);

        let AuthResponse::Digest(first) = first.typed::<AuthResponse>().unwrap() else {
            panic!("expected digest");
        };
        let AuthResponse::Digest(second) = second.typed::<AuthResponse>().unwrap() else {
            panic!("expected digest");
        };

        assert_eq!(first.nc, Some(1));
        assert_eq!(second.nc, Some(2));
        assert_ne!(first.response, second.response);
    }

    #[test]
    fn repeated_challenge_with_same_nonce_fails() {
        let headers = challenge_headers("MD5", false);

        let mut credentials = DigestCredentials::new();
        credentials.add_for_realm("flowpbx", DigestUser::new("trunk1", "wrong"));

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

        let request = RequestParts {
            line: &line,
            headers: &Headers::new(),
            body: &[],
        };

        authenticator
            .handle_rejection(request, reject(&headers, &status))
            .unwrap();

        assert!(matches!(
            authenticator.handle_rejection(request, reject(&headers, &status)),
            Err(DigestError::FailedToAuthenticate(_))
        ));
    }

    #[test]
    fn unsupported_algorithm_is_rejected() {
        let headers = challenge_headers("SHA-512-256", false);

        let mut credentials = DigestCredentials::new();
        credentials.add_for_realm("flowpbx", DigestUser::new("trunk1", "secret"));

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

        assert!(matches!(
            authenticator.handle_rejection(
                RequestParts {
                    line: &line,
                    headers: &Headers::new(),
                    body: &[],
                },
                reject(&headers, &status),
            ),
            Err(DigestError::UnsupportedAlgorithm(_))
        ));
    }
}
