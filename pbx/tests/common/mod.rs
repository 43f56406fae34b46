//! Shared plumbing for the integration tests: a loopback server instance and
//! a bare-bones UDP test phone.

use bytes::Bytes;
use flowpbx::cdr::{CallRecord, ChannelCdrSink};
use sip_auth::{ClientAuthenticator, DigestAuthenticator, DigestCredentials, DigestUser,
    RequestParts, ResponseParts};
use sip_types::msg::{RequestLine, StatusLine};
use sip_types::uri::SipUri;
use sip_types::{Method, Name};
use flowpbx::config::PbxConfig;
use flowpbx::media::{MediaError, MediaRelay, MediaSide, SessionHandle};
use flowpbx::push::NoPush;
use flowpbx::Server;
use sip_types::msg::{MessageLine, ParsedMessage};
use sip_types::{Headers, StatusCode};
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;

/// Relay stub answering every allocation with a fixed loopback SDP
pub struct TestRelay {
    next: AtomicU64,
}

impl TestRelay {
    pub fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
        }
    }
}

#[async_trait::async_trait]
impl MediaRelay for TestRelay {
    async fn allocate(
        &self,
        _call_id: &str,
        _offer_sdp: Bytes,
    ) -> Result<(Bytes, SessionHandle), MediaError> {
        let answer = Bytes::from_static(
            b"v=0\r\no=- 0 0 IN IP4 127.0.0.1\r\ns=-\r\nc=IN IP4 127.0.0.1\r\nt=0 0\r\nm=audio 40000 RTP/AVP 0\r\na=rtpmap:0 PCMU/8000\r\n",
        );

        Ok((answer, SessionHandle(self.next.fetch_add(1, Ordering::Relaxed))))
    }

    async fn update(&self, _: &SessionHandle, _: Bytes) -> Result<Bytes, MediaError> {
        Ok(Bytes::from_static(b"v=0\r\n"))
    }

    async fn hold(&self, _: &SessionHandle, _: MediaSide) -> Result<(), MediaError> {
        Ok(())
    }

    async fn unhold(&self, _: &SessionHandle, _: MediaSide) -> Result<(), MediaError> {
        Ok(())
    }

    async fn release(&self, _: &SessionHandle) {}

    async fn start_recording(&self, _: &SessionHandle, _: &str) -> Result<(), MediaError> {
        Ok(())
    }

    async fn stop_recording(&self, _: &SessionHandle) -> Result<(), MediaError> {
        Ok(())
    }
}

pub struct TestPbx {
    pub server: Server,
    pub cdr_rx: mpsc::UnboundedReceiver<CallRecord>,
}

/// Boot a server on loopback with ephemeral ports
pub async fn start_pbx(config_toml: &str) -> TestPbx {
    let config: PbxConfig = toml::from_str(config_toml).expect("test config parses");

    let (cdr_sink, cdr_rx) = ChannelCdrSink::new();

    let server = Server::start(
        config,
        None,
        Arc::new(TestRelay::new()),
        Arc::new(NoPush),
        Arc::new(cdr_sink),
    )
    .await
    .expect("server starts");

    TestPbx { server, cdr_rx }
}

/// A bare UDP SIP endpoint for driving the server from the outside
pub struct TestPhone {
    pub socket: UdpSocket,
    pub local: SocketAddr,
    pub server: SocketAddr,
}

impl TestPhone {
    pub async fn connect(server: SocketAddr) -> Self {
        let socket = UdpSocket::bind("127.0.0.1:0").await.expect("bind phone");
        let local = socket.local_addr().expect("local addr");

        Self {
            socket,
            local,
            server,
        }
    }

    pub async fn send(&self, message: &str) {
        self.socket
            .send_to(message.as_bytes(), self.server)
            .await
            .expect("datagram sent");
    }

    /// Receive and parse the next message, skipping keep-alives
    pub async fn recv(&self) -> ParsedMessage {
        let mut buffer = vec![0u8; 65535];

        loop {
            let (len, _) = tokio::time::timeout(
                Duration::from_secs(5),
                self.socket.recv_from(&mut buffer),
            )
            .await
            .expect("message arrives in time")
            .expect("recv ok");

            if buffer[..len].starts_with(b"\r\n") {
                continue;
            }

            return ParsedMessage::parse(Bytes::copy_from_slice(&buffer[..len]))
                .expect("server sends valid SIP");
        }
    }

    /// Receive until a response with the wanted status code arrives
    pub async fn recv_status(&self, code: StatusCode) -> (Headers, Bytes) {
        for _ in 0..10 {
            let message = self.recv().await;

            if let MessageLine::Response(line) = &message.line {
                if line.code == code {
                    return (message.headers, message.body);
                }
            }
        }

        panic!("did not receive a {code} response");
    }
}

/// Solve a digest challenge the way a phone would, returning the
/// Authorization header value
pub fn solve_challenge(
    challenge_headers: &Headers,
    realm: &str,
    user: &str,
    password: &str,
    request_uri: &str,
    method: Method,
) -> String {
    let mut credentials = DigestCredentials::new();
    credentials.add_for_realm(realm, DigestUser::new(user, password));

    let mut authenticator = DigestAuthenticator::new(credentials);

    let uri: SipUri = request_uri.parse().expect("valid uri");
    let line = RequestLine { method, uri };
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
                headers: challenge_headers,
                body: &[],
            },
        )
        .expect("challenge is solvable");

    let mut headers = Headers::new();
    authenticator.authorize_request(&mut headers);

    headers
        .get(&Name::AUTHORIZATION)
        .expect("authorization produced")
        .to_string()
}

/// Register an extension through the usual challenge round trip
pub async fn register_extension(phone: &TestPhone, extension: &str, password: &str) {
    let register = |cseq: u32, authorization: Option<&str>| {
        let auth_line = authorization
            .map(|value| format!("Authorization: {value}\r\n"))
            .unwrap_or_default();

        format!(
            "REGISTER sip:pbx.test SIP/2.0\r\n\
             Via: SIP/2.0/UDP {local};branch=z9hG4bKcommonreg{cseq}\r\n\
             Max-Forwards: 70\r\n\
             From: <sip:{extension}@pbx.test>;tag=commonreg\r\n\
             To: <sip:{extension}@pbx.test>\r\n\
             Call-ID: common-register-{extension}@{local}\r\n\
             CSeq: {cseq} REGISTER\r\n\
             Contact: <sip:{extension}@{local}>\r\n\
             Expires: 300\r\n\
             {auth_line}Content-Length: 0\r\n\r\n",
            local = phone.local,
        )
    };

    phone.send(&register(1, None)).await;
    let (challenge_headers, _) = phone.recv_status(StatusCode::UNAUTHORIZED).await;

    let authorization = solve_challenge(
        &challenge_headers,
        "pbx.test",
        extension,
        password,
        "sip:pbx.test",
        Method::REGISTER,
    );

    phone.send(&register(2, Some(&authorization))).await;
    phone.recv_status(StatusCode::OK).await;
}
