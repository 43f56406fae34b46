//! Trunk registration loop against a mock upstream registrar.

mod common;

use bytes::Bytes;
use common::start_pbx;
use flowpbx::trunk::TrunkStatus;
use sip_auth::{DigestUser, DigestVerifier, VerifyOutcome};
use sip_types::header::typed::AuthResponse;
use sip_types::msg::{MessageLine, ParsedMessage};
use sip_types::{Headers, Name};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::UdpSocket;

/// Minimal upstream registrar: challenges once, then verifies and grants the
/// binding
async fn mock_registrar(socket: UdpSocket, password: &'static str) {
    let verifier = DigestVerifier::new("upstream.test");
    let user = DigestUser::new("acct", password);

    let mut buffer = vec![0u8; 65535];

    loop {
        let Ok((len, peer)) = socket.recv_from(&mut buffer).await else {
            return;
        };

        let Ok(message) = ParsedMessage::parse(Bytes::copy_from_slice(&buffer[..len])) else {
            continue;
        };

        let MessageLine::Request(_) = &message.line else {
            continue;
        };

        let authorized = matches!(
            message.headers.try_typed::<AuthResponse>(),
            Ok(Some(AuthResponse::Digest(ref digest)))
                if verifier.verify(
                    &sip_types::Method::REGISTER,
                    digest,
                    &user,
                ) == VerifyOutcome::Ok
        );

        let (status_line, extra) = if authorized {
            ("SIP/2.0 200 OK", "Expires: 60\r\n".to_owned())
        } else {
            let challenge = verifier.challenge(false);
            (
                "SIP/2.0 401 Unauthorized",
                format!("WWW-Authenticate: {challenge}\r\n"),
            )
        };

        let response = format!(
            "{status_line}\r\n{echo}{extra}Content-Length: 0\r\n\r\n",
            echo = echo_headers(&message.headers),
        );

        let _ = socket.send_to(response.as_bytes(), peer).await;
    }
}

fn echo_headers(headers: &Headers) -> String {
    let mut echoed = String::new();

    for name in [Name::VIA, Name::FROM, Name::TO, Name::CALL_ID, Name::CSEQ] {
        for value in headers.get_all(&name) {
            echoed.push_str(&format!("{}: {}\r\n", name.as_print_str(), value));
        }
    }

    echoed
}

fn trunk_config(upstream: SocketAddr, password: &str) -> String {
    format!(
        r#"
[sip]
domain = "pbx.test"
bind_udp = "127.0.0.1:0"
bind_tcp = "127.0.0.1:0"

[[trunk]]
id = "upstream"
type = "register"
host = "{host}"
port = {port}
username = "acct"
password = "{password}"
enabled = true
expiry = 60
"#,
        host = upstream.ip(),
        port = upstream.port(),
    )
}

async fn wait_for_status(
    pbx: &common::TestPbx,
    wanted: TrunkStatus,
    within: Duration,
) -> bool {
    let deadline = tokio::time::Instant::now() + within;

    while tokio::time::Instant::now() < deadline {
        if let Some(state) = pbx.server.trunks.state("upstream") {
            if state.status == wanted {
                return true;
            }
        }

        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    false
}

#[tokio::test]
async fn trunk_registers_through_digest_challenge() {
    let socket = UdpSocket::bind("127.0.0.1:0").await.expect("bind mock");
    let upstream = socket.local_addr().expect("local addr");

    tokio::spawn(mock_registrar(socket, "trunkpw"));

    let pbx = start_pbx(&trunk_config(upstream, "trunkpw")).await;

    assert!(
        wait_for_status(&pbx, TrunkStatus::Registered, Duration::from_secs(5)).await,
        "trunk did not reach registered: {:?}",
        pbx.server.trunks.state("upstream")
    );

    let state = pbx.server.trunks.state("upstream").expect("trunk exists");
    assert_eq!(state.retry_attempt, 0);
    assert!(state.expires_at.expect("expiry set") > std::time::SystemTime::now());
}

#[tokio::test]
async fn wrong_credentials_back_off_as_failed() {
    let socket = UdpSocket::bind("127.0.0.1:0").await.expect("bind mock");
    let upstream = socket.local_addr().expect("local addr");

    tokio::spawn(mock_registrar(socket, "rightpw"));

    let pbx = start_pbx(&trunk_config(upstream, "wrongpw")).await;

    assert!(
        wait_for_status(&pbx, TrunkStatus::Failed, Duration::from_secs(5)).await,
        "trunk did not reach failed: {:?}",
        pbx.server.trunks.state("upstream")
    );

    let state = pbx.server.trunks.state("upstream").expect("trunk exists");
    assert!(state.retry_attempt >= 1);
    assert!(state.last_error.is_some());
}
