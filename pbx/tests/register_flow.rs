//! Extension registration against a running server over loopback UDP.

mod common;

use common::{TestPhone, start_pbx};
use sip_auth::{ClientAuthenticator, DigestAuthenticator, DigestCredentials, DigestUser,
    RequestParts, ResponseParts};
use sip_types::header::typed::Contact;
use sip_types::msg::{RequestLine, StatusLine};
use sip_types::uri::SipUri;
use sip_types::{Headers, Method, Name, StatusCode};

const CONFIG: &str = r#"
[sip]
domain = "pbx.test"
bind_udp = "127.0.0.1:0"
bind_tcp = "127.0.0.1:0"

[[extension]]
number = "100"
password = "hunter2"
"#;

fn register_message(phone: &TestPhone, cseq: u32, authorization: Option<&str>, expires: u32) -> String {
    let auth_line = authorization
        .map(|value| format!("Authorization: {value}\r\n"))
        .unwrap_or_default();

    format!(
        "REGISTER sip:pbx.test SIP/2.0\r\n\
         Via: SIP/2.0/UDP {local};branch=z9hG4bKreg{cseq}\r\n\
         Max-Forwards: 70\r\n\
         From: <sip:100@pbx.test>;tag=regtest\r\n\
         To: <sip:100@pbx.test>\r\n\
         Call-ID: register-flow@{local}\r\n\
         CSeq: {cseq} REGISTER\r\n\
         Contact: <sip:100@{local}>\r\n\
         Expires: {expires}\r\n\
         {auth_line}Content-Length: 0\r\n\r\n",
        local = phone.local,
    )
}

/// Solve the server's challenge the way a phone would
fn solve_challenge(challenge_headers: &Headers) -> String {
    let mut credentials = DigestCredentials::new();
    credentials.add_for_realm("pbx.test", DigestUser::new("100", "hunter2"));

    let mut authenticator = DigestAuthenticator::new(credentials);

    let uri: SipUri = "sip:pbx.test".parse().expect("valid uri");
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

#[tokio::test]
async fn register_challenge_then_success() {
    let pbx = start_pbx(CONFIG).await;
    let phone = TestPhone::connect(pbx.server.udp_addr).await;

    // first attempt carries no credentials and gets challenged
    phone.send(&register_message(&phone, 1, None, 300)).await;

    let (challenge_headers, _) = phone.recv_status(StatusCode::UNAUTHORIZED).await;
    assert!(challenge_headers.contains(&Name::WWW_AUTHENTICATE));

    // answering the challenge binds the contact
    let authorization = solve_challenge(&challenge_headers);

    phone
        .send(&register_message(&phone, 2, Some(&authorization), 300))
        .await;

    let (ok_headers, _) = phone.recv_status(StatusCode::OK).await;

    let contact: Contact = ok_headers.typed().expect("contact in 200");
    assert!(contact.expires().is_some());

    assert!(pbx.server.registrar.is_registered("100"));
}

#[tokio::test]
async fn register_refresh_is_idempotent() {
    let pbx = start_pbx(CONFIG).await;
    let phone = TestPhone::connect(pbx.server.udp_addr).await;

    phone.send(&register_message(&phone, 1, None, 300)).await;
    let (challenge_headers, _) = phone.recv_status(StatusCode::UNAUTHORIZED).await;

    let authorization = solve_challenge(&challenge_headers);
    phone
        .send(&register_message(&phone, 2, Some(&authorization), 300))
        .await;
    phone.recv_status(StatusCode::OK).await;

    // a refresh with the identical contact must not create a second binding
    phone.send(&register_message(&phone, 3, None, 300)).await;
    let (challenge_headers, _) = phone.recv_status(StatusCode::UNAUTHORIZED).await;

    let authorization = solve_challenge(&challenge_headers);
    phone
        .send(&register_message(&phone, 4, Some(&authorization), 300))
        .await;
    let (ok_headers, _) = phone.recv_status(StatusCode::OK).await;

    let contacts: Vec<Contact> = ok_headers.typed_list().expect("contacts parse");
    assert_eq!(contacts.len(), 1);

    assert_eq!(pbx.server.registrar.lookup("100").len(), 1);
}

#[tokio::test]
async fn expires_zero_removes_the_binding() {
    let pbx = start_pbx(CONFIG).await;
    let phone = TestPhone::connect(pbx.server.udp_addr).await;

    // bind
    phone.send(&register_message(&phone, 1, None, 300)).await;
    let (challenge_headers, _) = phone.recv_status(StatusCode::UNAUTHORIZED).await;
    let authorization = solve_challenge(&challenge_headers);
    phone
        .send(&register_message(&phone, 2, Some(&authorization), 300))
        .await;
    phone.recv_status(StatusCode::OK).await;

    assert!(pbx.server.registrar.is_registered("100"));

    // unbind with Expires: 0
    phone.send(&register_message(&phone, 3, None, 0)).await;
    let (challenge_headers, _) = phone.recv_status(StatusCode::UNAUTHORIZED).await;
    let authorization = solve_challenge(&challenge_headers);
    phone
        .send(&register_message(&phone, 4, Some(&authorization), 0))
        .await;
    phone.recv_status(StatusCode::OK).await;

    assert!(!pbx.server.registrar.is_registered("100"));
}

#[tokio::test]
async fn unknown_extension_is_rejected() {
    let pbx = start_pbx(CONFIG).await;
    let phone = TestPhone::connect(pbx.server.udp_addr).await;

    let message = format!(
        "REGISTER sip:pbx.test SIP/2.0\r\n\
         Via: SIP/2.0/UDP {local};branch=z9hG4bKunknown1\r\n\
         Max-Forwards: 70\r\n\
         From: <sip:999@pbx.test>;tag=unknown\r\n\
         To: <sip:999@pbx.test>\r\n\
         Call-ID: unknown-ext@{local}\r\n\
         CSeq: 1 REGISTER\r\n\
         Contact: <sip:999@{local}>\r\n\
         Content-Length: 0\r\n\r\n",
        local = phone.local,
    );

    phone.send(&message).await;
    phone.recv_status(StatusCode::NOT_FOUND).await;
}
