//! Inbound INVITE handling over loopback UDP.

mod common;

use common::{TestPhone, start_pbx};
use flowpbx::cdr::Disposition;
use sip_types::msg::MessageLine;
use sip_types::{Name, StatusCode};
use std::time::Duration;

const CONFIG: &str = r#"
[sip]
domain = "pbx.test"
bind_udp = "127.0.0.1:0"
bind_tcp = "127.0.0.1:0"

[[extension]]
number = "100"
password = "hunter2"

[[trunk]]
id = "carrier"
type = "ip"
host = "203.0.113.50"
remote_hosts = ["127.0.0.1"]
enabled = false

[[inbound_number]]
number = "+15551234567"
target = "100"
"#;

const OFFER_SDP: &str = "v=0\r\no=- 1 1 IN IP4 127.0.0.1\r\ns=-\r\nc=IN IP4 127.0.0.1\r\nt=0 0\r\nm=audio 30000 RTP/AVP 0\r\na=rtpmap:0 PCMU/8000\r\n";

fn invite_message(phone: &TestPhone, target_user: &str, branch: &str) -> String {
    format!(
        "INVITE sip:{target_user}@pbx.test SIP/2.0\r\n\
         Via: SIP/2.0/UDP {local};branch=z9hG4bK{branch}\r\n\
         Max-Forwards: 70\r\n\
         From: <sip:+15557770000@carrier.example>;tag=trunkcall\r\n\
         To: <sip:{target_user}@pbx.test>\r\n\
         Call-ID: invite-flow-{branch}@{local}\r\n\
         CSeq: 1 INVITE\r\n\
         Contact: <sip:+15557770000@{local}>\r\n\
         Content-Type: application/sdp\r\n\
         Content-Length: {len}\r\n\r\n{OFFER_SDP}",
        local = phone.local,
        len = OFFER_SDP.len(),
    )
}

fn ack_message(phone: &TestPhone, target_user: &str, branch: &str, to_tag: &str) -> String {
    format!(
        "ACK sip:{target_user}@pbx.test SIP/2.0\r\n\
         Via: SIP/2.0/UDP {local};branch=z9hG4bK{branch}\r\n\
         Max-Forwards: 70\r\n\
         From: <sip:+15557770000@carrier.example>;tag=trunkcall\r\n\
         To: <sip:{target_user}@pbx.test>;tag={to_tag}\r\n\
         Call-ID: invite-flow-{branch}@{local}\r\n\
         CSeq: 1 ACK\r\n\
         Content-Length: 0\r\n\r\n",
        local = phone.local,
    )
}

/// A trunk call to an extension without bindings rings nobody and ends 480
#[tokio::test]
async fn trunk_call_to_unregistered_extension() {
    let mut pbx = start_pbx(CONFIG).await;
    let phone = TestPhone::connect(pbx.server.udp_addr).await;

    phone.send(&invite_message(&phone, "100", "call1")).await;

    // 100 Trying comes first, then the failure
    let message = phone.recv().await;
    let MessageLine::Response(line) = &message.line else {
        panic!("expected a response");
    };
    assert_eq!(line.code, StatusCode::TRYING);

    let (headers, _) = phone
        .recv_status(StatusCode::TEMPORARILY_UNAVAILABLE)
        .await;

    // complete the transaction so the server stops retransmitting
    let to_tag = headers
        .typed_named::<sip_types::header::typed::FromTo>(&Name::TO)
        .expect("to parses")
        .tag
        .expect("failure response carries a to tag");

    phone
        .send(&ack_message(&phone, "100", "call1", to_tag.as_str()))
        .await;

    // the CDR reports the failed call
    let record = tokio::time::timeout(Duration::from_secs(5), pbx.cdr_rx.recv())
        .await
        .expect("CDR in time")
        .expect("CDR emitted");

    assert_eq!(record.disposition, Disposition::Failed);
    assert_eq!(record.callee, "100");
}

/// An unknown destination is answered 404 without ringing anything
#[tokio::test]
async fn unknown_destination_is_rejected() {
    let mut pbx = start_pbx(CONFIG).await;
    let phone = TestPhone::connect(pbx.server.udp_addr).await;

    phone.send(&invite_message(&phone, "42", "call2")).await;

    let (headers, _) = phone.recv_status(StatusCode::NOT_FOUND).await;

    let to_tag = headers
        .typed_named::<sip_types::header::typed::FromTo>(&Name::TO)
        .expect("to parses")
        .tag
        .unwrap_or_else(|| "none".into());

    phone
        .send(&ack_message(&phone, "42", "call2", to_tag.as_str()))
        .await;

    let record = tokio::time::timeout(Duration::from_secs(5), pbx.cdr_rx.recv())
        .await
        .expect("CDR in time")
        .expect("CDR emitted");

    assert_eq!(record.disposition, Disposition::Failed);
    assert_eq!(record.hangup_cause, "no_route");
}

/// An inbound number resolves to its target extension
#[tokio::test]
async fn inbound_number_resolves_to_extension() {
    let mut pbx = start_pbx(CONFIG).await;
    let phone = TestPhone::connect(pbx.server.udp_addr).await;

    phone
        .send(&invite_message(&phone, "+15551234567", "call3"))
        .await;

    // resolves to extension 100, which has no bindings: 480, not 404
    phone
        .recv_status(StatusCode::TEMPORARILY_UNAVAILABLE)
        .await;

    let record = tokio::time::timeout(Duration::from_secs(5), pbx.cdr_rx.recv())
        .await
        .expect("CDR in time")
        .expect("CDR emitted");

    assert!(record
        .flow_path
        .iter()
        .any(|node| node == "extension:100"));
}

/// A caller that is neither a trunk nor authenticated gets challenged
#[tokio::test]
async fn unknown_caller_is_challenged_or_rejected() {
    let config_without_trunk = r#"
[sip]
domain = "pbx.test"
bind_udp = "127.0.0.1:0"
bind_tcp = "127.0.0.1:0"

[[extension]]
number = "100"
password = "hunter2"
"#;

    let pbx = start_pbx(config_without_trunk).await;
    let phone = TestPhone::connect(pbx.server.udp_addr).await;

    // From names a configured extension but carries no credentials
    let message = format!(
        "INVITE sip:100@pbx.test SIP/2.0\r\n\
         Via: SIP/2.0/UDP {local};branch=z9hG4bKauth1\r\n\
         Max-Forwards: 70\r\n\
         From: <sip:100@pbx.test>;tag=selfcall\r\n\
         To: <sip:100@pbx.test>\r\n\
         Call-ID: auth-check@{local}\r\n\
         CSeq: 1 INVITE\r\n\
         Contact: <sip:100@{local}>\r\n\
         Content-Length: 0\r\n\r\n",
        local = phone.local,
    );

    phone.send(&message).await;

    let (headers, _) = phone.recv_status(StatusCode::UNAUTHORIZED).await;
    assert!(headers.contains(&Name::WWW_AUTHENTICATE));
}
