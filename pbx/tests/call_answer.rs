//! Full call setup and teardown: a trunk call rings a registered phone, the
//! phone answers, the call is bridged and ends with a BYE.

mod common;

use common::{TestPhone, register_extension, start_pbx};
use flowpbx::cdr::Disposition;
use sip_types::header::typed::{CSeq, Contact, FromTo};
use sip_types::msg::{MessageLine, ParsedMessage};
use sip_types::{Headers, Method, Name, StatusCode};
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
"#;

const CALLER_SDP: &str = "v=0\r\no=- 1 1 IN IP4 127.0.0.1\r\ns=-\r\nc=IN IP4 127.0.0.1\r\nt=0 0\r\nm=audio 30000 RTP/AVP 0\r\na=rtpmap:0 PCMU/8000\r\n";
const CALLEE_SDP: &str = "v=0\r\no=- 2 2 IN IP4 127.0.0.1\r\ns=-\r\nc=IN IP4 127.0.0.1\r\nt=0 0\r\nm=audio 31000 RTP/AVP 0\r\na=rtpmap:0 PCMU/8000\r\n";

/// Echo the dialog identifying headers of a request into a response, adding
/// a To tag when asked
fn respond_to(request: &ParsedMessage, status: &str, to_tag: Option<&str>, extra: &str) -> String {
    let mut echoed = String::new();

    for name in [Name::VIA, Name::FROM, Name::CALL_ID, Name::CSEQ] {
        for value in request.headers.get_all(&name) {
            echoed.push_str(&format!("{}: {}\r\n", name.as_print_str(), value));
        }
    }

    let to_value = request
        .headers
        .get(&Name::TO)
        .expect("request carries To")
        .to_string();

    match to_tag {
        Some(tag) if !to_value.contains("tag=") => {
            echoed.push_str(&format!("To: {to_value};tag={tag}\r\n"));
        }
        _ => {
            echoed.push_str(&format!("To: {to_value}\r\n"));
        }
    }

    format!("SIP/2.0 {status}\r\n{echoed}{extra}")
}

#[tokio::test]
async fn basic_inbound_call_is_answered_and_torn_down() {
    let mut pbx = start_pbx(CONFIG).await;

    // the callee's phone registers extension 100
    let callee = TestPhone::connect(pbx.server.udp_addr).await;
    register_extension(&callee, "100", "hunter2").await;

    // the trunk side places a call to 100
    let caller = TestPhone::connect(pbx.server.udp_addr).await;

    let invite = format!(
        "INVITE sip:100@pbx.test SIP/2.0\r\n\
         Via: SIP/2.0/UDP {local};branch=z9hG4bKanswer1\r\n\
         Max-Forwards: 70\r\n\
         From: <sip:+15557770000@carrier.example>;tag=callerleg\r\n\
         To: <sip:100@pbx.test>\r\n\
         Call-ID: answer-flow@{local}\r\n\
         CSeq: 1 INVITE\r\n\
         Contact: <sip:+15557770000@{local}>\r\n\
         Content-Type: application/sdp\r\n\
         Content-Length: {len}\r\n\r\n{CALLER_SDP}",
        local = caller.local,
        len = CALLER_SDP.len(),
    );

    caller.send(&invite).await;

    // the phone is rung
    let rung = callee.recv().await;
    let MessageLine::Request(line) = &rung.line else {
        panic!("expected the INVITE towards the phone");
    };
    assert_eq!(line.method, Method::INVITE);
    assert!(!rung.body.is_empty(), "branch INVITE carries the relay SDP");

    // phone: 180 Ringing, then 200 with its answer SDP
    callee
        .send(&respond_to(
            &rung,
            "180 Ringing",
            Some("calleetag"),
            &format!("Contact: <sip:100@{}>\r\nContent-Length: 0\r\n\r\n", callee.local),
        ))
        .await;

    // the caller sees 100 Trying and the forwarded ringing
    caller.recv_status(StatusCode::TRYING).await;
    caller.recv_status(StatusCode::RINGING).await;

    callee
        .send(&respond_to(
            &rung,
            "200 OK",
            Some("calleetag"),
            &format!(
                "Contact: <sip:100@{}>\r\nContent-Type: application/sdp\r\nContent-Length: {}\r\n\r\n{CALLEE_SDP}",
                callee.local,
                CALLEE_SDP.len(),
            ),
        ))
        .await;

    // the phone's 200 is acknowledged by the server
    let ack = callee.recv().await;
    let MessageLine::Request(line) = &ack.line else {
        panic!("expected the ACK towards the phone");
    };
    assert_eq!(line.method, Method::ACK);

    // the caller is answered with the relay SDP
    let (ok_headers, ok_body) = caller.recv_status(StatusCode::OK).await;
    assert!(!ok_body.is_empty(), "answer carries the relay SDP");

    let to: FromTo = ok_headers.typed_named(&Name::TO).expect("To parses");
    let to_tag = to.tag.expect("200 carries a To tag");

    let contact: Contact = ok_headers.typed().expect("Contact in 200");
    assert!(contact.addr.uri.host_port.host.to_string().contains("pbx.test"));

    // complete the caller leg with an ACK
    let caller_ack = format!(
        "ACK sip:100@pbx.test SIP/2.0\r\n\
         Via: SIP/2.0/UDP {local};branch=z9hG4bKanswerack\r\n\
         Max-Forwards: 70\r\n\
         From: <sip:+15557770000@carrier.example>;tag=callerleg\r\n\
         To: <sip:100@pbx.test>;tag={to_tag}\r\n\
         Call-ID: answer-flow@{local}\r\n\
         CSeq: 1 ACK\r\n\
         Content-Length: 0\r\n\r\n",
        local = caller.local,
    );
    caller.send(&caller_ack).await;

    // let the bridge settle
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert_eq!(pbx.server.controller.active_calls(), 1);

    // the caller hangs up
    let bye = format!(
        "BYE sip:100@pbx.test SIP/2.0\r\n\
         Via: SIP/2.0/UDP {local};branch=z9hG4bKanswerbye\r\n\
         Max-Forwards: 70\r\n\
         From: <sip:+15557770000@carrier.example>;tag=callerleg\r\n\
         To: <sip:100@pbx.test>;tag={to_tag}\r\n\
         Call-ID: answer-flow@{local}\r\n\
         CSeq: 2 BYE\r\n\
         Content-Length: 0\r\n\r\n",
        local = caller.local,
    );
    caller.send(&bye).await;

    // the BYE is confirmed and the far leg is torn down
    caller.recv_status(StatusCode::OK).await;

    let far_bye = callee.recv().await;
    let MessageLine::Request(line) = &far_bye.line else {
        panic!("expected the BYE towards the phone");
    };
    assert_eq!(line.method, Method::BYE);

    callee
        .send(&respond_to(&far_bye, "200 OK", None, "Content-Length: 0\r\n\r\n"))
        .await;

    // the call ends answered
    let record = tokio::time::timeout(Duration::from_secs(5), pbx.cdr_rx.recv())
        .await
        .expect("CDR in time")
        .expect("CDR emitted");

    assert_eq!(record.disposition, Disposition::Answered);
    assert!(record.answer_time.is_some());
    assert_eq!(record.hangup_cause, "normal_clearing");

    verify_cseq_sanity(&ack.headers);
}

/// The ACK towards the phone must carry the INVITE's sequence number
fn verify_cseq_sanity(headers: &Headers) {
    let cseq: CSeq = headers.typed().expect("CSeq in ACK");
    assert_eq!(cseq.method, Method::ACK);
}
