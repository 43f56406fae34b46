//! End-to-end exchange between two endpoints over loopback UDP.

use flowpbx_sip_core::transaction::TimerConfig;
use flowpbx_sip_core::transport::{TargetTransportInfo, udp::Udp};
use flowpbx_sip_core::{Endpoint, IncomingRequest, Layer, MayClaim, Request};
use sip_types::header::typed::{CSeq, CallID, FromTo};
use sip_types::uri::{NameAddr, SipUri};
use sip_types::{Method, Name, StatusCode};
use std::net::SocketAddr;
use std::time::Duration;

/// Answers every OPTIONS request with 200
struct OptionsResponder;

#[async_trait::async_trait]
impl Layer for OptionsResponder {
    fn name(&self) -> &'static str {
        "options-responder"
    }

    async fn receive(&self, endpoint: &Endpoint, request: MayClaim<'_, IncomingRequest>) {
        if request.line.method != Method::OPTIONS {
            return;
        }

        let mut request = request.claim();

        let response = endpoint.create_response(&request, StatusCode::OK, None);
        let tx = endpoint.create_server_tx(&mut request);

        tx.respond(response).await.expect("response goes out");
    }
}

async fn spawn_endpoint(with_responder: bool) -> (Endpoint, SocketAddr) {
    let mut builder = Endpoint::builder();

    if with_responder {
        builder.add_layer(OptionsResponder);
    }

    let handle = Udp::spawn(&mut builder, "127.0.0.1:0")
        .await
        .expect("bind loopback");

    (builder.build(), handle.bound())
}

fn options_request(target: SocketAddr) -> Request {
    let uri: SipUri = format!("sip:{target}").parse().expect("valid uri");

    let mut request = Request::new(Method::OPTIONS, uri.clone());

    request.headers.insert_typed(&FromTo::new(
        NameAddr::uri("sip:test@127.0.0.1".parse().expect("valid uri")),
        Some("abc123".into()),
    ));
    request
        .headers
        .insert_typed_named(Name::TO, &FromTo::new(NameAddr::uri(uri), None));
    request
        .headers
        .insert_typed(&CallID::new("options-exchange-test"));
    request
        .headers
        .insert_typed(&CSeq::new(1, Method::OPTIONS));

    request
}

#[tokio::test]
async fn options_round_trip() {
    let (_server, server_addr) = spawn_endpoint(true).await;
    let (client, _) = spawn_endpoint(false).await;

    let mut target = TargetTransportInfo::default();

    let mut tx = client
        .send_request(options_request(server_addr), &mut target)
        .await
        .expect("request sent");

    let response = tx.receive_final().await.expect("final response");

    assert_eq!(response.line.code, StatusCode::OK);
}

#[tokio::test]
async fn unanswered_request_times_out() {
    // a socket that never answers
    let sink = tokio::net::UdpSocket::bind("127.0.0.1:0")
        .await
        .expect("bind sink");
    let sink_addr = sink.local_addr().expect("local addr");

    let mut builder = Endpoint::builder();

    // shrink the timers so timer F fires quickly
    builder.set_timers(TimerConfig {
        t1: Duration::from_millis(10),
        t2: Duration::from_millis(40),
        t4: Duration::from_millis(50),
    });

    Udp::spawn(&mut builder, "127.0.0.1:0")
        .await
        .expect("bind loopback");

    let client = builder.build();

    let mut target = TargetTransportInfo::default();

    let mut tx = client
        .send_request(options_request(sink_addr), &mut target)
        .await
        .expect("request sent");

    let result = tx.receive_final().await;

    assert!(matches!(result, Err(flowpbx_sip_core::Error::RequestTimedOut)));
}

#[tokio::test]
async fn retransmitted_request_reuses_the_transaction() {
    // the responder endpoint sees each branch only once; a retransmission of
    // the same message must be absorbed by the existing transaction and
    // answered with the same response, not create a second one
    let (_server, server_addr) = spawn_endpoint(true).await;

    let socket = tokio::net::UdpSocket::bind("127.0.0.1:0")
        .await
        .expect("bind client");
    let local = socket.local_addr().expect("local addr");

    let raw = format!(
        "OPTIONS sip:{server_addr} SIP/2.0\r\n\
         Via: SIP/2.0/UDP {local};branch=z9hG4bKretest1\r\n\
         Max-Forwards: 70\r\n\
         From: <sip:test@{local}>;tag=retrans\r\n\
         To: <sip:{server_addr}>\r\n\
         Call-ID: retransmission-test\r\n\
         CSeq: 1 OPTIONS\r\n\
         Content-Length: 0\r\n\r\n"
    );

    socket
        .send_to(raw.as_bytes(), server_addr)
        .await
        .expect("send");
    socket
        .send_to(raw.as_bytes(), server_addr)
        .await
        .expect("send again");

    let mut seen = 0;
    let mut buffer = vec![0u8; 4096];

    // both the original and the retransmission are answered with 200
    for _ in 0..2 {
        let received = tokio::time::timeout(
            Duration::from_secs(2),
            socket.recv_from(&mut buffer),
        )
        .await
        .expect("response arrives")
        .expect("recv ok");

        let text = std::str::from_utf8(&buffer[..received.0]).expect("utf8");
        assert!(text.starts_with("SIP/2.0 200"), "got: {text}");
        seen += 1;
    }

    assert_eq!(seen, 2);
}
