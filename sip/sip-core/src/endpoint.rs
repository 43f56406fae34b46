use crate::trace::{MessageTracer, TraceDirection};
use crate::transaction::{
    Delivery, InviteClientTx, InviteServerTx, NonInviteClientTx, ServerTx, TimerConfig,
    TransactionRegistry, TxKey, TxMessage,
};
use crate::transport::{
    Factory, OutgoingParts, OutgoingRequest, OutgoingResponse, ReceivedMessage,
    TargetTransportInfo, TpHandle, Transports, TransportsBuilder,
};
use crate::{BaseHeaders, IncomingRequest, Layer, MayClaim, Request, Response, Result};
use bytes::{Bytes, BytesMut};
use bytesstr::BytesStr;
use sip_types::header::typed::{Allow, Supported, Via};
use sip_types::host::HostPort;
use sip_types::msg::{MessageLine, StatusLine};
use sip_types::uri::SipUri;
use sip_types::{Headers, Method, Name, StatusCode};
use std::any::type_name;
use std::fmt::Write;
use std::mem::take;
use std::net::SocketAddr;
use std::sync::Arc;
use std::{fmt, io};
use tokio::sync::broadcast;

/// The endpoint ties the transports, the transaction registry, the tracer
/// and the application layers together.
///
/// It is a cheap-to-clone `Arc` wrapper. It must never be stored inside one
/// of its own layers, that would be a reference cycle.
#[derive(Clone)]
pub struct Endpoint {
    shared: Arc<Shared>,
}

struct Shared {
    transactions: TransactionRegistry,
    transports: Transports,
    tracer: MessageTracer,
    timers: TimerConfig,

    // capabilities advertised in Allow/Supported
    allow: Vec<Allow>,
    supported: Vec<Supported>,

    layers: Box<[Box<dyn Layer>]>,
}

impl fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Endpoint")
            .field("refcount", &Arc::strong_count(&self.shared))
            .finish_non_exhaustive()
    }
}

/// Outcome of the synchronous part of message intake
enum Intake {
    /// Consumed (by a transaction) or dropped (unparseable / orphaned)
    Settled,
    /// A request no transaction owns; offer it to the layers
    Offer(IncomingRequest),
}

impl Endpoint {
    pub fn builder() -> EndpointBuilder {
        EndpointBuilder::new()
    }

    // ==== capabilities & configuration ====

    /// All methods this endpoint advertises in Allow
    pub fn allowed(&self) -> &Vec<Allow> {
        &self.shared.allow
    }

    /// All extensions this endpoint advertises in Supported
    pub fn supported(&self) -> &Vec<Supported> {
        &self.shared.supported
    }

    /// The transaction timer configuration (T1/T2/T4)
    pub fn timers(&self) -> &TimerConfig {
        &self.shared.timers
    }

    pub fn tracer(&self) -> &MessageTracer {
        &self.shared.tracer
    }

    /// Access a layer inside the endpoint.
    ///
    /// Panics if the layer does not exist.
    pub fn layer<L: Layer>(&self) -> &L {
        self.shared
            .layers
            .iter()
            .find_map(|l| l.downcast_ref())
            .unwrap_or_else(|| panic!("endpoint is missing layer {}", type_name::<L>()))
    }

    // ==== building outbound messages ====

    /// Create a Via header for the given transport and transaction key
    pub fn create_via(
        &self,
        transport: &TpHandle,
        tx_key: &TxKey,
        via_host_port: Option<HostPort>,
    ) -> Via {
        Via::new(
            transport.name(),
            via_host_port.unwrap_or_else(|| transport.sent_by().into()),
            tx_key.branch().clone(),
        )
    }

    /// Create a Via header with a freshly generated branch, for requests sent
    /// outside any transaction (the ACK to a 2xx)
    pub fn create_standalone_via(
        &self,
        transport: &TpHandle,
        via_host_port: Option<HostPort>,
    ) -> Via {
        Via::new(
            transport.name(),
            via_host_port.unwrap_or_else(|| transport.sent_by().into()),
            crate::transaction::generate_branch(),
        )
    }

    /// Create a response to an incoming request, mirroring the dialog
    /// identifying headers and routing it per the topmost Via
    pub fn create_response(
        &self,
        request: &IncomingRequest,
        code: StatusCode,
        reason: Option<BytesStr>,
    ) -> OutgoingResponse {
        assert_ne!(request.line.method, Method::ACK);

        let mut headers = mirror_identity(request);

        if code == StatusCode::TRYING {
            request.headers.clone_into(&mut headers, Name::TIMESTAMP);
        }

        OutgoingResponse {
            msg: Response {
                line: StatusLine { code, reason },
                headers,
                body: Bytes::new(),
            },
            parts: OutgoingParts {
                transport: request.tp_info.transport.clone(),
                destination: response_target(request),
                buffer: Default::default(),
            },
        }
    }

    /// Resolve the target of a request and wrap it for sending
    pub async fn create_outgoing(
        &self,
        request: Request,
        target: &mut TargetTransportInfo,
    ) -> Result<OutgoingRequest> {
        let (transport, destination) = match &target.transport {
            Some((transport, destination)) => (transport.clone(), *destination),
            None => {
                let selected = self.select_transport(&request.line.uri).await?;
                target.transport = Some(selected.clone());
                selected
            }
        };

        Ok(OutgoingRequest {
            msg: request,
            parts: OutgoingParts {
                transport,
                destination,
                buffer: Default::default(),
            },
        })
    }

    /// Find or create a suitable transport for the URI, returning the
    /// resolved remote address
    pub async fn select_transport(&self, uri: &SipUri) -> Result<(TpHandle, SocketAddr)> {
        self.transports().select(self, uri).await
    }

    // ==== transactions ====

    /// Send an INVITE and return the client transaction driving it
    pub async fn send_invite(
        &self,
        request: Request,
        target: &mut TargetTransportInfo,
    ) -> Result<InviteClientTx> {
        InviteClientTx::send(self.clone(), request, target).await
    }

    /// Send a non-INVITE request and return the client transaction driving it
    pub async fn send_request(
        &self,
        request: Request,
        target: &mut TargetTransportInfo,
    ) -> Result<NonInviteClientTx> {
        NonInviteClientTx::send(self.clone(), request, target).await
    }

    /// Create a server transaction to respond to a non-INVITE request
    pub fn create_server_tx(&self, request: &mut IncomingRequest) -> ServerTx {
        ServerTx::new(request)
    }

    /// Create a server INVITE transaction to respond to an INVITE
    pub fn create_invite_server_tx(&self, request: &mut IncomingRequest) -> InviteServerTx {
        InviteServerTx::new(request)
    }

    // ==== sending ====

    /// Print the request to its buffer (if needed) and send it
    pub async fn send_outgoing_request(&self, message: &mut OutgoingRequest) -> io::Result<()> {
        if message.parts.buffer.is_empty() {
            message
                .msg
                .headers
                .set(Name::CONTENT_LENGTH, message.msg.body.len().to_string());

            message.parts.buffer =
                print_message(&message.msg.line, &message.msg.headers, &message.msg.body)?;
        }

        self.transmit(&message.parts).await
    }

    /// Print the response to its buffer (if needed) and send it
    pub async fn send_outgoing_response(&self, message: &mut OutgoingResponse) -> io::Result<()> {
        if message.parts.buffer.is_empty() {
            message
                .msg
                .headers
                .set(Name::CONTENT_LENGTH, message.msg.body.len().to_string());

            message.parts.buffer =
                print_message(&message.msg.line, &message.msg.headers, &message.msg.body)?;
        }

        self.transmit(&message.parts).await
    }

    async fn transmit(&self, parts: &OutgoingParts) -> io::Result<()> {
        self.shared.tracer.trace(
            TraceDirection::Outbound,
            parts.destination,
            parts.transport.name(),
            &parts.buffer,
        );

        parts.transport.send(&parts.buffer, parts.destination).await
    }

    // ==== receiving ====

    /// Hand a received message to the endpoint for processing.
    ///
    /// Spawns a task which routes the message into its transaction, or
    /// offers it to the layer stack when no transaction claims it.
    pub fn receive(&self, message: ReceivedMessage) {
        tokio::spawn(self.clone().process(message));
    }

    #[tracing::instrument(level = "debug", skip_all, fields(message = %message))]
    async fn process(self, message: ReceivedMessage) {
        self.shared.tracer.trace(
            TraceDirection::Inbound,
            message.tp_info.source,
            message.tp_info.transport.name(),
            &message.tp_info.buffer,
        );

        match self.intake(message) {
            Intake::Settled => {}
            Intake::Offer(request) => self.offer_to_layers(request).await,
        }
    }

    /// Synchronous intake: validate, normalize, and try transaction routing.
    ///
    /// Responses that match no transaction are orphans and die here;
    /// requests come back out so the layers can claim them.
    fn intake(&self, message: ReceivedMessage) -> Intake {
        let ReceivedMessage {
            tp_info,
            line,
            headers,
            body,
        } = message;

        let mut base_headers = match BaseHeaders::extract_from(&headers) {
            Ok(base_headers) => base_headers,
            Err(e) => {
                log::warn!("message from {} lacks valid base headers: {e}", tp_info.source);
                return Intake::Settled;
            }
        };

        let is_request = line.is_request();

        if is_request {
            // RFC 3581: make the topmost Via reflect where the request
            // really came from, so responses can travel back
            normalize_via(&mut base_headers.via[0], tp_info.source);
        }

        let tx_key = match TxKey::from_message_parts(&line, &base_headers) {
            Ok(tx_key) => tx_key,
            Err(e) => {
                log::warn!("cannot key message from {}: {e}", tp_info.source);
                return Intake::Settled;
            }
        };

        let tx_message = TxMessage {
            tp_info,
            line,
            base_headers,
            headers,
            body,
        };

        let delivery =
            self.transactions()
                .deliver(self, &tx_key, tx_message, is_request);

        let (inbox, rejected) = match delivery {
            Delivery::Done => return Intake::Settled,
            Delivery::Unmatched => {
                log::debug!("dropping orphaned response for {tx_key}");
                return Intake::Settled;
            }
            Delivery::Opened(inbox, message) => (Some(inbox), message),
            Delivery::Refused(message) => (None, message),
        };

        // only requests reach this point; Unmatched covers responses
        let TxMessage {
            tp_info,
            line: MessageLine::Request(request_line),
            base_headers,
            headers,
            body,
        } = rejected
        else {
            log::debug!("transaction {tx_key} turned away a response, dropping it");
            return Intake::Settled;
        };

        Intake::Offer(IncomingRequest {
            tp_info,
            tx_key,
            inbox,
            line: request_line,
            base_headers,
            headers,
            body,
        })
    }

    /// Offer an unclaimed request to each layer in insertion order; whatever
    /// nobody wants is answered 481
    async fn offer_to_layers(&self, request: IncomingRequest) {
        let mut slot = Some(request);

        for layer in self.shared.layers.iter() {
            log::trace!("offering request to layer {}", layer.name());

            layer.receive(self, MayClaim::new(&mut slot)).await;

            if slot.is_none() {
                return;
            }
        }

        let request = slot.expect("loop exits early once claimed");

        log::debug!("no layer claimed {}, rejecting", request.line.method);

        if let Err(e) = self.reject_unmatched(request).await {
            log::error!("failed to reject unclaimed request: {e:?}");
        }
    }

    async fn reject_unmatched(&self, mut request: IncomingRequest) -> Result<()> {
        // an unmatched ACK has nothing to acknowledge and nothing to answer
        if request.line.method == Method::ACK {
            return Ok(());
        }

        let response = self.create_response(
            &request,
            StatusCode::CALL_OR_TRANSACTION_DOES_NOT_EXIST,
            None,
        );

        if request.line.method == Method::INVITE {
            self.create_invite_server_tx(&mut request)
                .respond_failure(response)
                .await
        } else {
            self.create_server_tx(&mut request).respond(response).await
        }
    }

    pub(crate) fn transactions(&self) -> &TransactionRegistry {
        &self.shared.transactions
    }

    pub(crate) fn transports(&self) -> &Transports {
        &self.shared.transports
    }
}

/// Print a message head plus body into a send buffer
fn print_message(
    line: &dyn fmt::Display,
    headers: &Headers,
    body: &Bytes,
) -> io::Result<Bytes> {
    let mut buffer = BytesMut::new();

    write!(buffer, "{line}\r\n{headers}\r\n").map_err(io::Error::other)?;
    buffer.extend_from_slice(body);

    Ok(buffer.freeze())
}

/// Copy the headers a response must mirror from its request
fn mirror_identity(request: &IncomingRequest) -> Headers {
    let base = &request.base_headers;

    let mut headers = Headers::with_capacity(4 + base.via.len());

    for via in &base.via {
        headers.insert_typed(via);
    }

    headers.insert_typed(&base.from);
    headers.insert_typed_named(Name::TO, &base.to);
    headers.insert_typed(&base.call_id);
    headers.insert_typed(&base.cseq);

    headers
}

/// Where a response to this request must be sent (RFC 3261 §18.2.2 +
/// RFC 3581)
fn response_target(request: &IncomingRequest) -> SocketAddr {
    // connection oriented transports answer on the same connection
    if let Some(remote) = request.tp_info.transport.remote_addr() {
        return remote;
    }

    let via = &request.base_headers.via[0];
    let source = request.tp_info.source;

    // multicast responses go to maddr
    if let Some(maddr) = via
        .params
        .get_val("maddr")
        .and_then(|v| v.parse().ok())
    {
        return SocketAddr::new(maddr, via.sent_by.port.unwrap_or(5060));
    }

    // a filled-in rport overrides the source port
    match via.params.get_val("rport").and_then(|v| v.parse().ok()) {
        Some(rport) => SocketAddr::new(source.ip(), rport),
        None => source,
    }
}

/// Stamp `received`/`rport` on the topmost Via when the sent-by address does
/// not hold up against the actual source
fn normalize_via(via: &mut Via, source: SocketAddr) {
    if via.params.contains("rport") {
        via.params.push_or_edit("rport", source.port().to_string());
    }

    let sent_by_matches = via.sent_by.ip() == Some(source.ip());

    if !sent_by_matches {
        via.params.push_or_edit("received", source.ip().to_string());
    }
}

/// Builder for [`Endpoint`]
pub struct EndpointBuilder {
    transports: TransportsBuilder,
    timers: TimerConfig,
    tracer: Option<MessageTracer>,

    allow: Vec<Allow>,
    supported: Vec<Supported>,

    layers: Vec<Box<dyn Layer>>,

    /// Transport tasks wait on this channel for the built endpoint
    ready_tx: broadcast::Sender<Endpoint>,
}

impl Default for EndpointBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl EndpointBuilder {
    pub fn new() -> Self {
        let (ready_tx, _) = broadcast::channel(1);

        Self {
            transports: Default::default(),
            timers: TimerConfig::default(),
            tracer: None,
            allow: vec![],
            supported: vec![],
            layers: vec![],
            ready_tx,
        }
    }

    /// Advertise a method in the Allow header
    pub fn add_allow(&mut self, allowed: Method) {
        self.allow.push(Allow(allowed));
    }

    /// Advertise an extension in the Supported header
    pub fn add_supported<S>(&mut self, supported: S)
    where
        S: Into<BytesStr>,
    {
        self.supported.push(Supported(supported.into()));
    }

    /// Add a connectionless transport which never vanishes (UDP)
    pub fn add_unmanaged_transport(&mut self, transport: TpHandle) -> &mut Self {
        self.transports.insert_unmanaged(transport);
        self
    }

    /// Add a factory creating connection oriented transports
    pub fn add_transport_factory(&mut self, factory: Arc<dyn Factory>) -> &mut Self {
        self.transports.insert_factory(factory);
        self
    }

    /// Override the system DNS resolver
    pub fn set_dns_resolver(&mut self, dns_resolver: hickory_resolver::TokioResolver) {
        self.transports.set_dns_resolver(dns_resolver)
    }

    /// Cap the number of cached outbound connections
    pub fn set_max_connections(&mut self, max_connections: usize) {
        self.transports.set_max_connections(max_connections)
    }

    /// Override the transaction timer configuration
    pub fn set_timers(&mut self, timers: TimerConfig) {
        self.timers = timers;
    }

    /// Install the message tracer
    pub fn set_tracer(&mut self, tracer: MessageTracer) {
        self.tracer = Some(tracer);
    }

    /// Add a [`Layer`] implementation.
    ///
    /// Insertion order is the order layers see incoming requests.
    pub fn add_layer<L>(&mut self, layer: L)
    where
        L: Layer,
    {
        self.layers.push(Box::new(layer));
    }

    /// Subscribe to the creation of the endpoint.
    ///
    /// Transport tasks wait on this channel before processing traffic; it
    /// errors when the builder is dropped without building.
    pub fn subscribe(&self) -> broadcast::Receiver<Endpoint> {
        self.ready_tx.subscribe()
    }

    /// Complete building the endpoint
    pub fn build(&mut self) -> Endpoint {
        // layers get a chance to register capabilities before assembly
        let mut layers = take(&mut self.layers).into_boxed_slice();
        for layer in layers.iter_mut() {
            layer.init(self);
        }

        let endpoint = Endpoint {
            shared: Arc::new(Shared {
                transactions: Default::default(),
                transports: self.transports.build(),
                tracer: self.tracer.take().unwrap_or_else(MessageTracer::disabled),
                timers: self.timers,
                allow: take(&mut self.allow),
                supported: take(&mut self.supported),
                layers,
            }),
        };

        endpoint.transports().spawn_idle_reaper();

        // wake every transport task waiting for the endpoint
        let _ = self.ready_tx.send(endpoint.clone());

        endpoint
    }
}
