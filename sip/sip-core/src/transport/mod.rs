//! Transport multiplexer: one shared UDP socket plus cached TCP/TLS
//! connections behind a common [`Transport`] seam.

use crate::{Endpoint, Request, Response, Result};
use bytes::Bytes;
use parking_lot::Mutex;
use sip_types::host::{Host, HostPort};
use sip_types::msg::MessageLine;
use sip_types::uri::SipUri;
use sip_types::Headers;
use std::collections::HashMap;
use std::fmt::{self, Debug, Display};
use std::mem::take;
use std::net::SocketAddr;
use std::ops::Deref;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use std::io;
use tokio::time::Instant;

mod parse;
mod resolver;
pub mod streaming;
pub mod tcp;
#[cfg(feature = "tls-rustls")]
pub mod tls;
pub mod udp;

/// Dial timeout for outbound stream connections
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Cached connections are closed after this long without traffic
pub const IDLE_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Creates connection oriented transports for outbound targets
#[async_trait::async_trait]
pub trait Factory: Send + Sync + 'static {
    /// Name of the transport this factory produces (e.g. TCP, TLS)
    fn name(&self) -> &'static str;

    /// Whether the produced transport is secure
    fn secure(&self) -> bool;

    /// Connect a new transport to `addr`
    async fn create(&self, endpoint: Endpoint, addr: SocketAddr) -> io::Result<TpHandle>;
}

/// A single transport (the UDP socket or one stream connection)
#[async_trait::async_trait]
pub trait Transport: Debug + Display + Send + Sync + 'static {
    /// Name of the transport (e.g. UDP, TCP, TLS), printed into Via
    fn name(&self) -> &'static str;

    fn secure(&self) -> bool;

    /// Reliable transports skip the retransmission timers
    fn reliable(&self) -> bool;

    /// Local address of the transport
    fn bound(&self) -> SocketAddr;

    /// Address peers can reach this endpoint at (the listener address)
    fn sent_by(&self) -> SocketAddr;

    fn direction(&self) -> Direction;

    /// The peer of a connection oriented transport, `None` for datagrams
    fn remote_addr(&self) -> Option<SocketAddr> {
        match self.direction() {
            Direction::None => None,
            Direction::Outgoing(remote) | Direction::Incoming(remote) => Some(remote),
        }
    }

    /// Send `message` to `target`; stream transports ignore the target
    async fn send(&self, message: &[u8], target: SocketAddr) -> io::Result<()>;
}

/// Cheap cloneable handle over a transport
#[derive(Debug, Clone)]
pub struct TpHandle(Arc<dyn Transport>);

impl TpHandle {
    pub fn new<T: Transport>(transport: T) -> Self {
        Self(Arc::new(transport))
    }

    pub(crate) fn key(&self) -> TpKey {
        TpKey {
            name: self.0.name(),
            bound: self.0.bound(),
            direction: self.0.direction(),
        }
    }
}

impl Deref for TpHandle {
    type Target = dyn Transport;

    fn deref(&self) -> &Self::Target {
        &*self.0
    }
}

impl PartialEq for TpHandle {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl fmt::Display for TpHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0.direction() {
            Direction::None => write!(f, "{}", self.0),
            Direction::Outgoing(_) => write!(f, "outgoing:{}", self.0),
            Direction::Incoming(_) => write!(f, "incoming:{}", self.0),
        }
    }
}

/// Direction of a transport
#[derive(Debug, Copy, Clone, Ord, PartialOrd, Eq, PartialEq, Hash)]
pub enum Direction {
    /// Datagram based, no connection direction (UDP)
    None,
    /// Connection established by this endpoint
    Outgoing(SocketAddr),
    /// Connection accepted by this endpoint
    Incoming(SocketAddr),
}

/// Identifies a transport instance
#[derive(Debug, Copy, Clone, Ord, PartialOrd, Eq, PartialEq, Hash)]
pub(crate) struct TpKey {
    pub(crate) name: &'static str,
    pub(crate) bound: SocketAddr,
    pub(crate) direction: Direction,
}

/// Resolved transport target cached between requests to the same peer.
///
/// Also carries an optional Via host-port override for NAT rewriting.
#[derive(Debug, Default, Clone)]
pub struct TargetTransportInfo {
    /// Optional host-port to use in the Via header
    pub via_host_port: Option<HostPort>,

    /// Transport and remote address to send requests to. Resolved from the
    /// request URI when unset.
    pub transport: Option<(TpHandle, SocketAddr)>,
}

/// Transport related info attached to a received message
#[derive(Debug)]
pub struct MessageTpInfo {
    /// Arrival timestamp, preserved for CDR start times
    pub timestamp: SystemTime,

    pub source: SocketAddr,

    /// The complete buffer containing the message
    pub buffer: Bytes,

    pub transport: TpHandle,
}

/// Message received directly from a transport
pub struct ReceivedMessage {
    pub tp_info: MessageTpInfo,

    pub line: MessageLine,

    /// All headers, neither parsed nor validated
    pub headers: Headers,

    pub body: Bytes,
}

impl ReceivedMessage {
    pub fn new(
        source: SocketAddr,
        buffer: Bytes,
        transport: TpHandle,
        line: MessageLine,
        headers: Headers,
        body: Bytes,
    ) -> Self {
        Self {
            tp_info: MessageTpInfo {
                timestamp: SystemTime::now(),
                source,
                buffer,
                transport,
            },
            line,
            headers,
            body,
        }
    }
}

impl fmt::Display for ReceivedMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.line)
    }
}

#[derive(Debug, Clone)]
pub struct OutgoingRequest {
    pub msg: Request,
    pub parts: OutgoingParts,
}

#[derive(Debug, Clone)]
pub struct OutgoingResponse {
    pub msg: Response,
    pub parts: OutgoingParts,
}

#[derive(Debug, Clone)]
pub struct OutgoingParts {
    /// Transport the message will be sent with
    pub transport: TpHandle,

    /// Address the message will be sent to
    pub destination: SocketAddr,

    /// Buffer the message got printed into
    pub buffer: Bytes,
}

struct CachedConn {
    handle: TpHandle,
    last_used: Instant,
    reader: tokio::task::AbortHandle,
}

/// Cache of established stream connections keyed by (proto, remote)
pub(crate) struct ConnectionCache {
    max_connections: usize,
    map: Mutex<HashMap<(&'static str, SocketAddr), CachedConn>>,
}

impl ConnectionCache {
    fn new(max_connections: usize) -> Self {
        Self {
            max_connections,
            map: Mutex::new(HashMap::new()),
        }
    }

    /// Insert a connection, evicting the least recently used entry when the
    /// cache is at capacity
    pub(crate) fn insert(
        &self,
        remote: SocketAddr,
        handle: TpHandle,
        reader: tokio::task::AbortHandle,
    ) {
        let mut map = self.map.lock();

        if map.len() >= self.max_connections {
            if let Some(oldest) = map
                .iter()
                .min_by_key(|(_, conn)| conn.last_used)
                .map(|(key, _)| *key)
            {
                if let Some(evicted) = map.remove(&oldest) {
                    log::debug!("connection cache full, evicting {}", evicted.handle);
                    evicted.reader.abort();
                }
            }
        }

        map.insert(
            (handle.name(), remote),
            CachedConn {
                handle,
                last_used: Instant::now(),
                reader,
            },
        );
    }

    pub(crate) fn get(&self, name: &'static str, remote: SocketAddr) -> Option<TpHandle> {
        let mut map = self.map.lock();

        let conn = map.get_mut(&(name, remote))?;
        conn.last_used = Instant::now();

        Some(conn.handle.clone())
    }

    pub(crate) fn remove(&self, name: &'static str, remote: SocketAddr) {
        if let Some(conn) = self.map.lock().remove(&(name, remote)) {
            conn.reader.abort();
        }
    }

    fn close_idle(&self) {
        let mut map = self.map.lock();

        map.retain(|(name, remote), conn| {
            if conn.last_used.elapsed() > IDLE_TIMEOUT {
                log::debug!("closing idle {name} connection to {remote}");
                conn.reader.abort();
                false
            } else {
                true
            }
        });
    }
}

pub(crate) struct Transports {
    unmanaged: Box<[TpHandle]>,
    factories: Box<[Arc<dyn Factory>]>,

    pub(crate) connections: Arc<ConnectionCache>,

    dns_resolver: hickory_resolver::TokioResolver,
}

impl Transports {
    async fn resolve_uri(&self, uri: &SipUri) -> io::Result<Vec<SocketAddr>> {
        let port = match uri.host_port.port {
            Some(port) => port,
            None if uri.sips => 5061,
            None => 5060,
        };

        match &uri.host_port.host {
            Host::Ip4(ip) => Ok(vec![SocketAddr::new((*ip).into(), port)]),
            Host::Ip6(ip) => Ok(vec![SocketAddr::new((*ip).into(), port)]),
            Host::Name(name) => resolver::resolve_host(&self.dns_resolver, name, port).await,
        }
    }

    /// Find or create a suitable transport for the given URI
    #[tracing::instrument(name = "select_transport", level = "trace", skip(self, endpoint))]
    pub(crate) async fn select(
        &self,
        endpoint: &Endpoint,
        uri: &SipUri,
    ) -> Result<(TpHandle, SocketAddr)> {
        let transport_name = match uri.transport_param() {
            Some(name) => name.as_str().to_ascii_uppercase(),
            None if uri.sips => "TLS".into(),
            None => "UDP".into(),
        };

        let targets = self.resolve_uri(uri).await?;

        for target in targets {
            // Connectionless transports are matched by name and address family
            if let Some(transport) = self.unmanaged.iter().find(|tp| {
                tp.name() == transport_name
                    && tp.bound().is_ipv4() == target.is_ipv4()
                    && (!uri.sips || tp.secure())
            }) {
                return Ok((transport.clone(), target));
            }

            // Reuse a cached connection to the target
            if let Some(found) = self.connections.get(
                leak_free_name(&transport_name),
                target,
            ) {
                log::trace!("reusing cached connection {found}");
                return Ok((found, target));
            }

            // Dial a new connection
            for factory in self.factories.iter() {
                if factory.name() != transport_name || (uri.sips && !factory.secure()) {
                    continue;
                }

                match factory.create(endpoint.clone(), target).await {
                    Ok(transport) => {
                        log::debug!("created new transport {transport}");
                        return Ok((transport, target));
                    }
                    Err(e) => {
                        log::debug!(
                            "failed to connect to {target} with {}: {e}",
                            factory.name()
                        );
                    }
                }
            }
        }

        Err(crate::Error::NoTransport)
    }

    /// Spawn the task closing idle cached connections
    pub(crate) fn spawn_idle_reaper(&self) {
        let connections = self.connections.clone();

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(30));

            loop {
                interval.tick().await;
                connections.close_idle();
            }
        });
    }
}

/// Map a transport name to the static str the transports use as their name
fn leak_free_name(name: &str) -> &'static str {
    match name {
        "TCP" => "TCP",
        "TLS" => "TLS",
        _ => "UDP",
    }
}

#[derive(Default)]
pub(crate) struct TransportsBuilder {
    unmanaged: Vec<TpHandle>,
    factories: Vec<Arc<dyn Factory>>,
    dns_resolver: Option<hickory_resolver::TokioResolver>,
    max_connections: Option<usize>,
}

impl TransportsBuilder {
    pub(crate) fn insert_unmanaged(&mut self, transport: TpHandle) {
        assert_eq!(transport.direction(), Direction::None);

        self.unmanaged.push(transport);
    }

    pub(crate) fn insert_factory(&mut self, factory: Arc<dyn Factory>) {
        self.factories.push(factory);
    }

    pub(crate) fn set_dns_resolver(&mut self, dns_resolver: hickory_resolver::TokioResolver) {
        self.dns_resolver = Some(dns_resolver);
    }

    pub(crate) fn set_max_connections(&mut self, max_connections: usize) {
        self.max_connections = Some(max_connections);
    }

    pub(crate) fn build(&mut self) -> Transports {
        let dns_resolver = self.dns_resolver.take().unwrap_or_else(|| {
            hickory_resolver::TokioResolver::builder_tokio()
                .expect("failed to create default system DNS resolver")
                .build()
        });

        Transports {
            unmanaged: take(&mut self.unmanaged).into_boxed_slice(),
            factories: take(&mut self.factories).into_boxed_slice(),
            connections: Arc::new(ConnectionCache::new(self.max_connections.unwrap_or(1024))),
            dns_resolver,
        }
    }
}
