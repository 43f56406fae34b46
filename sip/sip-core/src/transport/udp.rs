use crate::transport::parse::{Datagram, classify_datagram};
use crate::transport::{Direction, ReceivedMessage, TpHandle, Transport};
use crate::{Endpoint, EndpointBuilder};
use std::net::SocketAddr;
use std::sync::Arc;
use std::{fmt, io};
use tokio::net::{ToSocketAddrs, UdpSocket};
use tokio::sync::broadcast;

const UDP: &str = "UDP";

/// One datagram is one message; anything beyond a u16 length cannot be a
/// valid datagram payload anyway
const MAX_DATAGRAM: usize = u16::MAX as usize;

/// The shared UDP socket, registered as an unmanaged transport
#[derive(Debug)]
pub struct Udp {
    socket: Arc<UdpSocket>,
    bound: SocketAddr,
}

impl Udp {
    pub async fn spawn<A>(builder: &mut EndpointBuilder, addr: A) -> io::Result<TpHandle>
    where
        A: ToSocketAddrs,
    {
        let socket = Arc::new(UdpSocket::bind(addr).await?);
        let bound = socket.local_addr()?;

        log::info!("listening on udp {bound}");

        let handle = TpHandle::new(Udp {
            socket: socket.clone(),
            bound,
        });

        builder.add_unmanaged_transport(handle.clone());

        tokio::spawn(receive_loop(builder.subscribe(), socket, handle.clone()));

        Ok(handle)
    }
}

impl fmt::Display for Udp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "udp:bound={}", self.bound)
    }
}

#[async_trait::async_trait]
impl Transport for Udp {
    fn name(&self) -> &'static str {
        UDP
    }

    fn secure(&self) -> bool {
        false
    }

    fn reliable(&self) -> bool {
        false
    }

    fn bound(&self) -> SocketAddr {
        self.bound
    }

    fn sent_by(&self) -> SocketAddr {
        self.bound
    }

    fn direction(&self) -> Direction {
        Direction::None
    }

    async fn send(&self, bytes: &[u8], target: SocketAddr) -> io::Result<()> {
        self.socket.send_to(bytes, target).await.map(|_| ())
    }
}

/// Pull datagrams off the socket for the lifetime of the endpoint
async fn receive_loop(
    mut ready: broadcast::Receiver<Endpoint>,
    socket: Arc<UdpSocket>,
    handle: TpHandle,
) {
    // the endpoint must exist before any message can be dispatched
    let Ok(endpoint) = ready.recv().await else {
        return;
    };

    let mut buffer = vec![0u8; MAX_DATAGRAM];

    loop {
        let (len, peer) = match socket.recv_from(&mut buffer).await {
            Ok(received) => received,
            Err(e) => {
                log::warn!("udp receive failed: {e}");
                continue;
            }
        };

        match classify_datagram(&buffer[..len]) {
            Ok(Datagram::Ping) => {
                if let Err(e) = socket.send_to(b"\r\n", peer).await {
                    log::debug!("keep-alive pong to {peer} failed: {e}");
                }
            }
            Ok(Datagram::Pong) => {}
            Ok(Datagram::Sip(message)) => {
                endpoint.receive(ReceivedMessage::new(
                    peer,
                    message.buffer,
                    handle.clone(),
                    message.line,
                    message.headers,
                    message.body,
                ));
            }
            // no response for garbage, not even an error
            Err(e) => {
                log::debug!("unparseable datagram from {peer} dropped: {e}");
            }
        }
    }
}
