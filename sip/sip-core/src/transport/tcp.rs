use crate::transport::streaming::{StreamingTransport, spawn_stream_connection};
use crate::transport::{CONNECT_TIMEOUT, Direction, Factory, TpHandle};
use crate::{Endpoint, EndpointBuilder};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio::sync::broadcast;
use tokio::time::timeout;

const TCP: &str = "TCP";

/// TCP listener accepting inbound stream connections.
///
/// Accepted connections land in the connection cache so responses and
/// subsequent requests to the peer reuse them.
pub struct TcpConnector {
    sent_by: SocketAddr,
}

impl TcpConnector {
    /// Bind the listener and register the outbound connection factory
    pub async fn spawn<A>(builder: &mut EndpointBuilder, addr: A) -> io::Result<SocketAddr>
    where
        A: ToSocketAddrs,
    {
        let listener = TcpListener::bind(addr).await?;
        let bound = listener.local_addr()?;

        log::info!("bound TCP to {bound}");

        builder.add_transport_factory(Arc::new(TcpConnector { sent_by: bound }));

        tokio::spawn(accept_task(builder.subscribe(), listener, bound));

        Ok(bound)
    }
}

#[async_trait::async_trait]
impl Factory for TcpConnector {
    fn name(&self) -> &'static str {
        TCP
    }

    fn secure(&self) -> bool {
        false
    }

    async fn create(&self, endpoint: Endpoint, addr: SocketAddr) -> io::Result<TpHandle> {
        let stream = timeout(CONNECT_TIMEOUT, TcpStream::connect(addr))
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "tcp connect timed out"))??;

        let bound = stream.local_addr()?;
        let remote = stream.peer_addr()?;

        let (read, write) = stream.into_split();

        let handle = TpHandle::new(StreamingTransport::new(
            TCP,
            false,
            bound,
            self.sent_by,
            Direction::Outgoing(remote),
            Box::pin(write),
        ));

        spawn_stream_connection(endpoint, handle.clone(), Box::pin(read), remote);

        Ok(handle)
    }
}

async fn accept_task(
    mut endpoint: broadcast::Receiver<Endpoint>,
    listener: TcpListener,
    sent_by: SocketAddr,
) {
    let Ok(endpoint) = endpoint.recv().await else {
        return;
    };

    loop {
        let (stream, remote) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                log::warn!("TCP accept failed: {e}");
                continue;
            }
        };

        let bound = match stream.local_addr() {
            Ok(bound) => bound,
            Err(e) => {
                log::warn!("failed to read local addr of accepted connection: {e}");
                continue;
            }
        };

        log::debug!("accepted TCP connection from {remote}");

        let (read, write) = stream.into_split();

        let handle = TpHandle::new(StreamingTransport::new(
            TCP,
            false,
            bound,
            sent_by,
            Direction::Incoming(remote),
            Box::pin(write),
        ));

        spawn_stream_connection(endpoint.clone(), handle, Box::pin(read), remote);
    }
}
