//! TLS stream transport on top of `tokio-rustls`

use crate::transport::streaming::{StreamingTransport, spawn_stream_connection};
use crate::transport::{CONNECT_TIMEOUT, Direction, Factory, TpHandle};
use crate::{Endpoint, EndpointBuilder};
use rustls_pki_types::ServerName;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::split;
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio::sync::broadcast;
use tokio::time::timeout;
use tokio_rustls::rustls::{ClientConfig, ServerConfig};
use tokio_rustls::{TlsAcceptor, TlsConnector};

const TLS: &str = "TLS";

/// TLS listener plus outbound connector sharing the server certificates
pub struct TlsFactory {
    connector: TlsConnector,
    sent_by: SocketAddr,
}

/// Bind the TLS listener and register the outbound TLS factory
pub async fn spawn<A>(
    builder: &mut EndpointBuilder,
    addr: A,
    server_config: Arc<ServerConfig>,
    client_config: Arc<ClientConfig>,
) -> io::Result<SocketAddr>
where
    A: ToSocketAddrs,
{
    let listener = TcpListener::bind(addr).await?;
    let bound = listener.local_addr()?;

    log::info!("bound TLS to {bound}");

    builder.add_transport_factory(Arc::new(TlsFactory {
        connector: TlsConnector::from(client_config),
        sent_by: bound,
    }));

    tokio::spawn(accept_task(
        builder.subscribe(),
        listener,
        TlsAcceptor::from(server_config),
        bound,
    ));

    Ok(bound)
}

#[async_trait::async_trait]
impl Factory for TlsFactory {
    fn name(&self) -> &'static str {
        TLS
    }

    fn secure(&self) -> bool {
        true
    }

    async fn create(&self, endpoint: Endpoint, addr: SocketAddr) -> io::Result<TpHandle> {
        let stream = timeout(CONNECT_TIMEOUT, TcpStream::connect(addr))
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "tls connect timed out"))??;

        let bound = stream.local_addr()?;
        let remote = stream.peer_addr()?;

        let server_name = ServerName::IpAddress(remote.ip().into());

        let stream = self.connector.connect(server_name, stream).await?;

        let (read, write) = split(stream);

        let handle = TpHandle::new(StreamingTransport::new(
            TLS,
            true,
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
    acceptor: TlsAcceptor,
    sent_by: SocketAddr,
) {
    let Ok(endpoint) = endpoint.recv().await else {
        return;
    };

    loop {
        let (stream, remote) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                log::warn!("TLS accept failed: {e}");
                continue;
            }
        };

        let acceptor = acceptor.clone();
        let endpoint = endpoint.clone();

        // handshakes run concurrently so a slow peer cannot stall the accept loop
        tokio::spawn(async move {
            let bound = match stream.local_addr() {
                Ok(bound) => bound,
                Err(_) => return,
            };

            let stream = match acceptor.accept(stream).await {
                Ok(stream) => stream,
                Err(e) => {
                    log::debug!("TLS handshake with {remote} failed: {e}");
                    return;
                }
            };

            log::debug!("accepted TLS connection from {remote}");

            let (read, write) = split(stream);

            let handle = TpHandle::new(StreamingTransport::new(
                TLS,
                true,
                bound,
                sent_by,
                Direction::Incoming(remote),
                Box::pin(write),
            ));

            spawn_stream_connection(endpoint, handle, Box::pin(read), remote);
        });
    }
}
