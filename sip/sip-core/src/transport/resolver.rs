use std::io;
use std::net::SocketAddr;

/// Resolve a hostname to socket addresses via DNS A/AAAA lookup.
///
/// NAPTR/SRV resolution is intentionally not performed; trunk targets name a
/// concrete host (or IP) and port in their configuration.
pub(crate) async fn resolve_host(
    resolver: &hickory_resolver::TokioResolver,
    name: &str,
    port: u16,
) -> io::Result<Vec<SocketAddr>> {
    let lookup = resolver
        .lookup_ip(name)
        .await
        .map_err(|e| io::Error::new(io::ErrorKind::NotFound, e))?;

    let addrs: Vec<SocketAddr> = lookup
        .iter()
        .map(|ip| SocketAddr::new(ip, port))
        .collect();

    if addrs.is_empty() {
        return Err(io::Error::new(
            io::ErrorKind::NotFound,
            format!("no addresses found for {name}"),
        ));
    }

    Ok(addrs)
}
