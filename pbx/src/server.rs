//! Assembles the endpoint, layers and managers into a running server.

use crate::call::{CallController, CallControllerLayer};
use crate::cdr::CdrSink;
use crate::config::{ConfigError, PbxConfig, TlsConfig};
use crate::media::MediaRelay;
use crate::metrics::Metrics;
use crate::push::PushAdapter;
use crate::registrar::{Registrar, RegistrarLayer};
use crate::snapshot::{ConfigSnapshot, SnapshotStore};
use crate::trunk::TrunkManager;
use sip_core::trace::{MessageTracer, TraceVerbosity};
use sip_core::transport::tcp::TcpConnector;
use sip_core::transport::udp::Udp;
use sip_core::Endpoint;
use sip_types::Method;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_rustls::rustls;
use tokio_util::sync::CancellationToken;

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("failed to bind transports: {0}")]
    Bind(#[from] std::io::Error),
    #[error("invalid TLS configuration: {0}")]
    Tls(String),
}

/// A running FlowPBX instance
pub struct Server {
    pub endpoint: Endpoint,
    pub controller: Arc<CallController>,
    pub registrar: Arc<Registrar>,
    pub trunks: Arc<TrunkManager>,
    pub metrics: Arc<Metrics>,
    pub snapshots: Arc<SnapshotStore>,

    /// Actual UDP bind address, useful when the config asked for port 0
    pub udp_addr: std::net::SocketAddr,

    config_path: Option<PathBuf>,
    shutdown: CancellationToken,
    shutdown_grace: Duration,
}

impl Server {
    /// Bring up transports, layers and trunk tasks from a loaded config
    pub async fn start(
        config: PbxConfig,
        config_path: Option<PathBuf>,
        relay: Arc<dyn MediaRelay>,
        push: Arc<dyn PushAdapter>,
        cdr_sink: Arc<dyn CdrSink>,
    ) -> Result<Server, ServerError> {
        let shutdown = CancellationToken::new();
        let shutdown_grace = config.shutdown_grace();

        let metrics = Arc::new(Metrics::new());
        let snapshots = Arc::new(SnapshotStore::new(ConfigSnapshot::compile(config)));

        let snapshot = snapshots.load();
        let sip_config = &snapshot.config.sip;

        let registrar = Arc::new(Registrar::new(
            &sip_config.domain,
            snapshots.clone(),
            metrics.clone(),
        ));

        let controller = Arc::new(CallController::new(
            snapshots.clone(),
            registrar.clone(),
            relay,
            push,
            cdr_sink,
            metrics.clone(),
            shutdown.clone(),
        ));

        let mut builder = Endpoint::builder();

        for method in [
            Method::INVITE,
            Method::ACK,
            Method::CANCEL,
            Method::BYE,
            Method::OPTIONS,
            Method::REGISTER,
            Method::REFER,
            Method::NOTIFY,
            Method::UPDATE,
            Method::INFO,
            Method::MESSAGE,
        ] {
            builder.add_allow(method);
        }

        builder.add_supported("replaces");
        builder.add_supported("timer");

        builder.set_timers(snapshot.config.timers.to_timer_config());
        builder.set_max_connections(snapshot.config.limits.max_connections);
        builder.set_tracer(MessageTracer::new(TraceVerbosity::from_str_or_off(
            &sip_config.trace,
        )));

        let udp = Udp::spawn(&mut builder, sip_config.bind_udp).await?;
        let udp_addr = udp.bound();
        TcpConnector::spawn(&mut builder, sip_config.bind_tcp).await?;

        if let Some(tls) = &sip_config.tls {
            let (server_config, client_config) = load_tls(tls)?;

            sip_core::transport::tls::spawn(
                &mut builder,
                tls.bind,
                server_config,
                client_config,
            )
            .await?;
        }

        builder.add_layer(sip_ua::dialog::DialogLayer::new());
        builder.add_layer(sip_ua::invite::InviteLayer::new());
        builder.add_layer(RegistrarLayer {
            registrar: registrar.clone(),
        });
        builder.add_layer(CallControllerLayer {
            controller: controller.clone(),
        });

        let endpoint = builder.build();

        // surface trace queue drops as a counter
        {
            let tracer = endpoint.tracer().clone();
            let metrics = metrics.clone();

            tokio::spawn(async move {
                let mut interval = tokio::time::interval(Duration::from_secs(30));
                let mut reported = 0u64;

                loop {
                    interval.tick().await;

                    let dropped = tracer.dropped_frames();
                    if dropped > reported {
                        metrics.trace_dropped.inc_by(dropped - reported);
                        reported = dropped;
                    }
                }
            });
        }

        registrar.clone().spawn_sweeper();

        let trunks = Arc::new(TrunkManager::new(
            endpoint.clone(),
            metrics.clone(),
            sip_config.domain.clone(),
        ));

        trunks.clone().reload(&snapshot.config.trunks);
        controller.set_trunks(trunks.clone());

        Ok(Server {
            endpoint,
            controller,
            registrar,
            trunks,
            metrics,
            snapshots,
            udp_addr,
            config_path,
            shutdown,
            shutdown_grace,
        })
    }

    /// Re-read the configuration file and swap the snapshot.
    ///
    /// A config that fails to read or parse leaves the previous snapshot and
    /// trunk set untouched.
    pub fn reload(&self) -> Result<(), ConfigError> {
        let Some(path) = &self.config_path else {
            log::warn!("reload requested but no config path is known");
            return Ok(());
        };

        let config = match PbxConfig::load(path) {
            Ok(config) => config,
            Err(e) => {
                log::error!("reload failed, keeping previous configuration: {e}");
                return Err(e);
            }
        };

        let trunks = config.trunks.clone();

        self.snapshots.store(ConfigSnapshot::compile(config));
        self.trunks.clone().reload(&trunks);

        log::info!("configuration reloaded");

        Ok(())
    }

    /// Cascade a graceful shutdown: stop admitting calls, cancel pending
    /// fan-outs, give established dialogs the grace period, then stop the
    /// trunk tasks.
    pub async fn shutdown(&self) {
        log::info!("shutting down, draining calls for {:?}", self.shutdown_grace);

        self.shutdown.cancel();

        let deadline = tokio::time::Instant::now() + self.shutdown_grace;

        while self.controller.active_calls() > 0 && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(250)).await;
        }

        if self.controller.active_calls() > 0 {
            log::warn!(
                "{} calls still alive after the grace period, force closing",
                self.controller.active_calls()
            );
        }

        for state in self.trunks.states() {
            let _ = self.trunks.stop(&state.id);
        }

        // give trunk unbinds a moment to leave the socket
        tokio::time::sleep(Duration::from_millis(500)).await;
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }
}

fn load_tls(
    tls: &TlsConfig,
) -> Result<(Arc<rustls::ServerConfig>, Arc<rustls::ClientConfig>), ServerError> {
    let certs = load_certs(&tls.certificate)?;
    let key = load_key(&tls.private_key)?;

    let server_config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| ServerError::Tls(e.to_string()))?;

    let mut roots = rustls::RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

    let client_config = rustls::ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();

    Ok((Arc::new(server_config), Arc::new(client_config)))
}

fn load_certs(
    path: &std::path::Path,
) -> Result<Vec<rustls::pki_types::CertificateDer<'static>>, ServerError> {
    let file = std::fs::File::open(path)
        .map_err(|e| ServerError::Tls(format!("cannot open {}: {e}", path.display())))?;

    rustls_pemfile::certs(&mut std::io::BufReader::new(file))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| ServerError::Tls(format!("cannot parse certificates: {e}")))
}

fn load_key(
    path: &std::path::Path,
) -> Result<rustls::pki_types::PrivateKeyDer<'static>, ServerError> {
    let file = std::fs::File::open(path)
        .map_err(|e| ServerError::Tls(format!("cannot open {}: {e}", path.display())))?;

    rustls_pemfile::private_key(&mut std::io::BufReader::new(file))
        .map_err(|e| ServerError::Tls(format!("cannot parse private key: {e}")))?
        .ok_or_else(|| ServerError::Tls("no private key found".into()))
}
