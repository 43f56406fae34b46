use clap::Parser;
use flowpbx::cdr::ChannelCdrSink;
use flowpbx::config::PbxConfig;
use flowpbx::media::ChannelMediaRelay;
use flowpbx::push::NoPush;
use flowpbx::Server;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

/// FlowPBX: SIP signaling and call control core
#[derive(Parser)]
#[command(version, about)]
struct Args {
    /// Path to the configuration file
    #[arg(short, long, default_value = "flowpbx.toml")]
    config: PathBuf,

    /// Validate the configuration and exit
    #[arg(long)]
    check: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let args = Args::parse();

    let config = match PbxConfig::load(&args.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{e}");
            return ExitCode::FAILURE;
        }
    };

    if args.check {
        println!("configuration ok");
        return ExitCode::SUCCESS;
    }

    // The RTP relay is an external collaborator speaking RelayCommand over
    // this channel; without a consumer attached every call is refused with
    // 503.
    let (relay_tx, relay_rx) = tokio::sync::mpsc::channel(64);
    drop(relay_rx);
    tracing::warn!("no media relay consumer attached, calls will be refused");

    let relay = Arc::new(ChannelMediaRelay::new(relay_tx));

    let (cdr_sink, mut cdr_rx) = ChannelCdrSink::new();

    // the persistence layer consumes these; until it is attached the records
    // are only logged
    tokio::spawn(async move {
        while let Some(record) = cdr_rx.recv().await {
            tracing::info!(
                call_id = %record.call_id,
                disposition = ?record.disposition,
                cause = %record.hangup_cause,
                "call ended"
            );
        }
    });

    let server = match Server::start(
        config,
        Some(args.config.clone()),
        relay,
        Arc::new(NoPush),
        Arc::new(cdr_sink),
    )
    .await
    {
        Ok(server) => server,
        Err(e) => {
            eprintln!("failed to start: {e}");
            return ExitCode::FAILURE;
        }
    };

    tracing::info!("flowpbx is up");

    // SIGHUP reloads the configuration, ctrl-c shuts down
    #[cfg(unix)]
    {
        let mut hup = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::hangup())
            .expect("signal handler installs");

        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => break,
                _ = hup.recv() => {
                    let _ = server.reload();
                }
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }

    server.shutdown().await;

    ExitCode::SUCCESS
}
