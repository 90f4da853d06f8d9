//! afisyncd daemon
//!
//! Main entry point. Mirrors kernel routes and neighbors into the
//! forwarding sandbox until SIGINT or SIGTERM.

use afisyncd::config::DEFAULT_CONFIG_PATH;
use afisyncd::{
    AfiSync, AfisyncConfig, AsyncNetlinkSocket, EngineCommand, ForwardingPlane, FpmServer,
    InterfaceRegistry, MemoryForwardingPlane, NetlinkOptions, NetlinkSocket, PortSinkMap,
    PuntRelay, RpcForwardingPlane, SyncEvent, TapDevice, netlink,
};
use anyhow::Context;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal::unix::{SignalKind, signal};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// Depth of the queue feeding the reconciliation task
const EVENT_QUEUE_DEPTH: usize = 4096;

#[derive(Parser, Debug)]
#[command(name = "afisyncd")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file
    #[arg(short = 'c', long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Log level, overridden by RUST_LOG
    #[arg(short = 'l', long, default_value = "info")]
    log_level: String,

    /// Program an in-memory forwarding plane and skip tap/punt setup
    #[arg(long)]
    dry_run: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_logging(&args.log_level)?;

    info!(config = %args.config.display(), dry_run = args.dry_run, "afisyncd: Starting");

    match run_daemon(args).await {
        Ok(()) => {
            info!("afisyncd: Daemon exiting normally");
            Ok(())
        }
        Err(e) => {
            error!(error = %e, "afisyncd: Daemon exiting with error");
            Err(e)
        }
    }
}

fn init_logging(level: &str) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .with_context(|| format!("invalid log level {:?}", level))?;

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .compact()
        .finish();

    tracing::subscriber::set_global_default(subscriber).context("failed to set logger")?;
    Ok(())
}

async fn run_daemon(args: Args) -> anyhow::Result<()> {
    let config = AfisyncConfig::load(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?;

    let plane: Arc<dyn ForwardingPlane> = if args.dry_run {
        info!("afisyncd: Using in-memory forwarding plane");
        Arc::new(MemoryForwardingPlane::new())
    } else {
        Arc::new(
            RpcForwardingPlane::connect(config.afi_server_address)
                .await
                .context("connecting to the forwarding plane")?,
        )
    };

    // Taps must exist before their ifindexes can be resolved
    let taps = if args.dry_run {
        Vec::new()
    } else {
        open_taps(&config)?
    };
    let interfaces = Arc::new(
        InterfaceRegistry::from_config(&config.interfaces).context("resolving interfaces")?,
    );

    let mut engine = AfiSync::new(
        plane,
        interfaces,
        config.sandbox_name.clone(),
        config.num_ports,
    );
    engine.setup().await.context("sandbox setup")?;

    let options = NetlinkOptions {
        buffer_size: config.netlink_buffer_size,
        routes: !config.use_fpm_interface,
    };
    let mut socket = NetlinkSocket::new(options).context("opening netlink socket")?;
    for kind in options.dumps() {
        let events = socket
            .dump(kind)
            .with_context(|| format!("{:?} dump", kind))?;
        info!(?kind, count = events.len(), "afisyncd: Applying initial dump");
        for event in events {
            apply(&mut engine, event).await;
        }
    }

    let (tx, mut rx) = mpsc::channel(EVENT_QUEUE_DEPTH);

    let feed = AsyncNetlinkSocket::from_socket(socket)?;
    let mut netlink_task = tokio::spawn(netlink::run(feed, tx.clone()));

    if config.use_fpm_interface {
        let server = FpmServer::bind(config.fpm_listen_address).await?;
        let fpm_tx = tx.clone();
        tokio::spawn(async move {
            if let Err(e) = server.run(fpm_tx).await {
                error!(error = %e, "afisyncd: FPM listener stopped");
            }
        });
    }

    if !taps.is_empty() {
        let sinks = Arc::new(PortSinkMap::new());
        for (port, tap) in taps {
            sinks.insert(port, Arc::new(tap))?;
        }
        let relay = PuntRelay::bind(config.afi_hostpath_address, sinks)
            .await
            .context("binding hostpath socket")?;
        tokio::spawn(async move {
            if let Err(e) = relay.run().await {
                error!(error = %e, "afisyncd: Punt relay stopped");
            }
        });
    }

    spawn_dump_trigger(tx.clone())?;
    drop(tx);

    let mut sigterm = signal(SignalKind::terminate())?;
    info!("afisyncd: Listening for route and neighbor events");

    loop {
        tokio::select! {
            command = rx.recv() => match command {
                Some(EngineCommand::Event(event)) => apply(&mut engine, event).await,
                Some(EngineCommand::Dump) => info!("afisyncd: State dump\n{}", engine.dump()),
                None => break,
            },
            joined = &mut netlink_task => {
                match joined {
                    Ok(Ok(())) => warn!("afisyncd: Netlink feed ended"),
                    Ok(Err(e)) => return Err(e).context("netlink feed failed"),
                    Err(e) => return Err(e).context("netlink task panicked"),
                }
                break;
            }
            _ = tokio::signal::ctrl_c() => {
                info!("afisyncd: Received SIGINT");
                break;
            }
            _ = sigterm.recv() => {
                info!("afisyncd: Received SIGTERM");
                break;
            }
        }
    }

    info!(counters = %engine.counters(), "afisyncd: Graceful shutdown complete");
    Ok(())
}

/// Opens the tap device of every configured port.
fn open_taps(config: &AfisyncConfig) -> anyhow::Result<Vec<(u16, TapDevice)>> {
    config
        .interfaces
        .iter()
        .map(|iface| {
            TapDevice::open(&iface.tap)
                .map(|tap| (iface.port, tap))
                .with_context(|| format!("opening tap {}", iface.tap))
        })
        .collect()
}

async fn apply(engine: &mut AfiSync, event: SyncEvent) {
    let description = event.to_string();
    match engine.apply(event).await {
        Ok(outcome) => debug!(event = %description, ?outcome, "afisyncd: Event applied"),
        Err(e) => warn!(event = %description, error = %e, "afisyncd: Event failed"),
    }
}

/// SIGUSR1 asks the reconciliation task for a state dump.
fn spawn_dump_trigger(tx: mpsc::Sender<EngineCommand>) -> anyhow::Result<()> {
    let mut usr1 = signal(SignalKind::user_defined1())?;
    tokio::spawn(async move {
        while usr1.recv().await.is_some() {
            if tx.send(EngineCommand::Dump).await.is_err() {
                break;
            }
        }
    });
    Ok(())
}
