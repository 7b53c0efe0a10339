use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use domain_router::capture::{AfPacketSocket, FrameIo};
use domain_router::config::{self, RouterConfig};
use domain_router::dataplane::{Dispatch, Event, InterfaceId, Router, TimerKind};
use domain_router::telemetry::{RouterReport, init_logging};
use domain_router::{Error, Result};
use tokio::signal::unix::{SignalKind, signal};
use tokio::sync::mpsc;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// Largest frame read from a device
const FRAME_BUFFER: usize = 2048;

#[derive(Parser)]
#[command(name = "domain-router")]
#[command(about = "Multi-domain IPv4 router with NAT and link tracking")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the router
    Run {
        /// Path to the configuration file
        #[arg(short, long, default_value = "router.toml")]
        config: PathBuf,
    },
    /// Validate a configuration file and exit
    Check {
        /// Path to the configuration file
        #[arg(short, long, default_value = "router.toml")]
        config: PathBuf,
    },
}

fn main() {
    let cli = Cli::parse();

    let result = match cli.command {
        Some(Commands::Check { config }) => cmd_check(&config),
        Some(Commands::Run { config }) => cmd_run(&config),
        None => cmd_run(Path::new("router.toml")),
    };
    if let Err(e) = result {
        eprintln!("[ERROR] {}", e);
        std::process::exit(1);
    }
}

fn cmd_check(path: &Path) -> Result<()> {
    init_logging(None);
    println!("[INFO] Validating {}...", path.display());

    let cfg = config::load(path)?;
    let validation = config::validate(&cfg);
    validation.print_diagnostics();
    if validation.has_errors() {
        return Err(Error::Config("validation failed".to_string()));
    }
    println!(
        "[INFO] Configuration is valid: {} domains, {} attachments",
        cfg.domains.len(),
        cfg.attachments.len()
    );
    Ok(())
}

fn cmd_run(path: &Path) -> Result<()> {
    let cfg = config::load_validated(path)?;
    init_logging(cfg.log.as_ref());
    info!("loaded {}", path.display());

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    runtime.block_on(run(path.to_path_buf(), cfg))
}

fn timer(period: Duration) -> Interval {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}

fn report_period(cfg: &RouterConfig) -> Duration {
    Duration::from_secs(cfg.report.interval_sec.max(1))
}

async fn run(path: PathBuf, cfg: RouterConfig) -> Result<()> {
    let attachments = cfg.attachments.clone();
    let mut router = Router::new(cfg)?;

    let (frames_tx, mut frames_rx) = mpsc::channel::<(InterfaceId, Vec<u8>)>(1024);
    let mut sockets: HashMap<InterfaceId, Arc<AfPacketSocket>> = HashMap::new();

    for attach in &attachments {
        info!("binding {} to domain {}...", attach.device, attach.domain);
        let socket = AfPacketSocket::bind(&attach.device).map_err(|e| {
            Error::Config(format!(
                "failed to bind {}: {}. Run with root privileges.",
                attach.device, e
            ))
        })?;
        let id = router.attach_interface(&attach.domain);
        let socket = Arc::new(socket);
        sockets.insert(id, socket.clone());
        tokio::spawn(read_frames(id, socket, frames_tx.clone()));
    }
    drop(frames_tx);

    if sockets.is_empty() {
        warn!("no [[attach]] entries, the router will only run timers");
    }

    let mut hangup = signal(SignalKind::hangup())?;
    let mut link_aging = timer(Duration::from_secs(1));
    let mut arp_expiry = timer(Duration::from_secs(1));
    let mut dhcp = timer(Duration::from_secs(1));
    let mut report_every = report_period(router.config());
    let mut report = timer(report_every);

    info!("router started, generation {}", router.generation());

    loop {
        let event = tokio::select! {
            Some((interface, frame)) = frames_rx.recv() => Event::FrameArrived { interface, frame },
            _ = link_aging.tick() => Event::Timeout(TimerKind::LinkAging),
            _ = arp_expiry.tick() => Event::Timeout(TimerKind::ArpExpiry),
            _ = dhcp.tick() => Event::Timeout(TimerKind::DhcpMaintenance),
            _ = report.tick() => Event::Timeout(TimerKind::Report),
            _ = hangup.recv() => match reload(&path) {
                Some(cfg) => Event::ConfigReloaded(cfg),
                None => continue,
            },
            _ = tokio::signal::ctrl_c() => {
                info!("shutting down");
                return Ok(());
            }
        };
        let reloaded = matches!(event, Event::ConfigReloaded(_));

        let dispatch = router.handle_event(event, Instant::now().into_std());
        deliver(&router, &sockets, dispatch).await;

        if reloaded {
            let period = report_period(router.config());
            if period != report_every {
                report_every = period;
                report = timer(period);
            }
            if router.config().attachments != attachments {
                warn!("[[attach]] changes take effect after a restart");
            }
        }
    }
}

/// Re-read the file on SIGHUP. Validation happens in the router so a
/// rejected document is remembered for the report.
fn reload(path: &Path) -> Option<RouterConfig> {
    info!("SIGHUP: reloading {}", path.display());
    match config::load(path) {
        Ok(cfg) => Some(cfg),
        Err(e) => {
            error!("reload failed: {}", e);
            None
        }
    }
}

async fn read_frames(
    id: InterfaceId,
    socket: Arc<AfPacketSocket>,
    frames: mpsc::Sender<(InterfaceId, Vec<u8>)>,
) {
    let mut buf = vec![0u8; FRAME_BUFFER];
    loop {
        match socket.recv(&mut buf).await {
            Ok(len) => {
                if frames.send((id, buf[..len].to_vec())).await.is_err() {
                    return;
                }
            }
            Err(e) => {
                error!("{}: receive error: {}", socket.device(), e);
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
}

async fn deliver(router: &Router, sockets: &HashMap<InterfaceId, Arc<AfPacketSocket>>, dispatch: Dispatch) {
    for transmit in dispatch.transmits {
        let Some(socket) = sockets.get(&transmit.interface) else {
            debug!("{}: no device, frame dropped", transmit.interface);
            continue;
        };
        if let Err(e) = socket.send(&transmit.frame).await {
            warn!("{}: send failed: {}", socket.device(), e);
        }
    }
    if let Some(report) = dispatch.report {
        if let Err(e) = publish(router, &report).await {
            warn!("report: {}", e);
        }
    }
}

async fn publish(router: &Router, report: &RouterReport) -> Result<()> {
    let json = report.to_json()?;
    match router.settings().report.path.as_deref() {
        Some(path) => tokio::fs::write(path, json).await?,
        None => info!(target: "report", "{}", json),
    }
    Ok(())
}
