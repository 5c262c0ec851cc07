use anyhow::{Context, Result, bail};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use sbpd::channels::ChannelSet;
use sbpd::clock::Clock;
use sbpd::commands::CommandMapper;
use sbpd::config::{ElementSpec, Settings};
use sbpd::control::{Controller, LOOP_QUANTUM};
use sbpd::discovery::Discovery;
use sbpd::gpio::RppalGpio;
use sbpd::transport::{Credentials, JsonRpcTransport, ProcessScriptRunner, find_mac, normalize_mac};

/// Squeezebox button and rotary encoder daemon.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Cli {
    /// Command code file (CODE=fragment per line)
    #[arg(short = 'f', long = "conf-file")]
    conf_file: Option<PathBuf>,

    /// JSON settings file; command line values override it
    #[arg(short = 'c', long)]
    settings: Option<PathBuf>,

    /// Player MAC address, default is the first network interface
    #[arg(short = 'M', long)]
    mac: Option<String>,

    /// Server address, found automatically when not given
    #[arg(short = 'A', long)]
    address: Option<String>,

    /// Server JSON-RPC port, found automatically when not given
    #[arg(short = 'P', long)]
    port: Option<u16>,

    #[arg(short = 'u', long)]
    username: Option<String>,

    #[arg(short = 'p', long)]
    password: Option<String>,

    /// Log informational messages
    #[arg(short = 'v', long)]
    verbose: bool,

    /// Log debug messages
    #[arg(short = 'z', long)]
    debug: bool,

    /// Log nothing
    #[arg(short = 's', long)]
    silent: bool,

    /// b,pin,CMD[,resist,pressed,CMD_LONG,long_time] or
    /// e,pin1,pin2,CMD[,edge,min_interval_ms,max_step]
    elements: Vec<String>,
}

impl Cli {
    fn log_filter(&self) -> &'static str {
        if self.silent {
            "off"
        } else if self.debug {
            "sbpd=debug"
        } else if self.verbose {
            "sbpd=info"
        } else {
            "sbpd=warn"
        }
    }

    /// Folds the command line into the settings loaded from file.
    fn apply(&self, settings: &mut Settings) {
        if let Some(path) = &self.conf_file {
            settings.command_file = Some(path.clone());
        }
        if let Some(mac) = &self.mac {
            settings.mac = Some(mac.clone());
        }
        if let Some(address) = &self.address {
            settings.server.host = Some(address.clone());
        }
        if let Some(port) = self.port {
            settings.server.port = Some(port);
        }
        if let Some(username) = &self.username {
            settings.server.username = Some(username.clone());
        }
        if let Some(password) = &self.password {
            settings.server.password = Some(password.clone());
        }
        for spec in &self.elements {
            match spec.parse::<ElementSpec>() {
                Ok(element) => settings.elements.push(element),
                Err(e) => error!("{}", e),
            }
        }
    }
}

fn player_mac(settings: &Settings) -> Result<String> {
    match &settings.mac {
        Some(mac) => normalize_mac(mac).with_context(|| format!("invalid MAC address '{mac}'")),
        None => find_mac().context("no MAC address found, use --mac"),
    }
}

fn credentials(settings: &Settings) -> Result<Option<Credentials>> {
    match (&settings.server.username, &settings.server.password) {
        (Some(username), Some(password)) => Ok(Some(Credentials {
            username: username.clone(),
            password: password.clone(),
        })),
        (None, None) => Ok(None),
        _ => bail!("username and password must be given together"),
    }
}

/// Waits for SIGINT or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, shutting down"),
        _ = terminate => info!("Received SIGTERM, shutting down"),
    }
}

/// The control loop is synchronous; signals are awaited on a side thread
/// and turned into the stop flag.
fn spawn_signal_watcher(stop: Arc<AtomicBool>) -> Result<()> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to build signal runtime")?;
    thread::Builder::new().name("signals".to_string()).spawn(move || {
        runtime.block_on(shutdown_signal());
        stop.store(true, Ordering::Release);
    })?;
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| cli.log_filter().into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting sbpd v{}", env!("CARGO_PKG_VERSION"));

    let mut settings = match &cli.settings {
        Some(path) => Settings::load(path).with_context(|| format!("failed to load {}", path.display()))?,
        None => Settings::default(),
    };
    cli.apply(&mut settings);
    if settings.elements.is_empty() {
        warn!("No buttons or encoders configured");
    }

    let mapper = CommandMapper::load(settings.command_file.as_deref());
    let transport = JsonRpcTransport::new(player_mac(&settings)?, credentials(&settings)?)?;

    let clock = Clock::monotonic();
    // Owns the pins; must outlive the control loop.
    let mut gpio = RppalGpio::new()?;
    let mut channels = ChannelSet::new();
    channels.add_all(&mut gpio, &settings.elements, &mapper, &clock);

    let discovery = Discovery::new(settings.server.host.clone(), settings.server.port);

    let stop = Arc::new(AtomicBool::new(false));
    spawn_signal_watcher(Arc::clone(&stop))?;

    let mut controller = Controller::new(channels, discovery, transport, ProcessScriptRunner);
    controller.run(&clock, &stop, LOOP_QUANTUM);

    drop(gpio);
    info!("Stopped");
    Ok(())
}
