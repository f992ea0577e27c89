use anyhow::Result;
use clap::Parser;
use restore_core::events::TracingObserver;
use restore_core::lockdown::LockdownClient;
use restore_core::protocol::LOCKDOWN_PORT;
use restore_core::restored::RestoredClient;
use restore_core::session::{CancelToken, RestoreConfig, RestoreSession, SessionError};
use restore_core::transport::{DeviceTransport, UsbmuxTransport};
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(author, version, about = "Restore a filesystem image onto an attached device", long_about = None)]
struct Args {
    /// Restore with this filesystem image
    #[arg(short, long, value_name = "FILE")]
    filesystem: Option<String>,

    /// Send this kernelcache when the device asks for one
    #[arg(short, long, value_name = "FILE")]
    kernelcache: Option<String>,

    /// Target the device with this serial number
    #[arg(short, long)]
    udid: Option<String>,

    /// Load defaults from a TOML configuration file
    #[arg(long, value_name = "FILE")]
    config: Option<String>,

    /// Put the device into recovery mode and exit
    #[arg(short, long)]
    recovery: bool,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

fn main() {
    let args = Args::parse();

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::builder()
                .with_default_directive(if args.debug {
                    tracing::Level::DEBUG.into()
                } else {
                    tracing::Level::INFO.into()
                })
                .from_env_lossy(),
        )
        .with_writer(std::io::stderr)
        .finish();

    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    if let Err(e) = run(args) {
        error!("Error: {e:#}");
        let code = e
            .downcast_ref::<SessionError>()
            .map_or(-1, SessionError::exit_code);
        std::process::exit(code);
    }
}

fn run(args: Args) -> Result<()> {
    let mut config = match &args.config {
        Some(path) => RestoreConfig::load_from_file(path)?,
        None => RestoreConfig::default(),
    };
    if args.filesystem.is_some() {
        config.filesystem = args.filesystem;
    }
    if args.kernelcache.is_some() {
        config.kernelcache = args.kernelcache;
    }
    if args.udid.is_some() {
        config.udid = args.udid;
    }

    let transport = UsbmuxTransport::discover(config.udid.as_deref())?;
    info!(udid = %transport.udid(), "using device");

    if args.recovery {
        let conn = transport.connect(LOCKDOWN_PORT)?;
        LockdownClient::new(conn).enter_recovery()?;
        info!("device entering recovery mode");
        return Ok(());
    }

    let conn = transport.connect(LOCKDOWN_PORT)?;
    let control = RestoredClient::new(conn);

    let cancel = CancelToken::new();
    {
        let cancel = cancel.clone();
        ctrlc::set_handler(move || cancel.cancel())?;
    }

    let observer = TracingObserver;
    let mut session =
        RestoreSession::new(&transport, control, &config, &observer).with_cancel(cancel);
    session.run()?;

    info!("restore session finished");
    Ok(())
}
