use clap::Parser;
use goodix_core::session::{SensorSession, SessionConfig};
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(author, version, about = "Goodix GF5395 Fingerprint Sensor Tool", long_about = None)]
struct Args {
    /// Path to a session config TOML file
    #[arg(long)]
    config: Option<String>,

    /// Pre-shared key as hex, overrides the config file
    #[arg(long)]
    psk: Option<String>,

    /// OTP dump as hex, used to derive calibration
    #[arg(long)]
    otp: Option<String>,

    /// Path to the sensor config blob to patch and upload
    #[arg(long)]
    blob: Option<String>,

    /// Write the effective config to this TOML file and exit
    #[arg(long)]
    save_config: Option<String>,

    /// Put the sensor to sleep after bring-up
    #[arg(long)]
    sleep: bool,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

fn main() {
    let args = Args::parse();

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::builder()
                .with_default_directive(if args.verbose {
                    tracing::Level::DEBUG.into()
                } else {
                    tracing::Level::INFO.into()
                })
                .from_env_lossy(),
        )
        .with_writer(std::io::stderr)
        .finish();

    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    info!("Starting GF5395 sensor tool (nusb backend)...");

    if let Err(e) = run(args) {
        error!("Error: {}", e);
        std::process::exit(1);
    }
}

fn run(args: Args) -> anyhow::Result<()> {
    let mut config = match &args.config {
        Some(path) => SessionConfig::load_from_file(path)?,
        None => SessionConfig::default(),
    };
    if let Some(psk) = args.psk {
        config.psk_hex = psk;
    }
    if let Some(otp) = args.otp {
        config.otp_hex = Some(otp);
    }
    if let Some(blob) = args.blob {
        config.config_path = Some(blob);
    }

    if let Some(path) = &args.save_config {
        config.save_to_file(path)?;
        info!(path = %path, "Config written");
        return Ok(());
    }

    let session = SensorSession::new(config);
    let mut device = session.run()?;

    if args.sleep {
        device.set_sleep_mode()?;
        info!("Sensor sleeping");
    }

    device.deinit_device()?;
    Ok(())
}
