use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use fwup_core::{NullObserver, SessionConfig, UpdateSession, parse_file, protocol::constants};
use indicatif::{ProgressBar, ProgressStyle};
use tracing::{error, info};

/// Progress bar resolution.
const PROGRESS_STEPS: u64 = 1000;

#[derive(Parser, Debug)]
#[command(author, version, about = "F45x firmware updater (serial)", long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List the modules of a firmware image
    Info {
        /// Firmware image (UFIF container)
        image: PathBuf,
    },
    /// List the modules installed on a device
    Modules {
        /// Serial port of the device
        #[arg(long)]
        port: String,

        /// Baud rate
        #[arg(long, default_value_t = constants::DEFAULT_BAUD_RATE)]
        baud: u32,
    },
    /// Update a device from a firmware image
    Update {
        /// Serial port of the device
        #[arg(long)]
        port: Option<String>,

        /// Firmware image (UFIF container)
        #[arg(long)]
        image: Option<PathBuf>,

        /// Baud rate to switch to for the transfer
        #[arg(long)]
        baud: Option<u32>,

        /// Transfer every block even if the device already holds it
        #[arg(long)]
        force_full: bool,

        /// TOML session configuration; flags override it
        #[arg(long)]
        config: Option<PathBuf>,

        /// Where to write the protocol transcript
        #[arg(long)]
        transcript: Option<PathBuf>,
    },
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

    let result = match args.command {
        Commands::Info { image } => show_image(&image),
        Commands::Modules { port, baud } => show_device(port, baud),
        Commands::Update {
            port,
            image,
            baud,
            force_full,
            config,
            transcript,
        } => load_config(config.as_deref()).and_then(|mut session_config| {
            if port.is_some() {
                session_config.port = port;
            }
            if image.is_some() {
                session_config.firmware_path = image;
            }
            if let Some(baud) = baud {
                session_config.baud_rate = baud;
            }
            if let Some(transcript) = transcript {
                session_config.transcript_path = transcript;
            }
            session_config.force_full |= force_full;
            update(session_config)
        }),
    };

    if let Err(e) = result {
        error!("Error: {:#}", e);
        std::process::exit(1);
    }
}

fn load_config(path: Option<&Path>) -> Result<SessionConfig> {
    match path {
        Some(path) => SessionConfig::load_from_file(path),
        None => Ok(SessionConfig::default()),
    }
}

fn show_image(path: &Path) -> Result<()> {
    let container = parse_file(path, constants::BLOCK_SIZE)
        .with_context(|| format!("Failed to parse {}", path.display()))?;

    println!("{}", path.display());
    println!(
        "  OTP encryption version: {}",
        container.header.otp_encrypt_version
    );
    println!(
        "  {:<8} {:<12} {:>10} {:>7} {:>10}",
        "MODULE", "VERSION", "SIZE", "BLOCKS", "CRC"
    );
    for m in &container.modules {
        println!(
            "  {:<8} {:<12} {:>10} {:>7} {:>10}",
            m.name,
            m.version,
            m.size,
            m.block_count(),
            format!("0x{:08x}", m.crc)
        );
    }
    println!("  {} blocks total", container.total_blocks());
    Ok(())
}

fn show_device(port: String, baud: u32) -> Result<()> {
    let config = SessionConfig {
        port: Some(port),
        baud_rate: baud,
        ..Default::default()
    };
    let session = UpdateSession::with_observer(config, Arc::new(NullObserver));
    let modules = session.query_device()?;

    println!("  {:<8} {:<12} {}", "MODULE", "VERSION", "STATE");
    for m in &modules {
        println!("  {:<8} {:<12} {}", m.name, m.version, m.state);
    }
    Ok(())
}

fn update(config: SessionConfig) -> Result<()> {
    let session = UpdateSession::new(config);

    let modules = session.load_modules()?;
    for m in &modules {
        info!(module = %m.name, version = %m.version, blocks = m.block_count(), "Image module");
    }

    let pb = ProgressBar::new(PROGRESS_STEPS);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("[{elapsed_precise}] {bar:40.cyan/blue} {percent:>3}% {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("#>-"),
    );
    pb.set_message("updating");

    let result = session.run_modules(&modules, &mut |fraction| {
        pb.set_position((fraction * PROGRESS_STEPS as f32) as u64);
    });

    match &result {
        Ok(()) => pb.finish_with_message("done"),
        Err(_) => pb.abandon_with_message("failed"),
    }
    result
}
