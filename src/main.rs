use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use dsmr_rs::logging::init_logger_with_level;
use dsmr_rs::{
    decode_dump, log_info, BridgeStatus, DsmrBridge, DsmrConfig, DsmrEventListener, ErrorStatus,
    SerialSettings, Telegram,
};
use log::LevelFilter;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "dsmr-cli")]
#[command(about = "Read and decode DSMR P1 smart meter telegrams")]
struct Cli {
    /// More output (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Args)]
struct MeterArgs {
    /// Smarty decryption key (32 hex digits)
    #[arg(long)]
    key: Option<String>,
    /// Smarty additional authentication key
    #[arg(long)]
    additional_key: Option<String>,
    /// Keep unknown objects instead of rejecting the telegram
    #[arg(long)]
    lenient: bool,
    /// Seconds without telegram before reconnecting
    #[arg(long, default_value = "120")]
    timeout: u64,
}

impl MeterArgs {
    fn apply(self, config: &mut DsmrConfig) {
        config.decryption_key = self.key;
        if let Some(additional_key) = self.additional_key {
            config.additional_key = additional_key;
        }
        config.lenient = self.lenient;
        config.received_timeout_secs = self.timeout;
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Read from a serial port
    Serial {
        port: String,
        /// Fixed settings: "high" (115200 8N1) or "low" (9600 7E1); autodetect when omitted
        #[arg(short, long)]
        settings: Option<String>,
        #[command(flatten)]
        meter: MeterArgs,
    },
    /// Read from a TCP P1 gateway
    Tcp {
        host: String,
        port: u16,
        #[command(flatten)]
        meter: MeterArgs,
    },
    /// Read using a JSON configuration file
    Run {
        #[arg(short, long)]
        config: PathBuf,
    },
    /// Decode a captured dump and print the telegrams as JSON
    Parse {
        file: PathBuf,
        #[arg(long)]
        key: Option<String>,
        #[arg(long)]
        lenient: bool,
    },
}

/// Prints every telegram as one JSON line.
struct JsonPrinter;

impl DsmrEventListener for JsonPrinter {
    fn telegram_received(&self, telegram: &Telegram) {
        match serde_json::to_string(telegram) {
            Ok(json) => println!("{json}"),
            Err(e) => log::error!("Cannot serialize telegram: {e}"),
        }
    }

    fn error_received(&self, status: &ErrorStatus) {
        log::warn!("{status}");
    }
}

fn parse_settings(name: &str) -> Result<SerialSettings> {
    match name.to_ascii_lowercase().as_str() {
        "high" | "115200" => Ok(SerialSettings::HIGH_SPEED),
        "low" | "9600" => Ok(SerialSettings::LOW_SPEED),
        other => bail!("unknown serial settings {other:?}, use \"high\" or \"low\""),
    }
}

async fn run(config: DsmrConfig) -> Result<()> {
    let bridge = DsmrBridge::from_config(&config)?;
    bridge.add_listener(Arc::new(JsonPrinter));
    let mut status = bridge.subscribe();
    bridge.start().await?;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            changed = status.changed() => {
                if changed.is_err() {
                    break;
                }
                let current = status.borrow_and_update().clone();
                if let BridgeStatus::ConfigurationError(reason) = current {
                    bridge.stop().await;
                    bail!("configuration error: {reason}");
                }
            }
        }
    }

    bridge.stop().await;
    Ok(())
}

fn parse_file(file: PathBuf, key: Option<String>, lenient: bool) -> Result<()> {
    let data = std::fs::read(&file).with_context(|| format!("reading {}", file.display()))?;
    let config = DsmrConfig {
        decryption_key: key,
        lenient,
        ..Default::default()
    };
    let options = config.decoder_options()?;

    let mut telegrams = Vec::new();
    for result in decode_dump(&data, &options) {
        match result {
            Ok(telegram) => telegrams.push(telegram),
            Err(status) if status.is_fatal() => bail!("{status}"),
            Err(status) => log::warn!("Skipping telegram: {status}"),
        }
    }
    log_info(&format!("Decoded {} telegrams", telegrams.len()));
    println!("{}", serde_json::to_string_pretty(&telegrams)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logger_with_level(match cli.verbose {
        0 => LevelFilter::Info,
        1 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    });

    match cli.command {
        Commands::Serial {
            port,
            settings,
            meter,
        } => {
            let mut config = DsmrConfig::serial(port);
            config.serial_settings = settings.as_deref().map(parse_settings).transpose()?;
            meter.apply(&mut config);
            run(config).await
        }
        Commands::Tcp { host, port, meter } => {
            let mut config = DsmrConfig::tcp(host, port);
            meter.apply(&mut config);
            run(config).await
        }
        Commands::Run { config } => run(DsmrConfig::load(&config)?).await,
        Commands::Parse { file, key, lenient } => parse_file(file, key, lenient),
    }
}
