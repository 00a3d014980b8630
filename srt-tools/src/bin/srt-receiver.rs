//! Receive an SRT stream into a file or stdout.

use anyhow::Context;
use clap::Parser;
use srt_live::{SessionError, SrtSession};
use srt_tools::{display_stats, ToolConfig, TransferOptions};
use std::io::Write;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::{Duration, Instant};

#[derive(Parser, Debug)]
#[command(name = "srt-receiver")]
#[command(about = "Receive an SRT stream", long_about = None)]
struct Args {
    /// Listen address (host:port)
    #[arg(short, long)]
    listen: SocketAddr,

    /// Output file, '-' for stdout
    #[arg(short, long, default_value = "-")]
    output: String,

    /// Optional TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Encryption passphrase (enables AES-256)
    #[arg(short, long)]
    passphrase: Option<String>,

    /// Playback latency in milliseconds
    #[arg(long)]
    latency: Option<u32>,
}

fn options_from(args: &Args) -> anyhow::Result<TransferOptions> {
    let mut options = match &args.config {
        Some(path) => {
            ToolConfig::from_file(path)
                .with_context(|| format!("loading {}", path.display()))?
                .transfer
        }
        None => TransferOptions::default(),
    };
    if let Some(passphrase) = &args.passphrase {
        options.encryption = "aes256".to_string();
        options.passphrase = Some(passphrase.clone());
    }
    if let Some(latency) = args.latency {
        options.latency_ms = latency;
    }
    Ok(options)
}

fn open_output(output: &str) -> anyhow::Result<Box<dyn Write>> {
    if output == "-" {
        Ok(Box::new(std::io::stdout()))
    } else {
        let file = std::fs::File::create(output).with_context(|| format!("creating {output}"))?;
        Ok(Box::new(std::io::BufWriter::new(file)))
    }
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    let options = options_from(&args)?;
    let stats_interval = Duration::from_secs(options.stats_interval_secs.max(1));
    let config = options.to_srt_config()?;

    tracing::info!(listen = %args.listen, "waiting for a caller");
    let session = SrtSession::accept(args.listen, config)?;
    tracing::info!("connected");

    let mut writer = open_output(&args.output)?;
    let mut last_stats = Instant::now();

    loop {
        match session.recv_timeout(Duration::from_millis(500)) {
            Ok(Some(payload)) => {
                writer.write_all(&payload)?;
            }
            Ok(None) => {
                writer.flush()?;
            }
            Err(SessionError::Closed(reason)) => {
                tracing::info!(?reason, "stream ended");
                break;
            }
            Err(err) => return Err(err.into()),
        }

        if last_stats.elapsed() >= stats_interval {
            eprintln!("{}", display_stats(&session.stats()));
            last_stats = Instant::now();
        }
    }

    writer.flush()?;
    eprintln!("{}", display_stats(&session.stats()));
    session.close();
    Ok(())
}
