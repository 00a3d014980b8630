//! Stream a file or stdin to an SRT receiver.

use anyhow::Context;
use bytes::Bytes;
use clap::Parser;
use srt_live::{SessionError, SrtSession};
use srt_tools::{display_stats, ToolConfig, TransferOptions};
use std::io::Read;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::{Duration, Instant};

#[derive(Parser, Debug)]
#[command(name = "srt-sender")]
#[command(about = "Send a file or stdin over SRT", long_about = None)]
struct Args {
    /// Receiver address (host:port)
    #[arg(short, long)]
    target: SocketAddr,

    /// Local bind address
    #[arg(short, long, default_value = "0.0.0.0:0")]
    bind: SocketAddr,

    /// Input file, '-' for stdin
    #[arg(short, long, default_value = "-")]
    input: String,

    /// Optional TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Encryption passphrase (enables AES-256)
    #[arg(short, long)]
    passphrase: Option<String>,

    /// Playback latency in milliseconds
    #[arg(short, long)]
    latency: Option<u32>,

    /// Chunk size per message
    #[arg(long, default_value = "1316")]
    chunk: usize,
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

fn open_input(input: &str) -> anyhow::Result<Box<dyn Read>> {
    if input == "-" {
        Ok(Box::new(std::io::stdin()))
    } else {
        let file = std::fs::File::open(input).with_context(|| format!("opening {input}"))?;
        Ok(Box::new(std::io::BufReader::new(file)))
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

    tracing::info!(target = %args.target, "connecting");
    let session = SrtSession::connect(args.bind, args.target, config)?;
    tracing::info!("connected");

    let mut reader = open_input(&args.input)?;
    let mut buf = vec![0u8; args.chunk];
    let mut last_stats = Instant::now();

    loop {
        let read = reader.read(&mut buf)?;
        if read == 0 {
            break;
        }
        let mut payload = Bytes::copy_from_slice(&buf[..read]);
        loop {
            match session.send(payload) {
                Ok(()) => break,
                Err(SessionError::WouldBlock) => {
                    std::thread::sleep(Duration::from_millis(5));
                    payload = Bytes::copy_from_slice(&buf[..read]);
                }
                Err(err) => return Err(err.into()),
            }
        }

        if last_stats.elapsed() >= stats_interval {
            println!("{}", display_stats(&session.stats()));
            last_stats = Instant::now();
        }
    }

    // give the retransmission machinery a moment to settle
    std::thread::sleep(Duration::from_millis(200));
    println!("{}", display_stats(&session.stats()));
    session.close();
    Ok(())
}
