use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

use vidcast::cache::ConversionCache;
use vidcast::config::Config;
use vidcast::converter::{FfmpegTranscoder, PlayableSource, ProgressSink, VideoConverter};
use vidcast::media::HardwareCapabilities;
use vidcast::network::{CastDeviceRegistry, CastSessionManager, RustCastConnector};
use vidcast::orchestrator::{PlayOutcome, PlaybackOrchestrator};
use vidcast::player::HeadlessPlayer;
use vidcast::server::RangeFileServer;
use vidcast::{format_time, CastDevice, PlayMode};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Config file (defaults to the platform config dir)
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Serve a directory with byte-range support until interrupted
    Serve { dir: PathBuf },

    /// List cast receivers on the local network
    Discover {
        #[arg(short, long, default_value = "5")]
        seconds: u64,
    },

    /// Stream a file to a receiver
    Cast {
        file: PathBuf,

        /// Receiver name or UUID
        #[arg(short, long)]
        device: String,

        /// How long to look for the receiver
        #[arg(short, long, default_value = "10")]
        timeout: u64,
    },

    /// Produce the cast-compatible copy of a file
    Convert { file: PathBuf },

    /// Show detected hardware encoders
    Caps,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info"))
        )
        .init();

    let config = match &args.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };

    match args.command {
        Command::Serve { dir } => serve(&config, dir).await,
        Command::Discover { seconds } => discover(&config, seconds).await,
        Command::Cast { file, device, timeout } => cast(&config, file, &device, timeout).await,
        Command::Convert { file } => convert(&config, file).await,
        Command::Caps => {
            let caps = HardwareCapabilities::detect().await;
            println!("{}", serde_json::to_string_pretty(&caps)?);
            Ok(())
        }
    }
}

async fn serve(config: &Config, dir: PathBuf) -> anyhow::Result<()> {
    let server = RangeFileServer::new(&config.server);
    let port = server.start(&dir).await?;
    println!("Serving {} on http://{}:{}/", dir.display(), vidcast::server::local_ip(), port);

    tokio::signal::ctrl_c().await?;
    server.stop().await;
    Ok(())
}

async fn discover(config: &Config, seconds: u64) -> anyhow::Result<()> {
    let mut registry = CastDeviceRegistry::new(&config.discovery);
    let mut updates = registry.discover()?;
    let mut printed = std::collections::HashSet::new();

    let deadline = tokio::time::sleep(Duration::from_secs(seconds));
    tokio::pin!(deadline);
    loop {
        tokio::select! {
            _ = &mut deadline => break,
            snapshot = updates.recv() => {
                let Some(devices) = snapshot else { break };
                for device in devices {
                    if printed.insert(device.id) {
                        print_device(&device);
                    }
                }
            }
        }
    }
    registry.stop_discovery()?;

    if printed.is_empty() {
        println!("No receivers found");
    }
    Ok(())
}

fn print_device(device: &CastDevice) {
    println!(
        "{}  {:<24} {:<20} {}:{}{}",
        device.id,
        device.name,
        device.model_name,
        device.address,
        device.port,
        if device.is_group { "  (group)" } else { "" }
    );
}

async fn build_converter(config: &Config) -> anyhow::Result<VideoConverter> {
    let caps = HardwareCapabilities::detect().await;
    let cache = ConversionCache::new(&config.cache).await?;
    let transcoder = Arc::new(FfmpegTranscoder::new(caps.vaapi_device.clone()));
    Ok(VideoConverter::new(cache, caps, transcoder).await?)
}

fn print_progress() -> ProgressSink {
    Arc::new(|line: &str| println!("{}", line))
}

async fn convert(config: &Config, file: PathBuf) -> anyhow::Result<()> {
    let converter = build_converter(config).await?;
    let output = converter.ensure_playable(&file, Some(print_progress())).await?;
    println!("{}", output.display());
    Ok(())
}

/// Waits until the registry reports a receiver matching `wanted`.
async fn find_device(registry: &mut CastDeviceRegistry, wanted: &str, timeout: u64) -> anyhow::Result<CastDevice> {
    let mut updates = registry.discover()?;
    let search = async {
        loop {
            if let Some(device) = registry.find_by_name(wanted) {
                return Some(device);
            }
            updates.recv().await?;
        }
    };

    match tokio::time::timeout(Duration::from_secs(timeout), search).await {
        Ok(Some(device)) => Ok(device),
        _ => anyhow::bail!("No receiver named {:?} found within {}s", wanted, timeout),
    }
}

async fn cast(config: &Config, file: PathBuf, wanted: &str, timeout: u64) -> anyhow::Result<()> {
    let mut registry = CastDeviceRegistry::new(&config.discovery);
    let device = find_device(&mut registry, wanted, timeout).await?;

    let session = Arc::new(CastSessionManager::new(Arc::new(RustCastConnector), config.cast.clone()));
    session.adopt_registry(registry).await;
    session.connect(&device).await?;

    let converter: Arc<dyn PlayableSource> = Arc::new(build_converter(config).await?);
    let mut orchestrator = PlaybackOrchestrator::new(
        Box::new(HeadlessPlayer::new()),
        converter,
        Arc::new(RangeFileServer::new(&config.server)),
        session.clone(),
    );
    orchestrator.set_progress_sink(Some(print_progress()));

    orchestrator.switch_mode(PlayMode::Cast).await?;
    orchestrator.load(&file).await?;
    let result = orchestrator.play().await;

    match result {
        Ok(PlayOutcome::CastStarted(start)) => {
            if let Some(e) = &start.conversion_error {
                eprintln!("Conversion failed, streaming original: {}", e);
            }
            println!("Streaming {} to {} ({})", start.served_path.display(), device.name, start.url);
        }
        Ok(_) => {}
        Err(e) => {
            orchestrator.shutdown().await;
            return Err(e.into());
        }
    }

    let mut ticker = tokio::time::interval(Duration::from_secs(5));
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = ticker.tick() => {
                let position = orchestrator.position().await;
                let duration = orchestrator.duration().await.unwrap_or(0.0);
                println!("{} / {}", format_time(position), format_time(duration));
            }
        }
    }

    orchestrator.shutdown().await;
    Ok(())
}
