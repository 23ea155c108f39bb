use std::fs::File;
use std::io::BufReader;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use clap::{Parser, Subcommand, ValueEnum};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use confab_media::audio::list_capture_devices;
use confab_media::capture::channel::ChannelPacket;
use confab_media::capture::{
    list_sources, CameraSource, CaptureTarget, ChannelDecoder, MediaSink, MicrophoneSource,
    ScreenSource,
};
use confab_media::config::{ConfigStore, EngineConfig};
use confab_media::events::{EventBus, MediaEvent};
use confab_media::video::AccessUnit;
use confab_media::webrtc::StreamKind;

/// Log level for the application
#[derive(Debug, Clone, Copy, Default, ValueEnum)]
enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Verbose,
    Debug,
    Trace,
}

/// confab-media command line arguments
#[derive(Parser, Debug)]
#[command(name = "confab-media")]
#[command(version, about = "Media engine tools for relay-based calls", long_about = None)]
struct CliArgs {
    /// Engine configuration file (TOML)
    #[arg(short = 'c', long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// Log level (error, warn, info, verbose, debug, trace)
    #[arg(short = 'l', long, value_name = "LEVEL", default_value = "info", global = true)]
    log_level: LogLevel,

    /// Increase verbosity (-v for verbose, -vv for debug, -vvv for trace)
    #[arg(short = 'v', long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List capture sources reported by the helper
    Sources {
        /// Only enumerate microphones
        #[arg(long)]
        microphones_only: bool,

        /// List local ALSA capture devices instead
        #[arg(long)]
        alsa: bool,
    },
    /// Decode a saved helper auxiliary stream and summarize it
    Inspect {
        /// File holding raw helper stderr output
        file: PathBuf,
    },
    /// Run one capture source and log what it produces until Ctrl-C
    Capture {
        source: SourceArg,

        /// Device, display, window or application id
        #[arg(long)]
        id: String,

        /// What `--id` names when capturing the screen
        #[arg(long, value_enum, default_value = "display")]
        target: ScreenTargetArg,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum SourceArg {
    Camera,
    Screen,
    Microphone,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ScreenTargetArg {
    Display,
    Window,
    App,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = CliArgs::parse();
    init_logging(args.log_level, args.verbose);

    tracing::info!("confab-media v{}", env!("CARGO_PKG_VERSION"));

    let store = ConfigStore::load(args.config.as_deref()).await?;
    let config = store.get();

    match args.command {
        Command::Sources {
            microphones_only,
            alsa,
        } => run_sources(&config, microphones_only, alsa).await,
        Command::Inspect { file } => run_inspect(file).await,
        Command::Capture { source, id, target } => run_capture(&config, source, id, target).await,
    }
}

async fn run_sources(config: &EngineConfig, microphones_only: bool, alsa: bool) -> anyhow::Result<()> {
    if alsa {
        let devices = tokio::task::spawn_blocking(list_capture_devices).await?;
        println!("{}", serde_json::to_string_pretty(&devices)?);
        return Ok(());
    }

    let sources = list_sources(&config.capture.helper_path, microphones_only).await?;
    if sources.is_empty() {
        tracing::warn!("Helper reported no capture sources");
    }
    println!("{}", serde_json::to_string_pretty(&sources)?);
    Ok(())
}

#[derive(Debug, Default)]
struct InspectSummary {
    audio_packets: u64,
    audio_frames: u64,
    legacy_headers: u64,
    preview_frames: u64,
    log_records: u64,
    skipped_bytes: u64,
}

async fn run_inspect(path: PathBuf) -> anyhow::Result<()> {
    let summary = tokio::task::spawn_blocking(move || -> anyhow::Result<InspectSummary> {
        let file = File::open(&path)?;
        let mut decoder = ChannelDecoder::new(BufReader::new(file));
        let mut summary = InspectSummary::default();

        while let Some(packet) = decoder.next_packet()? {
            match packet {
                ChannelPacket::Audio(audio) => {
                    summary.audio_packets += 1;
                    summary.audio_frames += audio.header.sample_count as u64;
                    if audio.header.is_legacy() {
                        summary.legacy_headers += 1;
                    }
                }
                ChannelPacket::Preview(frame) => {
                    summary.preview_frames += 1;
                    tracing::debug!(
                        "Preview {}x{} {:?} at {}ms",
                        frame.width,
                        frame.height,
                        frame.format,
                        frame.timestamp
                    );
                }
                ChannelPacket::Log(record) => {
                    summary.log_records += 1;
                    println!("[{:?}] {}", record.severity, record.message);
                }
            }
        }
        summary.skipped_bytes = decoder.skipped_bytes();
        Ok(summary)
    })
    .await??;

    println!(
        "audio packets: {} ({} frames, {} legacy)",
        summary.audio_packets, summary.audio_frames, summary.legacy_headers
    );
    println!("preview frames: {}", summary.preview_frames);
    println!("log records: {}", summary.log_records);
    println!("skipped bytes: {}", summary.skipped_bytes);
    Ok(())
}

/// Sink that logs media instead of sending it
#[derive(Default)]
struct LoggingSink {
    units: AtomicU64,
    audio_frames: AtomicU64,
}

impl MediaSink for LoggingSink {
    fn send_access_unit(&self, kind: StreamKind, unit: AccessUnit) -> confab_media::Result<usize> {
        let n = self.units.fetch_add(1, Ordering::Relaxed) + 1;
        if unit.keyframe || n % 100 == 0 {
            tracing::info!(
                "{}: unit #{} ({} NALs, {} bytes{})",
                kind,
                n,
                unit.nal_count(),
                unit.payload_len(),
                if unit.keyframe { ", keyframe" } else { "" }
            );
        }
        Ok(unit.nal_count())
    }

    fn send_audio_frame(&self, kind: StreamKind, frame: Bytes) -> confab_media::Result<()> {
        let n = self.audio_frames.fetch_add(1, Ordering::Relaxed) + 1;
        if n % 250 == 0 {
            tracing::info!("{}: {} Opus frames ({} bytes last)", kind, n, frame.len());
        }
        Ok(())
    }

    fn set_frame_rate(&self, kind: StreamKind, fps: u32) {
        tracing::info!("{} configured at {} fps", kind, fps);
    }
}

async fn run_capture(
    config: &EngineConfig,
    source: SourceArg,
    id: String,
    target: ScreenTargetArg,
) -> anyhow::Result<()> {
    let events = Arc::new(EventBus::new());
    let mut rx = events.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = rx.recv().await {
            match event {
                MediaEvent::CaptureStateChanged { kind, state, reason } => {
                    tracing::info!(
                        "{} capture {}{}",
                        kind,
                        state,
                        reason.map(|r| format!(": {}", r)).unwrap_or_default()
                    );
                }
                MediaEvent::SpeakingChanged { speaking } => {
                    tracing::info!("Speaking: {}", speaking);
                }
                _ => {}
            }
        }
    });

    let sink = Arc::new(LoggingSink::default());
    let media_sink: Arc<dyn MediaSink> = sink.clone();

    let shutdown_signal = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for shutdown signal: {}", e);
        }
        tracing::info!("Shutdown signal received");
    };

    match source {
        SourceArg::Camera => {
            let camera = CameraSource::new(&config.capture, media_sink, Some(events));
            camera.start(&id).await?;
            tokio::select! {
                _ = shutdown_signal => {}
                _ = camera.wait() => tracing::info!("Camera helper exited"),
            }
            camera.stop().await;
            tracing::info!(
                "Camera: {} units, {} keyframes, {} skipped diagnostic bytes",
                camera.video_stats().units(),
                camera.video_stats().keyframes(),
                camera.skipped_bytes()
            );
        }
        SourceArg::Screen => {
            let target = match target {
                ScreenTargetArg::Display => CaptureTarget::Display(id),
                ScreenTargetArg::Window => CaptureTarget::Window(id),
                ScreenTargetArg::App => CaptureTarget::App(id),
            };
            let screen = ScreenSource::new(&config.capture, &config.audio.opus, media_sink, Some(events));
            screen.start(target).await?;
            tokio::select! {
                _ = shutdown_signal => {}
                _ = screen.wait() => tracing::info!("Screen helper exited"),
            }
            screen.stop().await;
            tracing::info!(
                "Screen: {} units, {} audio frames, {} skipped diagnostic bytes",
                screen.video_stats().units(),
                screen.audio_stats().frames_sent(),
                screen.skipped_bytes()
            );
        }
        SourceArg::Microphone => {
            let mic = MicrophoneSource::new(&config.capture, &config.audio, media_sink, Some(events));
            mic.start(&id).await?;
            tokio::select! {
                _ = shutdown_signal => {}
                _ = mic.wait() => tracing::info!("Microphone capture exited"),
            }
            mic.stop().await;
            tracing::info!("Microphone: {} audio frames", mic.stats().frames_sent());
        }
    }

    Ok(())
}

/// Initialize logging with tracing
fn init_logging(level: LogLevel, verbose_count: u8) {
    // Verbose count overrides log level
    let effective_level = match verbose_count {
        0 => level,
        1 => LogLevel::Verbose,
        2 => LogLevel::Debug,
        _ => LogLevel::Trace,
    };

    let filter = match effective_level {
        LogLevel::Error => "confab_media=error,webrtc=error",
        LogLevel::Warn => "confab_media=warn,webrtc=warn",
        LogLevel::Info => "confab_media=info,webrtc=warn",
        LogLevel::Verbose => "confab_media=debug,webrtc=warn",
        LogLevel::Debug => "confab_media=debug,webrtc=info",
        LogLevel::Trace => "confab_media=trace,webrtc=debug",
    };

    // Environment variable takes highest priority
    let env_filter =
        tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into());

    if let Err(err) = tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .try_init()
    {
        eprintln!("failed to initialize tracing: {}", err);
    }
}
