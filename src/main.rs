use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use bouncecast::config::{self, AppConfig};
use bouncecast::session::SessionConfig;
use bouncecast::transport::{wt, ConnectionDispatcher};
use bouncecast::webrtc::{RtcPeerFactory, VideoCodec};

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

/// Codec moved to the front of the answer's video format list
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum CodecPreference {
    H264,
    /// Keep the media engine's order
    None,
}

impl CodecPreference {
    fn codec(self) -> Option<VideoCodec> {
        match self {
            CodecPreference::H264 => Some(VideoCodec::H264),
            CodecPreference::None => None,
        }
    }
}

/// bouncecast command line arguments
#[derive(Parser, Debug)]
#[command(name = "bouncecast")]
#[command(version, about = "WebTransport signaling server streaming a bouncing ball over WebRTC", long_about = None)]
struct CliArgs {
    /// TLS certificate chain (PEM)
    certificate: PathBuf,

    /// TLS private key (PEM)
    key: PathBuf,

    /// Address to listen on (default: ::1)
    #[arg(long, value_name = "ADDRESS")]
    bind_address: Option<String>,

    /// UDP port to listen on (default: 4433)
    #[arg(long, value_name = "PORT")]
    bind_port: Option<u16>,

    /// TOML configuration file
    #[arg(short = 'c', long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Frame rate of the generated video
    #[arg(long, value_name = "FPS")]
    fps: Option<u32>,

    /// Write every generated frame into this directory
    #[arg(long, value_name = "DIR")]
    save_frames: Option<PathBuf>,

    /// Codec moved to the front of the answer (h264, none)
    #[arg(long, value_name = "CODEC")]
    prefer_codec: Option<CodecPreference>,

    /// Log level (error, warn, info, verbose, debug, trace)
    #[arg(short = 'l', long, value_name = "LEVEL", default_value = "info")]
    log_level: LogLevel,

    /// Increase verbosity (-v for verbose, -vv for debug, -vvv for trace)
    #[arg(short = 'v', long, action = clap::ArgAction::Count)]
    verbose: u8,
}

impl CliArgs {
    /// Command line flags take precedence over the configuration file
    fn apply(&self, config: &mut AppConfig) {
        config.server.certificate = self.certificate.clone();
        config.server.key = self.key.clone();
        if let Some(ref address) = self.bind_address {
            config.server.bind_address = address.clone();
        }
        if let Some(port) = self.bind_port {
            config.server.bind_port = port;
        }
        if let Some(fps) = self.fps {
            config.video.fps = fps;
        }
        if let Some(ref dir) = self.save_frames {
            config.video.save_frames_dir = Some(dir.clone());
        }
        if let Some(preference) = self.prefer_codec {
            config.webrtc.preferred_codec = preference.codec();
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = CliArgs::parse();
    init_logging(args.log_level, args.verbose);

    tracing::info!("Starting bouncecast v{}", env!("CARGO_PKG_VERSION"));

    let mut config = config::load(args.config.as_deref())?;
    args.apply(&mut config);
    config.validate()?;

    tracing::info!(
        "Video: {} @ {} fps, preferred codec: {}",
        config.video.resolution(),
        config.video.fps,
        config
            .webrtc
            .preferred_codec
            .map(|c| c.to_string())
            .unwrap_or_else(|| "none".to_string())
    );
    if let Some(ref dir) = config.video.save_frames_dir {
        tracing::info!("Saving frames to {}", dir.display());
    }

    let endpoint = wt::bind(&config.server).await?;

    let peers = Arc::new(RtcPeerFactory::new(config.webrtc.clone(), config.video.fps));
    let dispatcher = Arc::new(ConnectionDispatcher::new(
        SessionConfig::from(&config),
        peers,
    ));

    let shutdown = CancellationToken::new();
    let mut server = tokio::spawn(wt::serve(endpoint, dispatcher.clone(), shutdown.clone()));

    let finished = tokio::select! {
        _ = shutdown_signal() => None,
        result = &mut server => Some(result),
    };
    let result = match finished {
        Some(result) => result,
        None => {
            shutdown.cancel();
            server.await
        }
    };
    result??;

    tracing::info!(
        "Server shutdown complete ({} sessions accepted, {} rejected)",
        dispatcher.accepted(),
        dispatcher.rejected()
    );
    Ok(())
}

/// Resolves on SIGINT or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to install CTRL+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    tracing::info!("Shutdown signal received");
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
        LogLevel::Error => "bouncecast=error,webrtc=error,wtransport=error",
        LogLevel::Warn => "bouncecast=warn,webrtc=warn,wtransport=warn",
        LogLevel::Info => "bouncecast=info,webrtc=warn,wtransport=warn",
        LogLevel::Verbose => "bouncecast=debug,webrtc=warn,wtransport=info",
        LogLevel::Debug => "bouncecast=debug,webrtc=info,wtransport=debug",
        LogLevel::Trace => "bouncecast=trace,webrtc=debug,wtransport=debug",
    };

    // Environment variable takes highest priority
    let env_filter =
        tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into());

    if let Err(err) = tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init()
    {
        eprintln!("failed to initialize tracing: {}", err);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_defaults_keep_config_values() {
        let args = CliArgs::parse_from(["bouncecast", "cert.pem", "key.pem"]);
        let mut config = AppConfig::default();
        args.apply(&mut config);

        assert_eq!(config.server.bind_address, "::1");
        assert_eq!(config.server.bind_port, 4433);
        assert_eq!(config.server.certificate, PathBuf::from("cert.pem"));
        assert_eq!(config.webrtc.preferred_codec, Some(VideoCodec::H264));
    }

    #[test]
    fn test_cli_overrides() {
        let args = CliArgs::parse_from([
            "bouncecast",
            "/tls/cert.pem",
            "/tls/key.pem",
            "--bind-address",
            "0.0.0.0",
            "--bind-port",
            "9000",
            "--fps",
            "15",
            "--save-frames",
            "saved_frames",
            "--prefer-codec",
            "none",
            "-vv",
        ]);
        let mut config = AppConfig::default();
        args.apply(&mut config);

        assert_eq!(config.server.bind_address, "0.0.0.0");
        assert_eq!(config.server.bind_port, 9000);
        assert_eq!(config.server.key, PathBuf::from("/tls/key.pem"));
        assert_eq!(config.video.fps, 15);
        assert_eq!(
            config.video.save_frames_dir,
            Some(PathBuf::from("saved_frames"))
        );
        assert_eq!(config.webrtc.preferred_codec, None);
        assert_eq!(args.verbose, 2);
    }

    #[test]
    fn test_prefer_codec_accepts_only_sendable_codecs() {
        let args =
            CliArgs::parse_from(["bouncecast", "c.pem", "k.pem", "--prefer-codec", "h264"]);
        let mut config = AppConfig::default();
        config.webrtc.preferred_codec = None;
        args.apply(&mut config);
        assert_eq!(config.webrtc.preferred_codec, Some(VideoCodec::H264));

        assert!(
            CliArgs::try_parse_from(["bouncecast", "c.pem", "k.pem", "--prefer-codec", "vp8"])
                .is_err()
        );
    }

    #[test]
    fn test_certificate_and_key_are_required() {
        assert!(CliArgs::try_parse_from(["bouncecast", "cert.pem"]).is_err());
    }
}
