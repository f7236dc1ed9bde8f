use anyhow::Context;
use clap::Parser;
use frame_producer::{config, start_app};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Streams JPEG frames from a video file or webcam to the side-camera service.
#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Video file to stream. Falls back to the configured webcam when omitted.
    video: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = config::get_configuration().context("failed to load config")?;
    let log_level = config.log_level.as_str();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| log_level.into()),
        )
        .with(tracing_subscriber::fmt::layer().json().with_level(true))
        .init();

    start_app(config, args.video).await?;

    Ok(())
}
