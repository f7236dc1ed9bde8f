use crate::client::{ClientError, SideCameraClient};
use crate::config::Config;
use crate::producer::FrameProducer;
use crate::source::{FrameSource, SourceError, VideoSource};
use std::future::Future;
use std::path::PathBuf;
use thiserror::Error;
use tokio::{signal, sync::broadcast, task::JoinError};

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Video source error: {0}")]
    Source(#[from] SourceError),
    #[error("Client error: {0}")]
    Client(#[from] ClientError),
    #[error("Capture worker failed: {0}")]
    CaptureWorker(#[from] JoinError),
}

pub async fn start_app(config: Config, video: Option<PathBuf>) -> Result<(), AppError> {
    let source = VideoSource::from_arg(video, config.camera.device_index);
    let capture = match source.open() {
        Ok(capture) => capture,
        Err(e) => {
            tracing::error!("Failed to open video source: {}", e);
            return Err(e.into());
        }
    };
    tracing::info!("Opened {}", source.describe());

    stream_source(config, capture, shutdown_signal()).await
}

/// Connects and streams `capture` until it runs dry, the call fails, or
/// `shutdown` resolves. `capture` is released before this returns on every
/// path, including a shutdown while still connecting.
async fn stream_source<S, F>(config: Config, capture: S, shutdown: F) -> Result<(), AppError>
where
    S: FrameSource,
    F: Future<Output = ()>,
{
    tokio::pin!(shutdown);

    let mut client = tokio::select! {
        biased;
        _ = &mut shutdown => {
            tracing::info!("Shutdown signal received while connecting, releasing capture");
            return Ok(());
        }
        client = SideCameraClient::connect(config.server.get_address()) => client?,
    };

    let observer = config.observe_predictions.then(|| {
        let mut observer = client.clone();
        tokio::spawn(async move {
            match observer.observe_predictions().await {
                Ok(()) => {}
                Err(ClientError::PredictionsUnavailable(reason)) => {
                    tracing::info!("Prediction observer not started: {}", reason)
                }
                Err(e) => tracing::warn!("Prediction observer stopped: {}", e),
            }
        })
    });

    let (shutdown_tx, _) = broadcast::channel(1);
    let producer = FrameProducer::new(&config.camera);
    tracing::info!(camera_id = producer.camera_id(), "Streaming frames");
    let (frames, capture_handle) = producer.spawn(capture, shutdown_tx.subscribe());

    let result = tokio::select! {
        result = client.submit(frames) => result,
        _ = &mut shutdown => {
            tracing::info!("Shutdown signal received, stopping client");
            Ok(())
        }
    };

    let _ = shutdown_tx.send(());
    let summary = capture_handle.await?;
    tracing::info!(
        emitted = summary.emitted,
        skipped = summary.skipped,
        "Capture released"
    );

    if let Some(observer) = observer {
        observer.abort();
    }

    if let Err(ref e) = result {
        tracing::error!("gRPC error: {}", e);
    }
    result.map_err(AppError::from)
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut terminate) => {
                terminate.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install signal handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CameraConfig, LogLevel, ServerConfig};

    use opencv::core::Mat;
    use std::sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    };
    use std::time::Duration;

    fn test_config() -> Config {
        Config {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 1,
            },
            log_level: LogLevel::Info,
            camera: CameraConfig {
                camera_id: "test_camera".to_string(),
                device_index: 0,
                stream_fps: 30,
                jpeg_quality: 90,
                buffer_size: 5,
            },
            observe_predictions: true,
        }
    }

    struct TrackedSource {
        released: Arc<AtomicBool>,
    }

    impl FrameSource for TrackedSource {
        fn read_frame(&mut self) -> Result<Option<Mat>, SourceError> {
            Ok(None)
        }
    }

    impl Drop for TrackedSource {
        fn drop(&mut self) {
            self.released.store(true, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn test_missing_file_aborts_before_connecting() {
        let result = start_app(test_config(), Some(PathBuf::from("/nonexistent/clip.mp4"))).await;

        assert!(matches!(
            result,
            Err(AppError::Source(SourceError::FileNotFound(_)))
        ));
    }

    #[tokio::test]
    async fn test_shutdown_while_connecting_releases_capture() {
        let released = Arc::new(AtomicBool::new(false));
        let source = TrackedSource {
            released: released.clone(),
        };
        let shutdown = tokio::time::sleep(Duration::from_millis(100));

        let result = tokio::time::timeout(
            Duration::from_secs(5),
            stream_source(test_config(), source, shutdown),
        )
        .await
        .unwrap();

        assert!(result.is_ok());
        assert!(released.load(Ordering::SeqCst));
    }
}
