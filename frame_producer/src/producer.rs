use crate::config::CameraConfig;
use crate::encoder::encode_jpeg;
use crate::source::FrameSource;
use side_camera_proto::{unix_timestamp_ms, SubmitCameraFrameRequest};
use std::time::Duration;
use tokio::{
    sync::{broadcast, broadcast::error::TryRecvError, mpsc},
    task::JoinHandle,
};
use tokio_stream::wrappers::ReceiverStream;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CaptureSummary {
    pub emitted: u64,
    pub skipped: u64,
}

/// Turns a frame source into a paced stream of frame messages.
#[derive(Debug, Clone)]
pub struct FrameProducer {
    camera_id: String,
    frame_interval: Duration,
    jpeg_quality: i32,
    buffer_size: usize,
}

impl FrameProducer {
    pub fn new(camera_config: &CameraConfig) -> Self {
        Self {
            camera_id: camera_config.camera_id.clone(),
            frame_interval: camera_config.get_frame_interval(),
            jpeg_quality: camera_config.jpeg_quality,
            buffer_size: camera_config.buffer_size.max(1),
        }
    }

    pub fn camera_id(&self) -> &str {
        &self.camera_id
    }

    /// Starts the capture worker. The stream ends when the source runs dry, the
    /// receiver is dropped, or `shutdown_rx` fires. The source is released
    /// before the returned handle resolves.
    pub fn spawn<S: FrameSource>(
        self,
        source: S,
        shutdown_rx: broadcast::Receiver<()>,
    ) -> (
        ReceiverStream<SubmitCameraFrameRequest>,
        JoinHandle<CaptureSummary>,
    ) {
        let (tx, rx) = mpsc::channel(self.buffer_size);
        let handle =
            tokio::task::spawn_blocking(move || self.capture_loop(source, tx, shutdown_rx));
        (ReceiverStream::new(rx), handle)
    }

    fn capture_loop<S: FrameSource>(
        self,
        mut source: S,
        tx: mpsc::Sender<SubmitCameraFrameRequest>,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) -> CaptureSummary {
        let mut summary = CaptureSummary::default();

        loop {
            match shutdown_rx.try_recv() {
                Ok(()) | Err(TryRecvError::Lagged(_)) => {
                    tracing::info!("Capture received shutdown signal");
                    break;
                }
                Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => {}
            }

            let frame = match source.read_frame() {
                Ok(Some(frame)) => frame,
                Ok(None) => {
                    tracing::info!("End of video stream");
                    break;
                }
                Err(e) => {
                    tracing::warn!("Stopping capture after read error: {:?}", e);
                    break;
                }
            };

            let image_data = match encode_jpeg(&frame, self.jpeg_quality) {
                Ok(image_data) => image_data,
                Err(e) => {
                    tracing::warn!("Skipping frame: {:?}", e);
                    summary.skipped += 1;
                    continue;
                }
            };

            let request = self.frame_request(image_data);
            if tx.blocking_send(request).is_err() {
                tracing::info!("Outbound stream closed, stopping capture");
                break;
            }
            summary.emitted += 1;

            std::thread::sleep(self.frame_interval);
        }

        drop(source);
        tracing::info!(
            emitted = summary.emitted,
            skipped = summary.skipped,
            "Capture stopped"
        );
        summary
    }

    fn frame_request(&self, image_data: Vec<u8>) -> SubmitCameraFrameRequest {
        SubmitCameraFrameRequest {
            image_data,
            camera_id: Some(self.camera_id.clone()),
            timestamp: Some(unix_timestamp_ms()),
        }
    }
}
