use crate::codec::{decode_frame, DecodedFrame, FrameMetadata};
use crate::display::{DisplayContext, DisplayError, DisplaySession, DisplaySink};
use futures::{Stream, StreamExt};
use side_camera_proto::{
    side_camera_image_service_server::SideCameraImageService, unix_timestamp_ms, Empty,
    ObservePredictionsResponse, SubmitCameraFrameRequest,
};
use std::pin::Pin;
use tokio::sync::broadcast;
use tonic::{async_trait, Request, Response, Status, Streaming};
use tracing::instrument;

/// What happened to one inbound stream.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct StreamSummary {
    /// Frames decoded and handed to the display.
    pub received: u64,
    pub decode_failures: u64,
    pub display_failures: u64,
    pub interrupted: bool,
}

pub struct SideCameraService<D: DisplaySink> {
    display: DisplayContext<D>,
}

impl<D: DisplaySink> Clone for SideCameraService<D> {
    fn clone(&self) -> Self {
        Self {
            display: self.display.clone(),
        }
    }
}

impl<D: DisplaySink> SideCameraService<D> {
    pub fn new(display: DisplayContext<D>) -> Self {
        Self { display }
    }

    /// Decodes and displays every frame of one call, in order. Bad frames are
    /// skipped; a transport error ends the call. The call's surfaces are torn
    /// down on every exit path.
    pub async fn consume_frames<S>(&self, frames: S) -> Result<StreamSummary, Status>
    where
        S: Stream<Item = Result<SubmitCameraFrameRequest, Status>> + Unpin,
    {
        let mut interrupt = self.display.interrupt().subscribe();
        let mut session = self.display.session();
        tracing::info!(session = session.id(), "Receiving stream of images");

        let result = receive_frames(frames, &mut session, &mut interrupt).await;

        session.close();
        match &result {
            Ok(summary) => tracing::info!(
                session = session.id(),
                received = summary.received,
                decode_failures = summary.decode_failures,
                display_failures = summary.display_failures,
                interrupted = summary.interrupted,
                "Stream closed"
            ),
            Err(status) => tracing::error!(
                session = session.id(),
                "Error processing stream: {}",
                status
            ),
        }
        result
    }
}

async fn receive_frames<S, D>(
    mut frames: S,
    session: &mut DisplaySession<D>,
    interrupt: &mut broadcast::Receiver<()>,
) -> Result<StreamSummary, Status>
where
    S: Stream<Item = Result<SubmitCameraFrameRequest, Status>> + Unpin,
    D: DisplaySink,
{
    let mut summary = StreamSummary::default();

    loop {
        let next = tokio::select! {
            biased;
            _ = interrupt.recv() => {
                tracing::info!(session = session.id(), "Operator interrupt, closing stream");
                summary.interrupted = true;
                break;
            }
            next = frames.next() => next,
        };

        let request = match next {
            Some(Ok(request)) => request,
            Some(Err(status)) => return Err(status),
            None => break,
        };
        let received_at = unix_timestamp_ms();

        let image = match decode_frame(&request.image_data) {
            Ok(image) => image,
            Err(e) => {
                summary.decode_failures += 1;
                tracing::warn!("Failed to decode image: {}", e);
                continue;
            }
        };

        let metadata = FrameMetadata::resolve(
            request.camera_id.as_deref(),
            request.timestamp,
            received_at,
        );
        let frame = DecodedFrame { metadata, image };
        tracing::info!(
            camera_id = frame.camera_id(),
            timestamp = frame.metadata.timestamp,
            width = frame.width(),
            height = frame.height(),
            "Received frame"
        );
        summary.received += 1;

        match session.show(frame) {
            Ok(()) => {}
            Err(DisplayError::SurfaceBusy(camera_id)) => {
                return Err(Status::already_exists(format!(
                    "camera {} is already streaming",
                    camera_id
                )))
            }
            Err(e) => {
                summary.display_failures += 1;
                tracing::warn!("Failed to display frame: {}", e);
            }
        }
    }

    Ok(summary)
}

#[async_trait]
impl<D: DisplaySink> SideCameraImageService for SideCameraService<D> {
    #[instrument(skip(self, request))]
    async fn submit_side_camera_image(
        &self,
        request: Request<Streaming<SubmitCameraFrameRequest>>,
    ) -> Result<Response<Empty>, Status> {
        self.consume_frames(request.into_inner()).await?;
        Ok(Response::new(Empty {}))
    }

    type ObservePredictionsStream =
        Pin<Box<dyn Stream<Item = Result<ObservePredictionsResponse, Status>> + Send>>;

    async fn observe_predictions(
        &self,
        _request: Request<Empty>,
    ) -> Result<Response<Self::ObservePredictionsStream>, Status> {
        tracing::info!("ObservePredictions requested but not available");
        Err(Status::unimplemented(
            "ObservePredictions is not implemented by this server",
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SharedCameraPolicy;
    use crate::display::OperatorInterrupt;
    use futures::stream;
    use opencv::{
        core::{Mat, Scalar, Vector, CV_8UC3},
        imgcodecs,
    };
    use parking_lot::Mutex;
    use std::sync::Arc;
    use std::time::Duration;
    use tonic::Code;

    #[derive(Clone, Default)]
    struct RecordingSink {
        shown: Arc<Mutex<Vec<FrameMetadata>>>,
        closed: Arc<Mutex<Vec<String>>>,
    }

    impl DisplaySink for RecordingSink {
        fn show(&self, frame: DecodedFrame) -> Result<(), DisplayError> {
            self.shown.lock().push(frame.metadata);
            Ok(())
        }

        fn close(&self, camera_id: &str) {
            self.closed.lock().push(camera_id.to_string());
        }
    }

    fn service(
        policy: SharedCameraPolicy,
    ) -> (SideCameraService<RecordingSink>, RecordingSink, OperatorInterrupt) {
        let sink = RecordingSink::default();
        let interrupt = OperatorInterrupt::new();
        let context = DisplayContext::new(sink.clone(), policy, interrupt.clone());
        (SideCameraService::new(context), sink, interrupt)
    }

    fn jpeg() -> Vec<u8> {
        let frame = Mat::new_rows_cols_with_default(32, 48, CV_8UC3, Scalar::all(90.0)).unwrap();
        let mut buf = Vector::<u8>::new();
        imgcodecs::imencode(".jpg", &frame, &mut buf, &Vector::new()).unwrap();
        buf.into()
    }

    fn request(camera_id: Option<&str>, timestamp: Option<i64>) -> SubmitCameraFrameRequest {
        SubmitCameraFrameRequest {
            image_data: jpeg(),
            camera_id: camera_id.map(str::to_string),
            timestamp,
        }
    }

    fn malformed() -> SubmitCameraFrameRequest {
        SubmitCameraFrameRequest {
            image_data: vec![0xFF, 0xD8, 0x00, 0x01, 0x02],
            camera_id: Some("cam".to_string()),
            timestamp: Some(1),
        }
    }

    #[tokio::test]
    async fn test_malformed_frames_are_skipped() {
        let (service, sink, _interrupt) = service(SharedCameraPolicy::Share);
        let frames = stream::iter(vec![
            Ok(request(Some("cam"), Some(1))),
            Ok(malformed()),
            Ok(request(Some("cam"), Some(2))),
            Ok(malformed()),
            Ok(request(Some("cam"), Some(3))),
        ]);

        let summary = service.consume_frames(frames).await.unwrap();

        assert_eq!(summary.received, 3);
        assert_eq!(summary.decode_failures, 2);
        assert!(!summary.interrupted);
        let timestamps: Vec<i64> = sink.shown.lock().iter().map(|m| m.timestamp).collect();
        assert_eq!(timestamps, vec![1, 2, 3]);
        assert_eq!(*sink.closed.lock(), vec!["cam".to_string()]);
    }

    #[tokio::test]
    async fn test_defaults_fill_missing_metadata() {
        let (service, sink, _interrupt) = service(SharedCameraPolicy::Share);
        let before = unix_timestamp_ms();

        service
            .consume_frames(stream::iter(vec![Ok(request(None, None))]))
            .await
            .unwrap();

        let shown = sink.shown.lock();
        assert_eq!(shown.len(), 1);
        assert_eq!(shown[0].camera_id, "unknown");
        assert!(shown[0].timestamp >= before);
    }

    #[tokio::test]
    async fn test_transport_error_ends_the_call() {
        let (service, sink, _interrupt) = service(SharedCameraPolicy::Share);
        let frames = stream::iter(vec![
            Ok(request(Some("cam"), Some(1))),
            Err(Status::aborted("connection dropped")),
            Ok(request(Some("cam"), Some(2))),
        ]);

        let status = service.consume_frames(frames).await.unwrap_err();

        assert_eq!(status.code(), Code::Aborted);
        assert_eq!(sink.shown.lock().len(), 1);
        assert_eq!(*sink.closed.lock(), vec!["cam".to_string()]);
    }

    #[tokio::test]
    async fn test_operator_interrupt_stops_an_open_stream() {
        let (service, sink, interrupt) = service(SharedCameraPolicy::Share);
        let frames = stream::iter(vec![Ok(request(Some("cam"), Some(1)))]).chain(stream::pending());

        let task = tokio::spawn(async move { service.consume_frames(frames).await });
        while interrupt.listeners() == 0 || sink.shown.lock().is_empty() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        interrupt.trigger();

        let summary = tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert!(summary.interrupted);
        assert_eq!(summary.received, 1);
        assert_eq!(*sink.closed.lock(), vec!["cam".to_string()]);
    }

    #[tokio::test]
    async fn test_rejected_camera_id_fails_second_call() {
        let (service, _sink, _interrupt) = service(SharedCameraPolicy::Reject);
        let mut holder = service.display.session();
        holder
            .show(DecodedFrame {
                metadata: FrameMetadata {
                    camera_id: "cam".to_string(),
                    timestamp: 0,
                },
                image: Mat::new_rows_cols_with_default(4, 4, CV_8UC3, Scalar::all(0.0)).unwrap(),
            })
            .unwrap();

        let status = service
            .consume_frames(stream::iter(vec![Ok(request(Some("cam"), Some(1)))]))
            .await
            .unwrap_err();

        assert_eq!(status.code(), Code::AlreadyExists);
    }

    #[tokio::test]
    async fn test_observe_predictions_is_unimplemented() {
        let (service, _sink, _interrupt) = service(SharedCameraPolicy::Share);

        let result = tokio::time::timeout(
            Duration::from_secs(1),
            service.observe_predictions(Request::new(Empty {})),
        )
        .await
        .unwrap();

        match result {
            Ok(_) => panic!("ObservePredictions must not open a stream"),
            Err(status) => assert_eq!(status.code(), Code::Unimplemented),
        }
    }

    /// Refuses the frame with the given timestamp, as a backlogged display does.
    struct DroppingSink {
        drop_timestamp: i64,
        shown: Arc<Mutex<Vec<i64>>>,
    }

    impl DisplaySink for DroppingSink {
        fn show(&self, frame: DecodedFrame) -> Result<(), DisplayError> {
            if frame.metadata.timestamp == self.drop_timestamp {
                return Err(DisplayError::Backlogged(frame.camera_id().to_string()));
            }
            self.shown.lock().push(frame.metadata.timestamp);
            Ok(())
        }

        fn close(&self, _camera_id: &str) {}
    }

    #[tokio::test]
    async fn test_display_failure_does_not_end_the_stream() {
        let shown = Arc::new(Mutex::new(Vec::new()));
        let sink = DroppingSink {
            drop_timestamp: 2,
            shown: shown.clone(),
        };
        let context =
            DisplayContext::new(sink, SharedCameraPolicy::Share, OperatorInterrupt::new());
        let service = SideCameraService::new(context);
        let frames = stream::iter(vec![
            Ok(request(Some("cam"), Some(1))),
            Ok(request(Some("cam"), Some(2))),
            Ok(request(Some("cam"), Some(3))),
        ]);

        let summary = service.consume_frames(frames).await.unwrap();

        assert_eq!(summary.received, 3);
        assert_eq!(summary.display_failures, 1);
        assert_eq!(summary.decode_failures, 0);
        assert_eq!(*shown.lock(), vec![1, 3]);
    }
}
