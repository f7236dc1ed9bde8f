use frame_consumer::{
    codec::{DecodedFrame, FrameMetadata},
    config::{ServerConfig, SharedCameraPolicy},
    display::{DisplayContext, DisplayError, DisplaySink, OperatorInterrupt},
    GrpcServer,
};
use frame_producer::{
    client::{ClientError, SideCameraClient},
    config::CameraConfig,
    source::SyntheticSource,
    FrameProducer,
};
use opencv::core::Mat;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, oneshot};

#[derive(Clone, Default)]
struct RecordingSink {
    shown: Arc<Mutex<Vec<(FrameMetadata, f64)>>>,
    closed: Arc<Mutex<Vec<String>>>,
}

impl DisplaySink for RecordingSink {
    fn show(&self, frame: DecodedFrame) -> Result<(), DisplayError> {
        let grey = opencv::core::mean(&frame.image, &Mat::default()).unwrap()[0];
        self.shown.lock().push((frame.metadata, grey));
        Ok(())
    }

    fn close(&self, camera_id: &str) {
        self.closed.lock().push(camera_id.to_string());
    }
}

#[tokio::test]
async fn test_synthetic_video_streams_end_to_end() -> Result<(), Box<dyn std::error::Error>> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let server_config = ServerConfig {
        host: addr.ip().to_string(),
        port: addr.port(),
        max_concurrent_streams: 10,
    };

    let sink = RecordingSink::default();
    let context = DisplayContext::new(
        sink.clone(),
        SharedCameraPolicy::Share,
        OperatorInterrupt::new(),
    );
    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let server = tokio::spawn(GrpcServer::new(context, &server_config).run_with_listener(
        listener,
        async {
            shutdown_rx.await.ok();
        },
    ));

    let mut client = SideCameraClient::connect(format!("http://{}", addr)).await?;

    let camera = CameraConfig {
        camera_id: "synthetic".to_string(),
        device_index: 0,
        stream_fps: 30,
        jpeg_quality: 90,
        buffer_size: 5,
    };
    let (_stop_tx, stop_rx) = broadcast::channel(1);
    let (frames, capture) =
        FrameProducer::new(&camera).spawn(SyntheticSource::new(10, 64, 48), stop_rx);

    client.submit(frames).await?;
    let summary = capture.await?;
    assert_eq!(summary.emitted, 10);

    {
        let shown = sink.shown.lock();
        assert_eq!(shown.len(), 10);
        for (index, (metadata, grey)) in shown.iter().enumerate() {
            assert_eq!(metadata.camera_id, "synthetic");
            assert!((grey - SyntheticSource::grey_level(index)).abs() < 4.0);
        }
    }
    assert_eq!(*sink.closed.lock(), vec!["synthetic".to_string()]);

    assert!(matches!(
        client.observe_predictions().await,
        Err(ClientError::PredictionsUnavailable(_))
    ));

    let _ = shutdown_tx.send(());
    server.await??;
    Ok(())
}
