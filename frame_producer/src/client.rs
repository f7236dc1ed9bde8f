use futures::Stream;
use side_camera_proto::{
    observe_predictions_response::Payload,
    side_camera_image_service_client::SideCameraImageServiceClient, Empty,
    ObservePredictionsResponse, SubmitCameraFrameRequest,
};
use thiserror::Error;
use tokio::time::{sleep, timeout, Duration};
use tonic::{transport::Channel, Code, Request, Status};
use tracing::instrument;

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("Maximum connection retries exceeded.")]
    MaxRetriesExceeded,
    #[error("gRPC request failed: {0}")]
    GrpcRequestFailed(#[from] Status),
    #[error("Prediction stream unavailable: {0}")]
    PredictionsUnavailable(String),
}

#[derive(Clone)]
pub struct SideCameraClient {
    client: SideCameraImageServiceClient<Channel>,
}

impl SideCameraClient {
    /// Connects with a bounded, jittered backoff. Only the initial connection is
    /// retried; calls on an established channel are not.
    pub async fn connect(address: String) -> Result<Self, ClientError> {
        let mut retry_delay = Duration::from_millis(50);
        let max_retry_delay = Duration::from_secs(1);
        let max_retries = 10;
        let mut retry_count = 0;

        tracing::info!("Connecting to gRPC server at {}", address);
        while retry_count < max_retries {
            match timeout(
                Duration::from_secs(1),
                SideCameraImageServiceClient::connect(address.clone()),
            )
            .await
            {
                Ok(Ok(client)) => return Ok(Self { client }),
                Ok(Err(e)) => {
                    tracing::error!("Failed to connect to gRPC server: {:?}", e);
                }
                Err(_) => {
                    tracing::error!("Connection timeout");
                }
            }

            retry_count += 1;
            let jitter = rand::random::<f32>() * 0.2 + 0.9;
            sleep(retry_delay.mul_f32(jitter)).await;
            retry_delay = (retry_delay * 2).min(max_retry_delay);
        }

        Err(ClientError::MaxRetriesExceeded)
    }

    /// Sends every frame of `frames` in one `SubmitSideCameraImage` call and
    /// waits for the server's acknowledgement.
    #[instrument(skip(self, frames))]
    pub async fn submit<S>(&mut self, frames: S) -> Result<(), ClientError>
    where
        S: Stream<Item = SubmitCameraFrameRequest> + Send + 'static,
    {
        let response = self
            .client
            .submit_side_camera_image(Request::new(frames))
            .await?;
        let Empty {} = response.into_inner();
        tracing::info!("Stream finished");
        Ok(())
    }

    /// Follows the prediction stream until the server closes it.
    #[instrument(skip(self))]
    pub async fn observe_predictions(&mut self) -> Result<(), ClientError> {
        let response = match self
            .client
            .observe_predictions(Request::new(Empty {}))
            .await
        {
            Ok(response) => response,
            Err(status) if status.code() == Code::Unimplemented => {
                return Err(ClientError::PredictionsUnavailable(
                    status.message().to_string(),
                ))
            }
            Err(status) => return Err(status.into()),
        };

        let mut predictions = response.into_inner();
        while let Some(prediction) = predictions.message().await? {
            log_payload(&prediction);
        }
        tracing::info!("Prediction observer completed normally");
        Ok(())
    }
}

fn log_payload(prediction: &ObservePredictionsResponse) {
    match &prediction.payload {
        Some(Payload::JsonRaw(json)) => {
            tracing::info!("Prediction: JSON (size={})", json.len());
            tracing::debug!("{}", json);
        }
        Some(Payload::FileRaw(file)) => tracing::info!("Prediction: File (size={})", file.len()),
        None => tracing::info!("Prediction received with no payload"),
    }
}
