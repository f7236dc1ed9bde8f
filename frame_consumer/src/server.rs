use crate::{
    config::{Config, ServerConfig},
    display::{
        DisplayContext, DisplayError, DisplaySink, HeadlessDisplay, HighGuiDisplay,
        OperatorInterrupt,
    },
    side_camera_service::SideCameraService,
};
use side_camera_proto::side_camera_image_service_server::SideCameraImageServiceServer;
use std::{future::Future, net::SocketAddr};
use thiserror::Error;
use tokio::{net::TcpListener, signal};
use tokio_stream::wrappers::TcpListenerStream;
use tonic::transport::Server;

#[derive(Error, Debug)]
pub enum ServerError {
    #[error("Invalid listen address {0}: {1}")]
    InvalidAddress(String, std::net::AddrParseError),
    #[error("Failed to bind listener: {0}")]
    Bind(#[from] std::io::Error),
    #[error("Reflection service error: {0}")]
    Reflection(#[from] tonic_reflection::server::Error),
    #[error("Transport error: {0}")]
    Transport(#[from] tonic::transport::Error),
    #[error("Display error: {0}")]
    Display(#[from] DisplayError),
}

pub struct GrpcServer<D: DisplaySink> {
    service: SideCameraService<D>,
    addr: String,
    max_concurrent_streams: u32,
}

impl<D: DisplaySink> GrpcServer<D> {
    pub fn new(display: DisplayContext<D>, config: &ServerConfig) -> Self {
        Self {
            service: SideCameraService::new(display),
            addr: config.get_address(),
            max_concurrent_streams: config.max_concurrent_streams,
        }
    }

    pub async fn run(self) -> Result<(), ServerError> {
        let addr: SocketAddr = self
            .addr
            .parse()
            .map_err(|e| ServerError::InvalidAddress(self.addr.clone(), e))?;
        let listener = TcpListener::bind(addr).await?;

        let shutdown = async {
            shutdown_signal().await;
            tracing::info!("Shutdown signal received, starting graceful shutdown")
        };

        self.run_with_listener(listener, shutdown).await
    }

    /// Serves on an already bound listener until `shutdown` resolves.
    pub async fn run_with_listener<F>(
        self,
        listener: TcpListener,
        shutdown: F,
    ) -> Result<(), ServerError>
    where
        F: Future<Output = ()>,
    {
        let reflection_service = tonic_reflection::server::Builder::configure()
            .register_encoded_file_descriptor_set(side_camera_proto::FILE_DESCRIPTOR_SET)
            .build_v1alpha()?;

        let (health_reporter, health_service) = tonic_health::server::health_reporter();
        health_reporter
            .set_serving::<SideCameraImageServiceServer<SideCameraService<D>>>()
            .await;

        tracing::info!(
            max_concurrent_streams = self.max_concurrent_streams,
            "Side camera service listening on {}",
            listener.local_addr()?
        );

        Server::builder()
            .max_concurrent_streams(Some(self.max_concurrent_streams))
            .add_service(health_service)
            .add_service(reflection_service)
            .add_service(SideCameraImageServiceServer::new(self.service))
            .serve_with_incoming_shutdown(TcpListenerStream::new(listener), shutdown)
            .await?;

        tracing::info!("Side camera service stopped");
        Ok(())
    }
}

pub async fn start_server(config: Config) -> Result<(), ServerError> {
    let interrupt = OperatorInterrupt::new();
    let policy = config.display.shared_camera_policy;

    if config.display.enabled {
        let display = HighGuiDisplay::spawn(config.display.clone(), interrupt.clone())?;
        let context = DisplayContext::new(display, policy, interrupt);
        GrpcServer::new(context, &config.server).run().await
    } else {
        tracing::info!("Display disabled, frames are decoded but not shown");
        let context = DisplayContext::new(HeadlessDisplay, policy, interrupt);
        GrpcServer::new(context, &config.server).run().await
    }
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
