mod server;
mod side_camera_service;

pub mod codec;
pub mod config;
pub mod display;

pub use server::{start_server, GrpcServer, ServerError};
pub use side_camera_service::{SideCameraService, StreamSummary};
