mod encoder;
mod producer;

pub mod app;
pub mod client;
pub mod config;
pub mod source;

pub use app::start_app;
pub use encoder::{encode_jpeg, EncodeError};
pub use producer::{CaptureSummary, FrameProducer};
