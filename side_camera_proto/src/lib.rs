use std::time::{SystemTime, UNIX_EPOCH};

tonic::include_proto!("side_camera");

pub const FILE_DESCRIPTOR_SET: &[u8] =
    tonic::include_file_descriptor_set!("side_camera_descriptor");

/// Camera id used when a frame arrives without one.
pub const UNKNOWN_CAMERA_ID: &str = "unknown";

/// Wall-clock milliseconds since the Unix epoch.
pub fn unix_timestamp_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}
