pub mod still;
pub mod v4l2;

use crate::common::Result;
use std::path::PathBuf;

pub use still::LatestFrameStill;
pub use v4l2::{Camera, CameraSession};

/// Produces the high-resolution still used for identification.
pub trait StillCapture: Send + Sync {
    fn capture_still(&self) -> Result<PathBuf>;
}
