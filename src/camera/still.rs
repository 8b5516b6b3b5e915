use crate::camera::StillCapture;
use crate::common::{DevMode, GateError, Result};
use image::DynamicImage;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};

/// Serves stills from the newest full-resolution frame of the live stream.
///
/// The camera stays owned by the frame loop; it hands each frame over with
/// `update` and verification writes out whatever is newest.
pub struct LatestFrameStill {
    latest: Mutex<Option<Arc<DynamicImage>>>,
    dev_mode: DevMode,
}

impl LatestFrameStill {
    pub fn new(dev_mode: DevMode) -> Self {
        Self { latest: Mutex::new(None), dev_mode }
    }

    pub fn update(&self, frame: Arc<DynamicImage>) {
        *self.latest.lock().unwrap_or_else(PoisonError::into_inner) = Some(frame);
    }

    fn target_path(&self) -> PathBuf {
        if self.dev_mode.is_enabled() {
            self.dev_mode.get_capture_path("still")
        } else {
            // One verification at a time, so a single file is enough.
            self.dev_mode.captures_dir().join("latest_still.jpg")
        }
    }
}

impl StillCapture for LatestFrameStill {
    fn capture_still(&self) -> Result<PathBuf> {
        let frame = self
            .latest
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or_else(|| GateError::Camera("No frame available for still capture".into()))?;

        let path = self.target_path();
        frame.save(&path)?;
        tracing::debug!("Still written to {}", path.display());
        Ok(path)
    }
}
