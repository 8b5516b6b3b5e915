// Core modules
pub mod camera;
pub mod common;
pub mod core;
pub mod gate;
pub mod storage;

// Re-export commonly used types
pub use camera::{Camera, LatestFrameStill, StillCapture};
pub use common::{Config, DevMode, GateError, Result};
pub use core::{
    CaptureTrigger, FrameDecision, FrameLoop, Station, VectorMatcher, VerificationOutcome,
    VerificationPipeline,
};
pub use gate::{Command, ConnectionState, GateLink, GateNotice};
pub use storage::{EventLog, UserStore};
