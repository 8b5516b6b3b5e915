pub mod detector;
pub mod driver;
pub mod matcher;
pub mod pipeline;
pub mod recognizer;
pub mod station;
pub mod trigger;

pub use detector::{BoundingBox, Detection, DetectionModel, FrameSize, OnnxDetector};
pub use driver::{DetectionObserver, FrameDecision, FrameLoop, LogObserver, VerificationToken};
pub use matcher::{match_embedding, EnrolledUser, Embedding, Population, VectorMatcher, VerificationOutcome};
pub use pipeline::{Collaborators, MetricsSnapshot, VerificationPipeline, Verifier};
pub use recognizer::{EmbeddingModel, ImagePreprocessor, OnnxEmbedder, Preprocessor};
pub use station::Station;
pub use trigger::{CaptureEvent, CaptureTrigger};
