use crate::core::detector::{Detection, DetectionModel, FrameSize};
use crate::core::matcher::VerificationOutcome;
use crate::core::pipeline::Verifier;
use crate::core::trigger::{CaptureEvent, CaptureTrigger};
use image::DynamicImage;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Sender;
use std::sync::Arc;
use std::thread;
use std::time::Instant;

pub const DEFAULT_DISPLAY_THRESHOLD: f32 = 0.5;

/// Receives the detections of every evaluated frame, e.g. for an overlay.
pub trait DetectionObserver: Send {
    fn publish(&self, detections: &[Detection], frame: FrameSize);
}

/// Observer that only traces what it sees.
pub struct LogObserver;

impl DetectionObserver for LogObserver {
    fn publish(&self, detections: &[Detection], frame: FrameSize) {
        if !detections.is_empty() {
            tracing::trace!("{} face(s) in {}x{} frame", detections.len(), frame.width, frame.height);
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FrameDecision {
    /// A verification is still running; the frame was dropped unexamined.
    Busy,
    DetectorNotReady,
    Evaluated { detections: usize },
    Dispatched(CaptureEvent),
}

/// Holds the in-flight flag for the lifetime of one verification.
pub struct VerificationToken {
    flag: Arc<AtomicBool>,
}

impl VerificationToken {
    pub fn acquire(flag: &Arc<AtomicBool>) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self { flag: Arc::clone(flag) })
    }
}

impl Drop for VerificationToken {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}

/// Per-frame driver: detection, trigger decision and verification dispatch.
///
/// Runs on the camera thread. Verification happens on a worker thread so the
/// camera keeps delivering frames; at most one verification exists at a time.
pub struct FrameLoop {
    detector: Option<Arc<dyn DetectionModel>>,
    observer: Box<dyn DetectionObserver>,
    trigger: CaptureTrigger,
    display_threshold: f32,
    verifier: Arc<dyn Verifier>,
    in_flight: Arc<AtomicBool>,
    last_capture: Option<Instant>,
    outcomes: Option<Sender<VerificationOutcome>>,
}

impl FrameLoop {
    pub fn new(trigger: CaptureTrigger, verifier: Arc<dyn Verifier>) -> Self {
        Self {
            detector: None,
            observer: Box::new(LogObserver),
            trigger,
            display_threshold: DEFAULT_DISPLAY_THRESHOLD,
            verifier,
            in_flight: Arc::new(AtomicBool::new(false)),
            last_capture: None,
            outcomes: None,
        }
    }

    pub fn with_display_threshold(mut self, threshold: f32) -> Self {
        self.display_threshold = threshold;
        self
    }

    pub fn with_observer(mut self, observer: Box<dyn DetectionObserver>) -> Self {
        self.observer = observer;
        self
    }

    /// Finished verifications are forwarded to `outcomes`.
    pub fn with_outcomes(mut self, outcomes: Sender<VerificationOutcome>) -> Self {
        self.outcomes = Some(outcomes);
        self
    }

    /// Frames arriving before this are reported as `DetectorNotReady`.
    pub fn attach_detector(&mut self, detector: Arc<dyn DetectionModel>) {
        self.detector = Some(detector);
    }

    pub fn is_busy(&self) -> bool {
        self.in_flight.load(Ordering::Acquire)
    }

    pub fn last_capture(&self) -> Option<Instant> {
        self.last_capture
    }

    pub fn on_frame(&mut self, frame: &DynamicImage, now: Instant) -> FrameDecision {
        if self.is_busy() {
            return FrameDecision::Busy;
        }

        let Some(detector) = &self.detector else {
            return FrameDecision::DetectorNotReady;
        };

        let size = FrameSize::of(frame);
        let detections: Vec<Detection> = match detector.detect(frame) {
            Ok(found) => found
                .into_iter()
                .filter(|d| d.score >= self.display_threshold)
                .collect(),
            Err(e) => {
                tracing::warn!("Detection failed, treating frame as empty: {}", e);
                Vec::new()
            }
        };
        self.observer.publish(&detections, size);

        let evaluated = FrameDecision::Evaluated { detections: detections.len() };
        let Some(event) = self.trigger.decide(&detections, size, self.last_capture, now) else {
            return evaluated;
        };

        let Some(token) = VerificationToken::acquire(&self.in_flight) else {
            return FrameDecision::Busy;
        };
        self.last_capture = Some(event.timestamp);

        let verifier = Arc::clone(&self.verifier);
        let outcomes = self.outcomes.clone();
        let spawned = thread::Builder::new()
            .name("verification".into())
            .spawn(move || {
                let outcome = verifier.run(&event);
                drop(token);
                if let Some(tx) = outcomes {
                    let _ = tx.send(outcome);
                }
            });

        match spawned {
            Ok(_) => {
                tracing::debug!("Verification dispatched");
                FrameDecision::Dispatched(event)
            }
            Err(e) => {
                // The closure, and with it the token, is dropped on failure.
                tracing::error!("Failed to spawn verification worker: {}", e);
                evaluated
            }
        }
    }
}
