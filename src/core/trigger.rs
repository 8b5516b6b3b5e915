use crate::common::config::TriggerConfig;
use crate::core::detector::{Detection, FrameSize};
use std::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CaptureEvent {
    pub timestamp: Instant,
    pub frame: FrameSize,
}

/// Decides, per frame, whether a detection justifies a full capture.
///
/// Stateless: the caller owns `last_capture` and must update it together with
/// dispatching the capture.
#[derive(Debug, Clone, Default)]
pub struct CaptureTrigger {
    config: TriggerConfig,
}

impl CaptureTrigger {
    pub fn new(config: TriggerConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &TriggerConfig {
        &self.config
    }

    pub fn decide(
        &self,
        detections: &[Detection],
        frame: FrameSize,
        last_capture: Option<Instant>,
        now: Instant,
    ) -> Option<CaptureEvent> {
        if detections.is_empty() {
            return None;
        }

        if let Some(last) = last_capture {
            // `checked_duration_since` is None when `now` precedes `last`.
            let cooled = now
                .checked_duration_since(last)
                .is_some_and(|elapsed| elapsed >= self.config.cooldown());
            if !cooled {
                return None;
            }
        }

        self.select(detections, frame).map(|_| CaptureEvent { timestamp: now, frame })
    }

    /// The detection a capture would be taken for: the first eligible one, in
    /// detector order.
    pub fn select<'a>(&self, detections: &'a [Detection], frame: FrameSize) -> Option<&'a Detection> {
        detections.iter().find(|d| self.is_eligible(d, frame))
    }

    /// Centered, sized and confident, all at once.
    pub fn is_eligible(&self, detection: &Detection, frame: FrameSize) -> bool {
        let frame_width = frame.width as f32;
        let frame_height = frame.height as f32;
        let bbox = &detection.bbox;

        // Both axes use a tolerance derived from the frame width.
        let tolerance = self.config.center_tolerance * frame_width;
        let (cx, cy) = bbox.center();
        let centered = (cx - frame_width / 2.0).abs() < tolerance
            && (cy - frame_height / 2.0).abs() < tolerance;

        let min_size = self.config.min_face_ratio * frame_width;
        let max_size = self.config.max_face_ratio * frame_width;
        let sized = (min_size..=max_size).contains(&bbox.width)
            && (min_size..=max_size).contains(&bbox.height);

        let confident = detection.score > self.config.min_score;

        centered && sized && confident
    }
}
