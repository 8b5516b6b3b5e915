use crate::camera::StillCapture;
use crate::common::Result;
use crate::core::matcher::{Population, VectorMatcher, VerificationOutcome};
use crate::core::recognizer::{EmbeddingModel, Preprocessor};
use crate::core::trigger::CaptureEvent;
use crate::gate::{Command, GateCommandSink};
use crate::storage::{UserRecordProvider, VerificationSink};
use chrono::Utc;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::{Duration, Instant};

pub const REASON_CAPTURE_ERROR: &str = "capture error";

/// Anything that can turn a capture event into an access decision.
pub trait Verifier: Send + Sync {
    fn run(&self, event: &CaptureEvent) -> VerificationOutcome;
}

/// External collaborators the pipeline drives.
pub struct Collaborators {
    pub capture: Arc<dyn StillCapture>,
    pub preprocessor: Arc<dyn Preprocessor>,
    pub embedder: Arc<dyn EmbeddingModel>,
    pub users: Arc<dyn UserRecordProvider>,
    pub sink: Arc<dyn VerificationSink>,
}

#[derive(Debug, Default)]
pub struct PipelineMetrics {
    runs: AtomicU64,
    verified: AtomicU64,
    rejected: AtomicU64,
    last_duration_ms: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub runs: u64,
    pub verified: u64,
    pub rejected: u64,
    pub last_duration_ms: u64,
}

impl PipelineMetrics {
    fn record(&self, outcome: &VerificationOutcome, elapsed: Duration) {
        self.runs.fetch_add(1, Ordering::Relaxed);
        if outcome.verified {
            self.verified.fetch_add(1, Ordering::Relaxed);
        } else {
            self.rejected.fetch_add(1, Ordering::Relaxed);
        }
        self.last_duration_ms.store(elapsed.as_millis() as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            runs: self.runs.load(Ordering::Relaxed),
            verified: self.verified.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            last_duration_ms: self.last_duration_ms.load(Ordering::Relaxed),
        }
    }
}

/// capture → preprocess → embed → match → {event record, gate command}.
pub struct VerificationPipeline {
    parts: Collaborators,
    gate: Option<Arc<dyn GateCommandSink>>,
    matcher: VectorMatcher,
    population: RwLock<Option<Arc<Population>>>,
    metrics: PipelineMetrics,
}

impl VerificationPipeline {
    pub fn new(parts: Collaborators, matcher: VectorMatcher) -> Self {
        Self {
            parts,
            gate: None,
            matcher,
            population: RwLock::new(None),
            metrics: PipelineMetrics::default(),
        }
    }

    pub fn with_gate(mut self, gate: Arc<dyn GateCommandSink>) -> Self {
        self.gate = Some(gate);
        self
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Re-reads users from the provider and swaps the cached snapshot.
    pub fn refresh_population(&self) -> Result<usize> {
        let population = Arc::new(Population::from_records(self.parts.users.list_users()?));
        let count = population.len();
        *self.population.write().unwrap_or_else(PoisonError::into_inner) = Some(population);
        tracing::info!("Population refreshed: {} enrolled users", count);
        Ok(count)
    }

    /// Drops the cached snapshot without touching the provider. The next
    /// `run` reloads users on whichever thread executes it.
    pub fn invalidate_population(&self) {
        *self.population.write().unwrap_or_else(PoisonError::into_inner) = None;
        tracing::debug!("Population marked stale");
    }

    fn population(&self) -> Result<Arc<Population>> {
        let cached = self
            .population
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        match cached {
            Some(population) => Ok(population),
            None => {
                self.refresh_population()?;
                Ok(self
                    .population
                    .read()
                    .unwrap_or_else(PoisonError::into_inner)
                    .clone()
                    .unwrap_or_default())
            }
        }
    }

    fn identify(&self) -> VerificationOutcome {
        let still = match self.parts.capture.capture_still() {
            Ok(path) => path,
            Err(e) => {
                tracing::warn!("Still capture failed: {}", e);
                return VerificationOutcome::rejected(REASON_CAPTURE_ERROR);
            }
        };

        let tensor = match self.parts.preprocessor.prepare(&still) {
            Ok(tensor) => tensor,
            Err(e) => return VerificationOutcome::rejected(format!("preprocessing error: {}", e)),
        };

        let embedding = match self.parts.embedder.embed(tensor) {
            Ok(embedding) => embedding,
            Err(e) => return VerificationOutcome::rejected(format!("embedding error: {}", e)),
        };

        let population = match self.population() {
            Ok(population) => population,
            Err(e) => return VerificationOutcome::rejected(format!("user records unavailable: {}", e)),
        };

        self.matcher.match_probe(&embedding, population.users())
    }

    /// Side effects of a verified outcome. Neither can revert the decision.
    fn publish(&self, user_id: &str) {
        if let Err(e) = self.parts.sink.record_verification(user_id, Utc::now()) {
            tracing::error!("Failed to record verification for {}: {}", user_id, e);
        }

        match &self.gate {
            Some(gate) if gate.is_authenticated() => {
                if let Err(e) = gate.send(&Command::FaceDetected) {
                    tracing::warn!("Gate notification failed: {}", e);
                }
            }
            Some(_) => tracing::warn!("Gate link not authenticated, skipping gate command"),
            None => {}
        }
    }
}

impl Verifier for VerificationPipeline {
    fn run(&self, event: &CaptureEvent) -> VerificationOutcome {
        let started = Instant::now();

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| self.identify())).unwrap_or_else(|_| {
            tracing::error!("Verification panicked");
            VerificationOutcome::rejected("internal error")
        });

        if let (true, Some(user_id)) = (outcome.verified, outcome.matched_user_id.as_deref()) {
            self.publish(user_id);
        }

        let elapsed = started.elapsed();
        self.metrics.record(&outcome, elapsed);
        tracing::info!(
            verified = outcome.verified,
            user = outcome.matched_user_id.as_deref().unwrap_or("-"),
            distance = outcome.distance.unwrap_or(f32::NAN),
            reason = outcome.reason.as_deref().unwrap_or(""),
            frame = %format!("{}x{}", event.frame.width, event.frame.height),
            "Verification finished in {:.1}ms",
            elapsed.as_secs_f32() * 1000.0
        );

        outcome
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::common::GateError;
    use crate::core::detector::FrameSize;
    use crate::core::matcher::{EnrolledUser, Embedding, EMBEDDING_DIM, REASON_NO_USERS};
    use crate::gate::SendError;
    use chrono::DateTime;
    use ndarray::Array4;
    use std::path::{Path, PathBuf};
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;

    pub(crate) fn probe(seed: f32) -> Embedding {
        (0..EMBEDDING_DIM).map(|i| seed + i as f32 * 0.01).collect()
    }

    struct FakeCapture {
        fail: bool,
    }

    impl StillCapture for FakeCapture {
        fn capture_still(&self) -> Result<PathBuf> {
            if self.fail {
                Err(GateError::Camera("device busy".into()))
            } else {
                Ok(PathBuf::from("/tmp/still.jpg"))
            }
        }
    }

    struct FakePreprocessor;

    impl Preprocessor for FakePreprocessor {
        fn prepare(&self, _still: &Path) -> Result<Array4<f32>> {
            Ok(Array4::zeros((1, 3, 4, 4)))
        }
    }

    struct FakeEmbedder {
        embedding: Embedding,
        calls: AtomicUsize,
        panic: bool,
    }

    impl EmbeddingModel for FakeEmbedder {
        fn embed(&self, _tensor: Array4<f32>) -> Result<Embedding> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.panic {
                panic!("model crashed");
            }
            Ok(self.embedding.clone())
        }
    }

    struct FakeUsers {
        users: Mutex<Vec<EnrolledUser>>,
        calls: AtomicUsize,
    }

    impl UserRecordProvider for FakeUsers {
        fn list_users(&self) -> Result<Vec<EnrolledUser>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.users.lock().unwrap().clone())
        }
    }

    #[derive(Default)]
    struct RecordingSink {
        events: Mutex<Vec<(String, DateTime<Utc>)>>,
        fail: bool,
    }

    impl VerificationSink for RecordingSink {
        fn record_verification(&self, user_id: &str, timestamp: DateTime<Utc>) -> Result<()> {
            if self.fail {
                return Err(GateError::Storage("disk full".into()));
            }
            self.events.lock().unwrap().push((user_id.to_string(), timestamp));
            Ok(())
        }
    }

    #[derive(Default)]
    struct FakeGate {
        authenticated: bool,
        fail: bool,
        sent: Mutex<Vec<Command>>,
    }

    impl GateCommandSink for FakeGate {
        fn is_authenticated(&self) -> bool {
            self.authenticated
        }

        fn send(&self, command: &Command) -> std::result::Result<(), SendError> {
            if self.fail {
                return Err(SendError::Io("broken pipe".into()));
            }
            self.sent.lock().unwrap().push(command.clone());
            Ok(())
        }
    }

    struct Harness {
        embedder: Arc<FakeEmbedder>,
        users: Arc<FakeUsers>,
        sink: Arc<RecordingSink>,
        gate: Arc<FakeGate>,
        pipeline: VerificationPipeline,
    }

    fn harness(capture_fails: bool, embedding: Embedding, sink: RecordingSink, gate: FakeGate) -> Harness {
        let embedder = Arc::new(FakeEmbedder { embedding, calls: AtomicUsize::new(0), panic: false });
        let users = Arc::new(FakeUsers {
            users: Mutex::new(vec![
                EnrolledUser::new("alice", probe(0.0)),
                EnrolledUser::new("bob", probe(5.0)),
            ]),
            calls: AtomicUsize::new(0),
        });
        let sink = Arc::new(sink);
        let gate = Arc::new(gate);
        let pipeline = VerificationPipeline::new(
            Collaborators {
                capture: Arc::new(FakeCapture { fail: capture_fails }),
                preprocessor: Arc::new(FakePreprocessor),
                embedder: embedder.clone(),
                users: users.clone(),
                sink: sink.clone(),
            },
            VectorMatcher::default(),
        )
        .with_gate(gate.clone());

        Harness { embedder, users, sink, gate, pipeline }
    }

    fn event() -> CaptureEvent {
        CaptureEvent { timestamp: Instant::now(), frame: FrameSize { width: 640, height: 480 } }
    }

    fn authenticated_gate() -> FakeGate {
        FakeGate { authenticated: true, ..Default::default() }
    }

    #[test]
    fn test_verified_run_records_event_and_notifies_gate() {
        let h = harness(false, probe(5.0), RecordingSink::default(), authenticated_gate());

        let outcome = h.pipeline.run(&event());

        assert!(outcome.verified);
        assert_eq!(outcome.matched_user_id.as_deref(), Some("bob"));
        let events = h.sink.events.lock().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].0, "bob");
        assert_eq!(*h.gate.sent.lock().unwrap(), vec![Command::FaceDetected]);
    }

    #[test]
    fn test_unauthenticated_gate_is_skipped_but_outcome_stands() {
        let h = harness(false, probe(0.0), RecordingSink::default(), FakeGate::default());

        let outcome = h.pipeline.run(&event());

        assert!(outcome.verified);
        assert_eq!(h.sink.events.lock().unwrap().len(), 1);
        assert!(h.gate.sent.lock().unwrap().is_empty());
    }

    #[test]
    fn test_side_effect_failures_do_not_revert_verification() {
        let sink = RecordingSink { fail: true, ..Default::default() };
        let gate = FakeGate { authenticated: true, fail: true, ..Default::default() };
        let h = harness(false, probe(0.0), sink, gate);

        let outcome = h.pipeline.run(&event());

        assert!(outcome.verified);
        assert_eq!(outcome.matched_user_id.as_deref(), Some("alice"));
    }

    #[test]
    fn test_capture_failure_aborts_before_inference() {
        let h = harness(true, probe(0.0), RecordingSink::default(), authenticated_gate());

        let outcome = h.pipeline.run(&event());

        assert!(!outcome.verified);
        assert_eq!(outcome.reason.as_deref(), Some(REASON_CAPTURE_ERROR));
        assert_eq!(h.embedder.calls.load(Ordering::SeqCst), 0);
        assert!(h.gate.sent.lock().unwrap().is_empty());
    }

    #[test]
    fn test_unknown_face_has_no_side_effects() {
        let h = harness(false, probe(50.0), RecordingSink::default(), authenticated_gate());

        let outcome = h.pipeline.run(&event());

        assert!(!outcome.verified);
        assert!(outcome.reason.unwrap().contains("bob"));
        assert!(h.sink.events.lock().unwrap().is_empty());
        assert!(h.gate.sent.lock().unwrap().is_empty());
    }

    #[test]
    fn test_population_cached_until_refreshed() {
        let h = harness(false, probe(0.0), RecordingSink::default(), FakeGate::default());

        h.pipeline.run(&event());
        h.pipeline.run(&event());
        assert_eq!(h.users.calls.load(Ordering::SeqCst), 1);

        h.users.users.lock().unwrap().clear();
        assert!(h.pipeline.run(&event()).verified);

        assert_eq!(h.pipeline.refresh_population().unwrap(), 0);
        let outcome = h.pipeline.run(&event());
        assert_eq!(outcome.reason.as_deref(), Some(REASON_NO_USERS));
    }

    #[test]
    fn test_invalidation_defers_reload_to_next_run() {
        let h = harness(false, probe(0.0), RecordingSink::default(), FakeGate::default());

        h.pipeline.run(&event());
        assert_eq!(h.users.calls.load(Ordering::SeqCst), 1);

        h.users.users.lock().unwrap().clear();
        h.pipeline.invalidate_population();
        assert_eq!(h.users.calls.load(Ordering::SeqCst), 1);

        let outcome = h.pipeline.run(&event());
        assert_eq!(h.users.calls.load(Ordering::SeqCst), 2);
        assert_eq!(outcome.reason.as_deref(), Some(REASON_NO_USERS));
    }

    #[test]
    fn test_panicking_model_becomes_rejection() {
        let mut h = harness(false, probe(0.0), RecordingSink::default(), FakeGate::default());
        let embedder: Arc<dyn EmbeddingModel> =
            Arc::new(FakeEmbedder { embedding: probe(0.0), calls: AtomicUsize::new(0), panic: true });
        h.pipeline.parts.embedder = embedder;

        let outcome = h.pipeline.run(&event());

        assert!(!outcome.verified);
        assert_eq!(outcome.reason.as_deref(), Some("internal error"));
    }

    #[test]
    fn test_metrics_count_every_run() {
        let h = harness(false, probe(0.0), RecordingSink::default(), FakeGate::default());
        h.pipeline.run(&event());

        let failing = harness(true, probe(0.0), RecordingSink::default(), FakeGate::default());
        failing.pipeline.run(&event());

        assert_eq!(h.pipeline.metrics().runs, 1);
        assert_eq!(h.pipeline.metrics().verified, 1);
        assert_eq!(failing.pipeline.metrics().rejected, 1);
    }
}
