use crate::{
    camera::{Camera, LatestFrameStill, StillCapture},
    common::{Config, DevMode, GateError, Result},
    core::{
        detector::{Detection, DetectionModel, FrameSize, OnnxDetector},
        driver::{FrameDecision, FrameLoop},
        matcher::{VectorMatcher, VerificationOutcome},
        pipeline::{Collaborators, VerificationPipeline, Verifier},
        recognizer::{EmbeddingModel, ImagePreprocessor, OnnxEmbedder},
        trigger::{CaptureEvent, CaptureTrigger},
    },
    gate::{Command, ConnectionState, GateLink, GateNotice, PairedDeviceTransport},
    storage::{EventLog, UserStore},
};
use image::{DynamicImage, Rgb};
use imageproc::drawing::draw_hollow_rect_mut;
use imageproc::rect::Rect;
use std::io::{self, BufRead};
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Receiver};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// Wires camera, models, storage and gate link into a running checkpoint.
pub struct Station {
    config: Config,
    dev_mode: DevMode,
    store: Arc<UserStore>,
    events: Arc<EventLog>,
}

/// Commands typed on the station console while `run` is live.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperatorCommand {
    Reconnect,
    Authenticate,
    Status,
}

impl OperatorCommand {
    pub fn parse(line: &str) -> Option<Self> {
        match line.trim().to_ascii_lowercase().as_str() {
            "r" | "reconnect" => Some(OperatorCommand::Reconnect),
            "a" | "auth" | "authenticate" => Some(OperatorCommand::Authenticate),
            "s" | "status" => Some(OperatorCommand::Status),
            _ => None,
        }
    }
}

/// Applies one operator command to the link and describes what happened.
/// Connect and authentication results arrive later as notices.
pub fn apply_operator_command(link: &GateLink, command: OperatorCommand) -> String {
    match command {
        OperatorCommand::Reconnect => {
            link.disconnect();
            match link.connect() {
                Ok(()) => "Reconnecting to gate".to_string(),
                Err(e) => format!("Reconnect failed: {}", e),
            }
        }
        OperatorCommand::Authenticate => match link.authenticate() {
            Ok(()) => "Credentials resent".to_string(),
            Err(e) => format!("Credentials not sent: {}", e),
        },
        OperatorCommand::Status => format!("Gate link: {}", link.state()),
    }
}

/// Reads operator commands line by line until the input closes.
pub fn run_operator_console(input: impl BufRead, link: &GateLink) {
    for line in input.lines() {
        let line = match line {
            Ok(line) => line,
            Err(e) => {
                tracing::warn!("Operator console closed: {}", e);
                return;
            }
        };
        if line.trim().is_empty() {
            continue;
        }
        match OperatorCommand::parse(&line) {
            Some(command) => {
                tracing::info!("Operator command: {:?}", command);
                println!("{}", apply_operator_command(link, command));
            }
            None => println!("Unknown command {:?} (r = reconnect, a = authenticate, s = status)", line.trim()),
        }
    }
}

/// Still source for offline verification: always the same file.
struct FileStill(PathBuf);

impl StillCapture for FileStill {
    fn capture_still(&self) -> Result<PathBuf> {
        if self.0.exists() {
            Ok(self.0.clone())
        } else {
            Err(GateError::Camera(format!("Image not found: {}", self.0.display())))
        }
    }
}

impl Station {
    pub fn new(config: Config, dev_mode: DevMode) -> Result<Self> {
        Ok(Self {
            store: Arc::new(UserStore::new_with_dev_mode(&dev_mode)?),
            events: Arc::new(EventLog::new_with_dev_mode(&dev_mode)?),
            config,
            dev_mode,
        })
    }

    pub fn store(&self) -> &UserStore {
        &self.store
    }

    pub fn events(&self) -> &EventLog {
        &self.events
    }

    fn pipeline(&self, capture: Arc<dyn StillCapture>, embedder: Arc<dyn EmbeddingModel>) -> VerificationPipeline {
        VerificationPipeline::new(
            Collaborators {
                capture,
                preprocessor: Arc::new(ImagePreprocessor::new(&self.config)),
                embedder,
                users: self.store.clone(),
                sink: self.events.clone(),
            },
            VectorMatcher::new(self.config.matcher.distance_threshold),
        )
    }

    /// Creates the gate link and starts its handshake. A failed connect is
    /// reported and left for the operator to retry.
    pub fn connect_gate(&self) -> (Arc<GateLink>, Receiver<GateNotice>) {
        let gate = &self.config.gate;
        let link = Arc::new(GateLink::new(
            Arc::new(PairedDeviceTransport::new(gate.paired_devices.clone())),
            gate.device_name.clone(),
            gate.shared_secret.clone(),
        ));
        let notices = link.subscribe();

        match link.connect() {
            Ok(()) => {
                let timeout = Duration::from_millis(gate.auth_timeout_ms);
                if link.wait_for_state(ConnectionState::Authenticated, timeout) {
                    tracing::info!("Gate link authenticated");
                } else {
                    tracing::warn!("Gate link is {} after {:?}", link.state(), timeout);
                }
            }
            Err(e) => tracing::error!("Gate unavailable: {}", e),
        }

        (link, notices)
    }

    /// Live loop: camera frames in, gate commands out. Runs until the camera
    /// fails or `max_frames` frames have been processed.
    pub fn run(&self, max_frames: Option<u64>) -> Result<()> {
        let (gate, notices) = self.connect_gate();

        // Stdin stays off the frame thread; the console thread dies with the process.
        let console_link = Arc::clone(&gate);
        thread::Builder::new()
            .name("operator-console".into())
            .spawn(move || run_operator_console(io::stdin().lock(), &console_link))?;
        println!("Operator console: r = reconnect, a = authenticate, s = status");

        let still = Arc::new(LatestFrameStill::new(self.dev_mode.clone()));
        let embedder: Arc<dyn EmbeddingModel> = Arc::new(OnnxEmbedder::new(&self.config)?);
        let pipeline = Arc::new(self.pipeline(still.clone(), embedder).with_gate(gate.clone()));

        match pipeline.refresh_population() {
            Ok(0) => tracing::warn!("No users enrolled; every verification will be rejected"),
            Ok(_) => {}
            Err(e) => tracing::error!("Failed to load users: {}", e),
        }

        let (outcome_tx, outcomes) = mpsc::channel();
        let mut frame_loop = FrameLoop::new(CaptureTrigger::new(self.config.trigger.clone()), pipeline.clone())
            .with_display_threshold(self.config.detector.display_threshold)
            .with_outcomes(outcome_tx);

        // The detector loads in the background; the camera starts right away.
        let (detector_tx, detector_rx) = mpsc::channel();
        let detector_config = self.config.clone();
        thread::Builder::new().name("detector-load".into()).spawn(move || {
            let loaded = OnnxDetector::new(&detector_config).map(|d| Arc::new(d) as Arc<dyn DetectionModel>);
            let _ = detector_tx.send(loaded);
        })?;

        let mut camera = Camera::new(&self.config.camera)?;
        let mut session = camera.start_session()?;
        let mut frames = 0u64;
        let mut not_ready = 0u64;
        tracing::info!("Station running");

        while max_frames.map_or(true, |max| frames < max) {
            if let Ok(loaded) = detector_rx.try_recv() {
                frame_loop.attach_detector(loaded?);
                tracing::info!("Face detector ready after {} frames", frames);
            }

            let frame = Arc::new(session.capture_frame()?);
            frames += 1;
            still.update(Arc::clone(&frame));

            match frame_loop.on_frame(&frame, Instant::now()) {
                FrameDecision::Dispatched(_) => tracing::info!("Face in position, verifying"),
                FrameDecision::DetectorNotReady => not_ready += 1,
                FrameDecision::Busy | FrameDecision::Evaluated { .. } => {}
            }

            for outcome in outcomes.try_iter() {
                report_outcome(&outcome);
                if !outcome.verified {
                    // Reloaded by the next verification worker, not here.
                    pipeline.invalidate_population();
                }
            }

            for notice in notices.try_iter() {
                report_notice(&notice);
            }
        }

        let metrics = pipeline.metrics();
        tracing::info!(
            "Station stopped after {} frames ({} before detector was ready): {} verifications, {} verified, {} rejected",
            frames,
            not_ready,
            metrics.runs,
            metrics.verified,
            metrics.rejected
        );
        Ok(())
    }

    /// Runs the identification pipeline on an image file, without the gate.
    pub fn verify_image(&self, path: &Path) -> Result<VerificationOutcome> {
        let still = image::open(path)?;
        let embedder: Arc<dyn EmbeddingModel> = Arc::new(OnnxEmbedder::new(&self.config)?);
        let pipeline = self.pipeline(Arc::new(FileStill(path.to_path_buf())), embedder);
        let event = CaptureEvent { timestamp: Instant::now(), frame: FrameSize::of(&still) };
        Ok(pipeline.run(&event))
    }

    pub fn enroll_from_image(&self, user_id: &str, path: &Path) -> Result<()> {
        let image = image::open(path)?;
        let tensor = ImagePreprocessor::new(&self.config).prepare_image(&image);
        let embedding = OnnxEmbedder::new(&self.config)?.embed(tensor)?;
        self.store.add_user(user_id, embedding)
    }

    /// Connects, waits for authentication and sends one `FACE_DETECTED`.
    pub fn gate_test(&self) -> Result<bool> {
        let (link, notices) = self.connect_gate();
        let sent = match link.send(&Command::FaceDetected) {
            Ok(()) => {
                println!("✓ FACE_DETECTED sent to {}", self.config.gate.device_name);
                true
            }
            Err(e) => {
                println!("✗ Gate command refused: {}", e);
                false
            }
        };

        // Give the controller a moment to answer before hanging up.
        thread::sleep(Duration::from_millis(500));
        for notice in notices.try_iter() {
            report_notice(&notice);
        }
        link.disconnect();
        Ok(sent)
    }
}

fn report_outcome(outcome: &VerificationOutcome) {
    match (&outcome.matched_user_id, outcome.verified) {
        (Some(user), true) => println!("✓ Access granted: {} (distance {:.3})", user, outcome.distance.unwrap_or(0.0)),
        _ => println!("✗ Access denied: {}", outcome.reason.as_deref().unwrap_or("unknown")),
    }
}

fn report_notice(notice: &GateNotice) {
    match notice {
        GateNotice::StateChanged(state) => tracing::info!("Gate link: {}", state),
        GateNotice::AuthRejected(line) => tracing::warn!("Gate rejected credentials: {}", line),
        GateNotice::ConnectFailed(reason) => tracing::error!("Gate connect failed: {}", reason),
        GateNotice::TransportLost => tracing::error!("Gate transport lost; reconnect required"),
        GateNotice::Diagnostic(line) => tracing::debug!("Gate: {}", line),
    }
}

pub fn test_camera_dev(config: &Config, dev_mode: &DevMode) -> Result<()> {
    let mut camera = Camera::new(&config.camera)?;
    let img = camera.start_session()?.capture_frame()?;

    let save_path = dev_mode.get_capture_path("test_capture");
    img.save(&save_path)?;
    println!("Saved {}x{} test image to {:?}", img.width(), img.height(), save_path);
    Ok(())
}

/// Green boxes would fire a capture, yellow ones are shown but not eligible,
/// red ones fall under the display threshold.
fn visualize_detections(
    image: &DynamicImage,
    detections: &[Detection],
    trigger: &CaptureTrigger,
    display_threshold: f32,
) -> DynamicImage {
    let frame = FrameSize::of(image);
    let mut img = image.to_rgb8();

    for detection in detections {
        let bbox = &detection.bbox;
        if bbox.width <= 0.0 || bbox.height <= 0.0 {
            continue;
        }

        let color = if trigger.is_eligible(detection, frame) {
            Rgb([0, 255, 0])
        } else if detection.score >= display_threshold {
            Rgb([255, 255, 0])
        } else {
            Rgb([255, 0, 0])
        };

        let x1 = bbox.x.max(0.0) as i32;
        let y1 = bbox.y.max(0.0) as i32;
        let x2 = (bbox.x + bbox.width).min(img.width() as f32) as i32;
        let y2 = (bbox.y + bbox.height).min(img.height() as f32) as i32;
        let rect_width = (x2 - x1).max(1) as u32;
        let rect_height = (y2 - y1).max(1) as u32;

        draw_hollow_rect_mut(&mut img, Rect::at(x1, y1).of_size(rect_width, rect_height), color);
        if rect_width > 2 && rect_height > 2 {
            let inner = Rect::at(x1 + 1, y1 + 1).of_size(rect_width - 2, rect_height - 2);
            draw_hollow_rect_mut(&mut img, inner, color);
        }
    }

    DynamicImage::ImageRgb8(img)
}

pub fn test_detection_dev(config: &Config, dev_mode: &DevMode) -> Result<()> {
    let mut camera = Camera::new(&config.camera)?;
    let detector = OnnxDetector::new(config)?;
    let trigger = CaptureTrigger::new(config.trigger.clone());

    println!("Capturing frame from camera {}...", config.camera.device_index);
    let frame = camera.start_session()?.capture_frame()?;

    let detections = detector.detect(&frame)?;
    let eligible = detections
        .iter()
        .filter(|d| trigger.is_eligible(d, FrameSize::of(&frame)))
        .count();
    println!("Found {} face(s), {} in capture position", detections.len(), eligible);
    for (i, d) in detections.iter().enumerate().take(10) {
        println!(
            "  Face {}: score {:.3} at ({:.0}, {:.0}) {:.0}x{:.0}",
            i + 1,
            d.score,
            d.bbox.x,
            d.bbox.y,
            d.bbox.width,
            d.bbox.height
        );
    }

    let annotated = visualize_detections(&frame, &detections, &trigger, config.detector.display_threshold);
    let debug_path = dev_mode.get_debug_path("detection_annotated");
    annotated.save(&debug_path)?;
    println!("\nSaved annotated image to: {:?}", debug_path);

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gate::{ConnectError, GateStream, GateTransport};
    use std::io::{BufReader, Cursor};
    use std::os::unix::net::UnixStream;
    use std::sync::Mutex;

    /// Hands out socket ends in order, one per connect.
    struct QueuedTransport {
        ends: Mutex<Vec<UnixStream>>,
    }

    impl GateTransport for QueuedTransport {
        fn open(&self, _device_name: &str) -> std::result::Result<Box<dyn GateStream>, ConnectError> {
            let mut ends = self.ends.lock().unwrap();
            if ends.is_empty() {
                return Err(ConnectError::DeviceNotFound("GATE".into()));
            }
            Ok(Box::new(ends.remove(0)) as Box<dyn GateStream>)
        }
    }

    fn controller_pair() -> (UnixStream, BufReader<UnixStream>) {
        let (link_end, controller_end) = UnixStream::pair().unwrap();
        controller_end.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
        (link_end, BufReader::new(controller_end))
    }

    fn read_line(controller: &mut BufReader<UnixStream>) -> String {
        let mut line = String::new();
        controller.read_line(&mut line).unwrap();
        line
    }

    #[test]
    fn test_operator_command_parsing() {
        assert_eq!(OperatorCommand::parse("r"), Some(OperatorCommand::Reconnect));
        assert_eq!(OperatorCommand::parse("  Reconnect \n"), Some(OperatorCommand::Reconnect));
        assert_eq!(OperatorCommand::parse("A"), Some(OperatorCommand::Authenticate));
        assert_eq!(OperatorCommand::parse("auth"), Some(OperatorCommand::Authenticate));
        assert_eq!(OperatorCommand::parse("status"), Some(OperatorCommand::Status));
        assert_eq!(OperatorCommand::parse("open"), None);
        assert_eq!(OperatorCommand::parse(""), None);
    }

    #[test]
    fn test_operator_reconnect_replaces_session_and_rehandshakes() {
        let (first, mut old_controller) = controller_pair();
        let (second, mut new_controller) = controller_pair();
        let transport = Arc::new(QueuedTransport { ends: Mutex::new(vec![first, second]) });
        let link = GateLink::new(transport, "GATE", "Secret123");

        link.connect().unwrap();
        assert_eq!(read_line(&mut old_controller), "AUTHENTICATE Secret123\n");

        let message = apply_operator_command(&link, OperatorCommand::Reconnect);
        assert_eq!(message, "Reconnecting to gate");
        assert_eq!(read_line(&mut new_controller), "AUTHENTICATE Secret123\n");
        assert_eq!(read_line(&mut old_controller), "");
        assert_eq!(link.state(), ConnectionState::ConnectedUnauthenticated);

        let status = apply_operator_command(&link, OperatorCommand::Status);
        assert_eq!(status, "Gate link: connected (unauthenticated)");
    }

    #[test]
    fn test_operator_reconnect_without_device_stays_disconnected() {
        let link = GateLink::new(Arc::new(QueuedTransport { ends: Mutex::new(Vec::new()) }), "GATE", "Secret123");
        let notices = link.subscribe();

        let message = apply_operator_command(&link, OperatorCommand::Reconnect);

        assert!(message.starts_with("Reconnect failed"));
        assert_eq!(link.state(), ConnectionState::Disconnected);
        assert!(notices.try_iter().any(|n| matches!(n, GateNotice::ConnectFailed(_))));
    }

    #[test]
    fn test_console_resends_credentials_on_request() {
        let (link_end, mut controller) = controller_pair();
        let link = GateLink::new(Arc::new(QueuedTransport { ends: Mutex::new(vec![link_end]) }), "GATE", "Secret123");
        link.connect().unwrap();
        assert_eq!(read_line(&mut controller), "AUTHENTICATE Secret123\n");

        run_operator_console(Cursor::new("\nbogus\na\n"), &link);

        assert_eq!(read_line(&mut controller), "AUTHENTICATE Secret123\n");
    }

    #[test]
    fn test_file_still_requires_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("face.png");
        assert!(FileStill(path.clone()).capture_still().is_err());

        DynamicImage::new_rgb8(4, 4).save(&path).unwrap();
        assert_eq!(FileStill(path.clone()).capture_still().unwrap(), path);
    }

    #[test]
    fn test_visualization_colours_by_eligibility() {
        let frame = DynamicImage::new_rgb8(640, 480);
        let detections = [
            Detection::new(224.0, 144.0, 192.0, 192.0, 0.9),
            Detection::new(10.0, 10.0, 50.0, 50.0, 0.6),
            Detection::new(500.0, 300.0, 40.0, 40.0, 0.2),
        ];

        let annotated = visualize_detections(&frame, &detections, &CaptureTrigger::default(), 0.5).to_rgb8();

        assert_eq!(annotated.get_pixel(224, 144).0, [0, 255, 0]);
        assert_eq!(annotated.get_pixel(10, 10).0, [255, 255, 0]);
        assert_eq!(annotated.get_pixel(500, 300).0, [255, 0, 0]);
        assert_eq!(annotated.get_pixel(320, 240).0, [0, 0, 0]);
    }
}
