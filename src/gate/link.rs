use crate::gate::protocol::{secret_fingerprint, Command, Inbound};
use crate::gate::state::{ConnectionState, LinkEvent};
use crate::gate::transport::{ConnectError, GateStream, GateTransport};
use std::io::{BufRead, BufReader, Read, Write};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SendError {
    #[error("not authenticated")]
    NotAuthenticated,

    #[error("gate link is not connected")]
    NotConnected,

    #[error("command spans more than one line")]
    MultiLine,

    #[error("gate write failed: {0}")]
    Io(String),
}

/// Status updates for the UI layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateNotice {
    StateChanged(ConnectionState),
    /// The controller refused or forgot our credentials.
    AuthRejected(String),
    ConnectFailed(String),
    TransportLost,
    /// Any inbound line the protocol does not recognise.
    Diagnostic(String),
}

/// The only part of the link the verification pipeline needs.
pub trait GateCommandSink: Send + Sync {
    fn is_authenticated(&self) -> bool;
    fn send(&self, command: &Command) -> Result<(), SendError>;
}

struct Session {
    state: ConnectionState,
    stream: Option<Box<dyn GateStream>>,
    /// Bumped on every link-up so readers of older connections can be ignored.
    generation: u64,
}

struct Shared {
    session: Mutex<Session>,
    changed: Condvar,
    notices: Mutex<Option<Sender<GateNotice>>>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Session> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn notify(&self, notice: GateNotice) {
        let notices = self.notices.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(tx) = notices.as_ref() {
            let _ = tx.send(notice);
        }
    }

    /// Every state change goes through here, with the session lock held.
    fn apply(&self, session: &mut Session, event: LinkEvent) {
        let previous = session.state;
        let next = previous.on(&event);

        match &event {
            LinkEvent::Inbound(Inbound::AuthFailed) if previous == ConnectionState::ConnectedUnauthenticated => {
                tracing::warn!("Gate controller rejected the shared secret");
                self.notify(GateNotice::AuthRejected("authentication failed".into()));
            }
            LinkEvent::Inbound(Inbound::NotAuthenticated) if previous.is_connected() => {
                tracing::warn!("Gate controller reports this client is not authenticated");
                self.notify(GateNotice::AuthRejected("not authenticated".into()));
            }
            LinkEvent::Inbound(Inbound::Diagnostic(line)) => {
                tracing::debug!("Gate controller: {}", line);
                self.notify(GateNotice::Diagnostic(line.clone()));
            }
            LinkEvent::TransportError if previous != ConnectionState::Disconnected => {
                tracing::warn!("Gate transport lost");
                self.notify(GateNotice::TransportLost);
            }
            _ => {}
        }

        if next == ConnectionState::Disconnected {
            if let Some(stream) = session.stream.take() {
                if let Err(e) = stream.shutdown() {
                    tracing::debug!("Gate stream shutdown: {}", e);
                }
            }
        }

        if next != previous {
            tracing::info!("Gate link {} -> {}", previous, next);
            session.state = next;
            self.notify(GateNotice::StateChanged(next));
            self.changed.notify_all();
        }
    }

    fn write_line(&self, session: &mut Session, command: &Command) -> Result<(), SendError> {
        if !command.is_single_line() {
            tracing::warn!("Refusing to send {:?}: embedded line break", command);
            return Err(SendError::MultiLine);
        }
        let Some(stream) = session.stream.as_mut() else {
            return Err(SendError::NotConnected);
        };

        let line = command.to_line();
        let result = stream.write_all(line.as_bytes()).and_then(|_| stream.flush());
        match result {
            Ok(()) => {
                tracing::debug!("Gate <- {:?}", command);
                Ok(())
            }
            Err(e) => {
                self.apply(session, LinkEvent::TransportError);
                Err(SendError::Io(e.to_string()))
            }
        }
    }

    fn on_inbound(&self, generation: u64, event: LinkEvent) {
        let mut session = self.lock();
        if session.generation != generation {
            return;
        }
        self.apply(&mut session, event);
    }
}

/// Authenticated command channel to the gate controller.
///
/// Owns the device stream exclusively. Callers never touch the stream: all
/// writes go through [`GateLink::send`], which refuses operational commands
/// until the handshake has succeeded.
pub struct GateLink {
    shared: Arc<Shared>,
    transport: Arc<dyn GateTransport>,
    device_name: String,
    secret: String,
}

impl GateLink {
    pub fn new(transport: Arc<dyn GateTransport>, device_name: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            shared: Arc::new(Shared {
                session: Mutex::new(Session {
                    state: ConnectionState::Disconnected,
                    stream: None,
                    generation: 0,
                }),
                changed: Condvar::new(),
                notices: Mutex::new(None),
            }),
            transport,
            device_name: device_name.into(),
            secret: secret.into(),
        }
    }

    /// Notices go to the most recent subscriber only.
    pub fn subscribe(&self) -> Receiver<GateNotice> {
        let (tx, rx) = mpsc::channel();
        *self.shared.notices.lock().unwrap_or_else(PoisonError::into_inner) = Some(tx);
        rx
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.lock().state
    }

    /// Blocks until the link reaches `target` or `timeout` elapses.
    pub fn wait_for_state(&self, target: ConnectionState, timeout: Duration) -> bool {
        let session = self.shared.lock();
        let (session, _) = self
            .shared
            .changed
            .wait_timeout_while(session, timeout, |s| s.state != target)
            .unwrap_or_else(PoisonError::into_inner);
        session.state == target
    }

    /// Opens the device and starts the handshake. Failures are reported and
    /// never retried here; reconnecting is up to the caller.
    pub fn connect(&self) -> Result<(), ConnectError> {
        {
            let mut session = self.shared.lock();
            if session.state != ConnectionState::Disconnected {
                return Err(ConnectError::AlreadyActive(session.state.to_string()));
            }
            self.shared.apply(&mut session, LinkEvent::ConnectRequested);
        }

        tracing::info!(
            "Connecting to gate {} (secret {})",
            self.device_name,
            secret_fingerprint(&self.secret)
        );

        // Device I/O happens without the session lock held.
        let opened = self
            .transport
            .open(&self.device_name)
            .and_then(|stream| {
                let reader = stream
                    .try_clone_reader()
                    .map_err(|e| ConnectError::OpenFailed(e.to_string()))?;
                Ok((stream, reader))
            });

        let (stream, reader) = match opened {
            Ok(pair) => pair,
            Err(e) => {
                tracing::warn!("Gate connect failed: {}", e);
                let mut session = self.shared.lock();
                self.shared.apply(&mut session, LinkEvent::ConnectFailed);
                self.shared.notify(GateNotice::ConnectFailed(e.to_string()));
                return Err(e);
            }
        };

        let mut session = self.shared.lock();
        if session.state != ConnectionState::Connecting {
            let _ = stream.shutdown();
            return Err(ConnectError::Cancelled);
        }

        session.generation += 1;
        let generation = session.generation;
        session.stream = Some(stream);

        let shared = Arc::clone(&self.shared);
        let spawned = thread::Builder::new()
            .name("gate-reader".into())
            .spawn(move || read_loop(shared, generation, reader));
        if let Err(e) = spawned {
            self.shared.apply(&mut session, LinkEvent::ConnectFailed);
            session.stream = None;
            return Err(ConnectError::OpenFailed(format!("reader thread: {}", e)));
        }

        self.shared.apply(&mut session, LinkEvent::LinkUp);
        self.shared
            .write_line(&mut session, &Command::Authenticate(self.secret.clone()))
            .map_err(|e| ConnectError::OpenFailed(format!("handshake: {}", e)))
    }

    /// Resends the shared secret after an `AUTH_FAILED` or `NOT_AUTHENTICATED`.
    pub fn authenticate(&self) -> Result<(), SendError> {
        self.send(&Command::Authenticate(self.secret.clone()))
    }

    pub fn send(&self, command: &Command) -> Result<(), SendError> {
        let mut session = self.shared.lock();
        if session.state != ConnectionState::Authenticated && !command.is_authenticate() {
            tracing::warn!("Refusing to send {:?}: link is {}", command, session.state);
            return Err(SendError::NotAuthenticated);
        }
        self.shared.write_line(&mut session, command)
    }

    /// Drops the connection and releases the device.
    pub fn disconnect(&self) {
        let mut session = self.shared.lock();
        self.shared.apply(&mut session, LinkEvent::Disconnect);
    }
}

impl GateCommandSink for GateLink {
    fn is_authenticated(&self) -> bool {
        self.state() == ConnectionState::Authenticated
    }

    fn send(&self, command: &Command) -> Result<(), SendError> {
        GateLink::send(self, command)
    }
}

impl Drop for GateLink {
    fn drop(&mut self) {
        self.disconnect();
    }
}

fn read_loop(shared: Arc<Shared>, generation: u64, reader: Box<dyn Read + Send>) {
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();

    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf) {
            Ok(0) => {
                tracing::debug!("Gate reader {} reached end of stream", generation);
                break;
            }
            Ok(_) => {
                let line = String::from_utf8_lossy(&buf);
                if let Some(message) = Inbound::parse(&line) {
                    shared.on_inbound(generation, LinkEvent::Inbound(message));
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => {
                tracing::debug!("Gate reader {} failed: {}", generation, e);
                break;
            }
        }
    }

    shared.on_inbound(generation, LinkEvent::TransportError);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gate::protocol::FACE_DETECTED;
    use std::os::unix::net::UnixStream;

    const WAIT: Duration = Duration::from_secs(2);

    /// Hands out one end of a socket pair; the test plays the controller.
    struct PairTransport {
        link_end: Mutex<Option<UnixStream>>,
    }

    impl GateTransport for PairTransport {
        fn open(&self, _device_name: &str) -> Result<Box<dyn GateStream>, ConnectError> {
            self.link_end
                .lock()
                .unwrap()
                .take()
                .map(|s| Box::new(s) as Box<dyn GateStream>)
                .ok_or_else(|| ConnectError::DeviceNotFound("GATE".into()))
        }
    }

    struct Controller {
        reader: BufReader<UnixStream>,
        writer: UnixStream,
    }

    impl Controller {
        fn read_line(&mut self) -> String {
            let mut line = String::new();
            self.reader.read_line(&mut line).unwrap();
            line
        }

        fn reply(&mut self, line: &str) {
            self.writer.write_all(line.as_bytes()).unwrap();
            self.writer.flush().unwrap();
        }
    }

    fn connected_link() -> (GateLink, Controller, Receiver<GateNotice>) {
        let (link_end, controller_end) = UnixStream::pair().unwrap();
        controller_end.set_read_timeout(Some(WAIT)).unwrap();
        let transport = Arc::new(PairTransport { link_end: Mutex::new(Some(link_end)) });
        let link = GateLink::new(transport, "GATE", "Secret123");
        let notices = link.subscribe();

        link.connect().unwrap();

        let controller = Controller {
            reader: BufReader::new(controller_end.try_clone().unwrap()),
            writer: controller_end,
        };
        (link, controller, notices)
    }

    fn wait_for_notice(notices: &Receiver<GateNotice>, wanted: impl Fn(&GateNotice) -> bool) -> bool {
        while let Ok(notice) = notices.recv_timeout(WAIT) {
            if wanted(&notice) {
                return true;
            }
        }
        false
    }

    #[test]
    fn test_connect_sends_handshake_immediately() {
        let (link, mut controller, _notices) = connected_link();
        assert_eq!(controller.read_line(), "AUTHENTICATE Secret123\n");
        assert_eq!(link.state(), ConnectionState::ConnectedUnauthenticated);
    }

    #[test]
    fn test_operational_command_gated_until_auth_success() {
        let (link, mut controller, _notices) = connected_link();
        controller.read_line();

        assert_eq!(link.send(&Command::FaceDetected), Err(SendError::NotAuthenticated));

        controller.reply("AUTH_SUCCESS\r\n");
        assert!(link.wait_for_state(ConnectionState::Authenticated, WAIT));
        assert!(link.is_authenticated());

        link.send(&Command::FaceDetected).unwrap();
        // The rejected send wrote nothing, so this is the next line on the wire.
        assert_eq!(controller.read_line().trim(), FACE_DETECTED);
    }

    #[test]
    fn test_secret_with_line_break_never_reaches_the_wire() {
        let (link_end, controller_end) = UnixStream::pair().unwrap();
        controller_end.set_read_timeout(Some(Duration::from_millis(300))).unwrap();
        let transport = Arc::new(PairTransport { link_end: Mutex::new(Some(link_end)) });
        let link = GateLink::new(transport, "GATE", "x\nFACE_DETECTED");

        assert!(matches!(link.connect(), Err(ConnectError::OpenFailed(_))));
        assert_eq!(link.authenticate(), Err(SendError::MultiLine));
        assert_ne!(link.state(), ConnectionState::Authenticated);

        let mut reader = BufReader::new(controller_end);
        let mut line = String::new();
        let read = reader.read_line(&mut line);
        assert!(read.is_err() || read.unwrap() == 0, "unexpected wire data: {:?}", line);
    }

    #[test]
    fn test_auth_failed_keeps_link_unauthenticated() {
        let (link, mut controller, notices) = connected_link();
        controller.read_line();

        controller.reply("AUTH_FAILED\n");
        assert!(wait_for_notice(&notices, |n| matches!(n, GateNotice::AuthRejected(_))));
        assert_eq!(link.state(), ConnectionState::ConnectedUnauthenticated);
        assert_eq!(link.send(&Command::FaceDetected), Err(SendError::NotAuthenticated));

        link.authenticate().unwrap();
        assert_eq!(controller.read_line(), "AUTHENTICATE Secret123\n");
    }

    #[test]
    fn test_not_authenticated_reply_demotes_link() {
        let (link, mut controller, notices) = connected_link();
        controller.read_line();
        controller.reply("AUTH_SUCCESS\n");
        assert!(link.wait_for_state(ConnectionState::Authenticated, WAIT));

        controller.reply("NOT_AUTHENTICATED\n");
        assert!(link.wait_for_state(ConnectionState::ConnectedUnauthenticated, WAIT));
        assert!(wait_for_notice(&notices, |n| matches!(n, GateNotice::AuthRejected(_))));
    }

    #[test]
    fn test_unknown_lines_surface_as_diagnostics() {
        let (link, mut controller, notices) = connected_link();
        controller.read_line();

        controller.reply("  battery 87%  \n");
        assert!(wait_for_notice(&notices, |n| *n == GateNotice::Diagnostic("battery 87%".into())));
        assert_eq!(link.state(), ConnectionState::ConnectedUnauthenticated);
    }

    #[test]
    fn test_controller_hangup_disconnects() {
        let (link, mut controller, notices) = connected_link();
        controller.read_line();
        drop(controller);

        assert!(link.wait_for_state(ConnectionState::Disconnected, WAIT));
        assert!(wait_for_notice(&notices, |n| *n == GateNotice::TransportLost));
        assert_eq!(link.send(&Command::FaceDetected), Err(SendError::NotAuthenticated));
        assert_eq!(link.authenticate(), Err(SendError::NotConnected));
    }

    #[test]
    fn test_disconnect_releases_device() {
        let (link, mut controller, _notices) = connected_link();
        controller.read_line();

        link.disconnect();

        assert_eq!(link.state(), ConnectionState::Disconnected);
        let mut rest = String::new();
        assert_eq!(controller.reader.read_line(&mut rest).unwrap(), 0);
    }

    #[test]
    fn test_connect_failure_is_reported_and_not_retried() {
        let transport = Arc::new(PairTransport { link_end: Mutex::new(None) });
        let link = GateLink::new(transport, "GATE", "Secret123");
        let notices = link.subscribe();

        let err = link.connect().unwrap_err();

        assert!(matches!(err, ConnectError::DeviceNotFound(_)));
        assert_eq!(link.state(), ConnectionState::Disconnected);
        assert!(wait_for_notice(&notices, |n| matches!(n, GateNotice::ConnectFailed(_))));
    }

    #[test]
    fn test_second_connect_while_active_is_refused() {
        let (link, mut controller, _notices) = connected_link();
        controller.read_line();
        assert!(matches!(link.connect(), Err(ConnectError::AlreadyActive(_))));
    }
}
