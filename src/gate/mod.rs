pub mod link;
pub mod protocol;
pub mod state;
pub mod transport;

pub use link::{GateCommandSink, GateLink, GateNotice, SendError};
pub use protocol::{Command, Inbound};
pub use state::{ConnectionState, LinkEvent};
pub use transport::{ConnectError, GateStream, GateTransport, PairedDeviceTransport};
