use crate::common::config::PairedDevice;
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::net::Shutdown;
use std::os::unix::io::AsRawFd;
use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;

/// How long the reader may sit in `poll` before rechecking for shutdown.
const READ_POLL_INTERVAL_MS: libc::c_int = 100;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConnectError {
    #[error("Gate device not found: {0}")]
    DeviceNotFound(String),

    #[error("Permission denied opening gate device: {0}")]
    PermissionDenied(String),

    #[error("Failed to open gate device: {0}")]
    OpenFailed(String),

    #[error("Gate link already {0}")]
    AlreadyActive(String),

    #[error("Connect attempt cancelled by disconnect")]
    Cancelled,
}

/// Byte stream to the controller. The link keeps the stream for writing and
/// hands a reader clone to its inbound thread.
pub trait GateStream: Read + Write + Send {
    fn try_clone_reader(&self) -> io::Result<Box<dyn Read + Send>>;

    /// Unblocks the reader where the platform allows it.
    fn shutdown(&self) -> io::Result<()> {
        Ok(())
    }
}

/// A device node (RFCOMM, tty) opened as a file.
///
/// A blocking `read` on a tty cannot be interrupted from another thread, so the
/// reader half polls with a timeout and gives up once the stream is shut down
/// or dropped. Both descriptors are closed shortly after `shutdown`.
pub struct DeviceStream {
    file: File,
    closed: Arc<AtomicBool>,
}

impl DeviceStream {
    pub fn new(file: File) -> Self {
        Self { file, closed: Arc::new(AtomicBool::new(false)) }
    }
}

impl Read for DeviceStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.file.read(buf)
    }
}

impl Write for DeviceStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.file.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}

impl GateStream for DeviceStream {
    fn try_clone_reader(&self) -> io::Result<Box<dyn Read + Send>> {
        Ok(Box::new(PolledReader {
            file: self.file.try_clone()?,
            closed: Arc::clone(&self.closed),
        }))
    }

    fn shutdown(&self) -> io::Result<()> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }
}

impl Drop for DeviceStream {
    fn drop(&mut self) {
        self.closed.store(true, Ordering::Release);
    }
}

/// Reader half of a [`DeviceStream`]. Reports end of stream once closed.
struct PolledReader {
    file: File,
    closed: Arc<AtomicBool>,
}

impl Read for PolledReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            if self.closed.load(Ordering::Acquire) {
                return Ok(0);
            }

            let mut pfd = libc::pollfd { fd: self.file.as_raw_fd(), events: libc::POLLIN, revents: 0 };
            // SAFETY: `pfd` is a single valid pollfd whose descriptor is owned by `self.file`.
            let ready = unsafe { libc::poll(&mut pfd, 1, READ_POLL_INTERVAL_MS) };
            if ready < 0 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(err);
            }
            if ready > 0 {
                if self.closed.load(Ordering::Acquire) {
                    return Ok(0);
                }
                return self.file.read(buf);
            }
        }
    }
}

impl GateStream for UnixStream {
    fn try_clone_reader(&self) -> io::Result<Box<dyn Read + Send>> {
        Ok(Box::new(self.try_clone()?))
    }

    fn shutdown(&self) -> io::Result<()> {
        UnixStream::shutdown(self, Shutdown::Both)
    }
}

/// Finds the paired controller by name and opens a stream to it.
pub trait GateTransport: Send + Sync {
    fn open(&self, device_name: &str) -> Result<Box<dyn GateStream>, ConnectError>;
}

/// Opens paired controllers exposed as device nodes (RFCOMM, tty).
#[derive(Debug, Clone)]
pub struct PairedDeviceTransport {
    devices: Vec<PairedDevice>,
}

impl PairedDeviceTransport {
    pub fn new(devices: Vec<PairedDevice>) -> Self {
        Self { devices }
    }

    pub fn discover(&self, device_name: &str) -> Result<PathBuf, ConnectError> {
        let device = self
            .devices
            .iter()
            .find(|d| d.name == device_name)
            .ok_or_else(|| ConnectError::DeviceNotFound(format!("{} is not paired", device_name)))?;

        if !device.path.exists() {
            return Err(ConnectError::DeviceNotFound(format!(
                "{} is paired at {} but the node is missing",
                device_name,
                device.path.display()
            )));
        }
        Ok(device.path.clone())
    }
}

impl GateTransport for PairedDeviceTransport {
    fn open(&self, device_name: &str) -> Result<Box<dyn GateStream>, ConnectError> {
        let path = self.discover(device_name)?;
        tracing::debug!("Opening gate device {} at {}", device_name, path.display());

        match OpenOptions::new().read(true).write(true).open(&path) {
            Ok(file) => Ok(Box::new(DeviceStream::new(file))),
            Err(e) if e.kind() == io::ErrorKind::PermissionDenied => {
                Err(ConnectError::PermissionDenied(path.display().to_string()))
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                Err(ConnectError::DeviceNotFound(path.display().to_string()))
            }
            Err(e) => Err(ConnectError::OpenFailed(format!("{}: {}", path.display(), e))),
        }
    }
}
