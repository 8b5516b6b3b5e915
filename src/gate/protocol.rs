//! Line-oriented ASCII protocol spoken with the gate controller.

use rand::distributions::Alphanumeric;
use rand::Rng;
use sha2::{Digest, Sha256};
use std::fmt;

pub const AUTHENTICATE_VERB: &str = "AUTHENTICATE";
pub const FACE_DETECTED: &str = "FACE_DETECTED";

pub const AUTH_SUCCESS: &str = "AUTH_SUCCESS";
pub const AUTH_FAILED: &str = "AUTH_FAILED";
pub const NOT_AUTHENTICATED: &str = "NOT_AUTHENTICATED";

/// Outbound commands.
#[derive(Clone, PartialEq, Eq)]
pub enum Command {
    Authenticate(String),
    FaceDetected,
}

impl Command {
    /// Encodes the command as a newline-terminated wire line.
    pub fn to_line(&self) -> String {
        match self {
            Command::Authenticate(secret) => format!("{} {}\n", AUTHENTICATE_VERB, secret),
            Command::FaceDetected => format!("{}\n", FACE_DETECTED),
        }
    }

    pub fn is_authenticate(&self) -> bool {
        matches!(self, Command::Authenticate(_))
    }

    /// A command must occupy exactly one wire line. A secret carrying CR or LF
    /// would smuggle a second command past the authentication gate.
    pub fn is_single_line(&self) -> bool {
        match self {
            Command::Authenticate(secret) => !secret.contains(['\r', '\n']),
            Command::FaceDetected => true,
        }
    }
}

// Keeps the shared secret out of logs.
impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::Authenticate(secret) => {
                write!(f, "Authenticate(<secret {}>)", secret_fingerprint(secret))
            }
            Command::FaceDetected => f.write_str("FaceDetected"),
        }
    }
}

/// Inbound lines, after trimming.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    AuthSuccess,
    AuthFailed,
    NotAuthenticated,
    Diagnostic(String),
}

impl Inbound {
    /// Returns `None` for blank lines.
    pub fn parse(line: &str) -> Option<Self> {
        let line = line.trim();
        if line.is_empty() {
            return None;
        }
        Some(match line {
            AUTH_SUCCESS => Inbound::AuthSuccess,
            AUTH_FAILED => Inbound::AuthFailed,
            NOT_AUTHENTICATED => Inbound::NotAuthenticated,
            other => Inbound::Diagnostic(other.to_string()),
        })
    }
}

/// Short, stable identifier for a secret that is safe to log.
pub fn secret_fingerprint(secret: &str) -> String {
    let digest = Sha256::digest(secret.as_bytes());
    digest[..4].iter().map(|b| format!("{:02x}", b)).collect()
}

/// Random ASCII alphanumeric secret, the only alphabet the controller accepts.
pub fn generate_secret(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}
