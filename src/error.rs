//! Error types for cdmroute.
//!
//! Per-candidate and per-vault failures are recovered inside the engine; only
//! the terminal variants ([`Error::SelectionExhausted`],
//! [`Error::FallbackExhausted`], [`Error::Cancelled`]) are expected to reach a
//! caller of [`crate::engine::Engine::acquire`]. Messages carry identifiers
//! (service tag, KID, candidate name) and never key material or secrets.

use std::fmt;

use thiserror::Error;

/// One failed candidate inside a [`Error::FallbackExhausted`] report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attempt {
    /// Descriptor name of the candidate.
    pub candidate: String,
    /// Why the candidate was skipped or failed.
    pub reason: String,
}

impl fmt::Display for Attempt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.candidate, self.reason)
    }
}

/// Main error type for cdmroute operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Malformed or inconsistent selection, vault or remote CDM definitions.
    #[error("Config error: {0}")]
    Config(String),

    /// No selection level matched and no default existed.
    #[error("No CDM configured for service {service} (evaluated: {})", .trail.join(" -> "))]
    SelectionExhausted { service: String, trail: Vec<String> },

    /// The candidate's DRM type or device identity disagrees with the content
    /// or with what the remote API reported.
    #[error("Device mismatch: {0}")]
    DeviceMismatch(String),

    /// Transport failure, non-success response or failed success condition.
    #[error("Remote API error: {0}")]
    RemoteApi(String),

    /// A single vault backend is unreachable or rejected the request.
    #[error("Vault {vault} unavailable: {reason}")]
    VaultUnavailable { vault: String, reason: String },

    /// Every candidate in the fallback sequence failed.
    #[error("All CDM candidates failed for service {service}: {}", join_attempts(.attempts))]
    FallbackExhausted {
        service: String,
        attempts: Vec<Attempt>,
    },

    /// The caller cancelled the acquisition.
    #[error("Acquisition cancelled")]
    Cancelled,

    /// The PSSH / init data is invalid or empty.
    #[error("Invalid init data: {0}")]
    InvalidInitData(String),

    /// A local device identity file could not be read.
    #[error("Invalid device file: {0}")]
    InvalidDeviceFile(String),

    /// IO error.
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    /// YAML error.
    #[error("YAML error: {0}")]
    YamlError(#[from] serde_yaml::Error),

    /// JSON error.
    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    /// HTTP client error.
    #[error("HTTP error: {0}")]
    HttpError(#[from] reqwest::Error),

    /// SQLite error.
    #[error("SQLite error: {0}")]
    SqliteError(#[from] rusqlite::Error),

    /// MySQL error.
    #[error("MySQL error: {0}")]
    MysqlError(#[from] mysql_async::Error),

    /// Base64 decode error.
    #[error("Base64 decode error: {0}")]
    Base64DecodeError(#[from] base64::DecodeError),

    /// Hex decode error.
    #[error("Hex decode error: {0}")]
    HexDecodeError(#[from] hex::FromHexError),

    /// Generic error.
    #[error("{0}")]
    Other(String),
}

/// Coarse classification of an [`Error`], for callers that map failures to
/// exit codes or retry decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Config,
    Selection,
    DeviceMismatch,
    Remote,
    Vault,
    Fallback,
    Cancelled,
    Input,
    Internal,
}

impl Error {
    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Config(_) | Error::YamlError(_) => ErrorKind::Config,
            Error::SelectionExhausted { .. } => ErrorKind::Selection,
            Error::DeviceMismatch(_) => ErrorKind::DeviceMismatch,
            Error::RemoteApi(_) | Error::HttpError(_) | Error::JsonError(_) => ErrorKind::Remote,
            Error::VaultUnavailable { .. } | Error::SqliteError(_) | Error::MysqlError(_) => {
                ErrorKind::Vault
            }
            Error::FallbackExhausted { .. } => ErrorKind::Fallback,
            Error::Cancelled => ErrorKind::Cancelled,
            Error::InvalidInitData(_)
            | Error::InvalidDeviceFile(_)
            | Error::Base64DecodeError(_)
            | Error::HexDecodeError(_) => ErrorKind::Input,
            Error::IoError(_) | Error::Other(_) => ErrorKind::Internal,
        }
    }

    /// Process exit code a host CLI should use for this error.
    pub fn exit_code(&self) -> i32 {
        match self.kind() {
            ErrorKind::Config => 2,
            ErrorKind::Selection => 3,
            ErrorKind::DeviceMismatch | ErrorKind::Remote | ErrorKind::Fallback => 4,
            ErrorKind::Vault => 5,
            ErrorKind::Cancelled => 130,
            ErrorKind::Input | ErrorKind::Internal => 1,
        }
    }

    /// Whether the fallback sequencer may move on to the next candidate.
    /// A candidate that cannot even be built (missing local CDM, bad auth
    /// type) is recorded like any other failure; only cancellation stops.
    pub fn is_candidate_recoverable(&self) -> bool {
        self.kind() != ErrorKind::Cancelled
    }
}

fn join_attempts(attempts: &[Attempt]) -> String {
    attempts
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Result type alias for cdmroute operations.
pub type Result<T> = std::result::Result<T, Error>;
