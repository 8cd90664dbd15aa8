//! Plugin error type and the CNI error reporter.
//!
//! Every fatal condition in the plugin is returned as a [`CniError`]. The
//! process entry point is the only place that turns one into the CNI error
//! document on stdout and a non-zero exit status.

use std::io::Write;

use thiserror::Error;
use tracing::error;

use crate::types::ErrorResult;

pub type CniResult<T> = std::result::Result<T, CniError>;

/// Exit status used for every reported error
pub const ERROR_EXIT_CODE: i32 = 1;

/// Well-known CNI error codes
pub mod code {
    pub const INCOMPATIBLE_VERSION: u32 = 1;
    pub const INVALID_ENVIRONMENT: u32 = 4;
    pub const IO_FAILURE: u32 = 5;
    pub const DECODE_FAILURE: u32 = 6;
    pub const INVALID_NETWORK_CONFIG: u32 = 7;
    // Plugin specific codes start at 100
    pub const POOL_EXHAUSTED: u32 = 100;
    pub const DEVICE_UNAVAILABLE: u32 = 101;
    pub const HOST_COMMAND_FAILED: u32 = 102;
    pub const LEDGER_CORRUPT: u32 = 103;
    pub const UNSUPPORTED: u32 = 104;
    pub const CHECK_FAILED: u32 = 105;
}

/// Broad classes of failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Bad environment or stdin; raised before the host is touched
    Configuration,
    /// Address pool or device naming could not be satisfied
    Allocation,
    /// A host command or file operation failed
    Host,
}

#[derive(Debug, Error)]
pub enum CniError {
    #[error("required environment variable {0} is missing or empty")]
    MissingEnv(&'static str),

    #[error("invalid value {value:?} for environment variable {name}")]
    InvalidEnv { name: &'static str, value: String },

    #[error("network configuration is empty")]
    EmptyConfig,

    #[error("failed to decode network configuration: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("invalid network configuration: {0}")]
    InvalidConfig(String),

    #[error("incompatible CNI version {0}")]
    IncompatibleVersion(String),

    #[error("no free address left in subnet {0}")]
    PoolExhausted(String),

    #[error("requested address {0} is not available")]
    AddressUnavailable(String),

    #[error("no free device name with prefix {0}")]
    DeviceUnavailable(String),

    #[error("command `{command}` failed: {stderr}")]
    HostCommand { command: String, stderr: String },

    #[error("allocation ledger {path} is corrupt: {reason}")]
    LedgerCorrupt { path: String, reason: String },

    #[error("check failed: {0}")]
    CheckFailed(String),

    #[error("{0} is not supported on this platform")]
    Unsupported(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}: {1}")]
    Chain(String, Box<CniError>),
}

impl CniError {
    pub fn config<S: Into<String>>(msg: S) -> Self {
        CniError::InvalidConfig(msg.into())
    }

    /// Add context to an error while keeping its code
    pub fn wrap<S: Into<String>>(msg: S, inner: CniError) -> Self {
        CniError::Chain(msg.into(), Box::new(inner))
    }

    /// Unwrap chained context down to the originating error
    pub fn root(&self) -> &CniError {
        match self {
            CniError::Chain(_, inner) => inner.root(),
            err => err,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self.root() {
            CniError::MissingEnv(_)
            | CniError::InvalidEnv { .. }
            | CniError::EmptyConfig
            | CniError::Decode(_)
            | CniError::InvalidConfig(_)
            | CniError::IncompatibleVersion(_) => ErrorKind::Configuration,
            CniError::PoolExhausted(_)
            | CniError::AddressUnavailable(_)
            | CniError::DeviceUnavailable(_)
            | CniError::LedgerCorrupt { .. } => ErrorKind::Allocation,
            _ => ErrorKind::Host,
        }
    }

    /// Numeric code placed in the CNI error document
    pub fn code(&self) -> u32 {
        match self.root() {
            CniError::MissingEnv(_) | CniError::InvalidEnv { .. } => code::INVALID_ENVIRONMENT,
            CniError::Decode(_) => code::DECODE_FAILURE,
            CniError::EmptyConfig | CniError::InvalidConfig(_) => code::INVALID_NETWORK_CONFIG,
            CniError::IncompatibleVersion(_) => code::INCOMPATIBLE_VERSION,
            CniError::PoolExhausted(_) | CniError::AddressUnavailable(_) => code::POOL_EXHAUSTED,
            CniError::DeviceUnavailable(_) => code::DEVICE_UNAVAILABLE,
            CniError::HostCommand { .. } => code::HOST_COMMAND_FAILED,
            CniError::LedgerCorrupt { .. } => code::LEDGER_CORRUPT,
            CniError::Unsupported(_) => code::UNSUPPORTED,
            CniError::CheckFailed(_) => code::CHECK_FAILED,
            CniError::Io(_) => code::IO_FAILURE,
            CniError::Chain(..) => unreachable!("root() never returns a chain"),
        }
    }

    fn details(&self) -> Option<String> {
        match self.root() {
            CniError::HostCommand { command, .. } => Some(command.clone()),
            CniError::LedgerCorrupt { path, .. } => Some(path.clone()),
            _ => None,
        }
    }

    /// Build the CNI error document for this error
    pub fn to_error_result(&self, cni_version: &str) -> ErrorResult {
        ErrorResult {
            cni_version: cni_version.to_string(),
            code: self.code(),
            msg: self.to_string(),
            details: self.details(),
        }
    }

    /// Write the CNI error document to `out` and return the exit status the
    /// process must terminate with.
    pub fn report<W: Write>(&self, cni_version: &str, out: &mut W) -> i32 {
        error!("CNI plugin error: {}", self);
        let doc = self.to_error_result(cni_version);
        let written = serde_json::to_writer(&mut *out, &doc)
            .map_err(std::io::Error::from)
            .and_then(|_| writeln!(out))
            .and_then(|_| out.flush());
        if let Err(e) = written {
            error!("failed to write error document: {}", e);
        }
        ERROR_EXIT_CODE
    }
}

/// Attach a message to any error convertible into a [`CniError`]
pub trait ErrorWrap<T> {
    fn wrap<S: Into<String>>(self, msg: S) -> CniResult<T>;
}

impl<T, E: Into<CniError>> ErrorWrap<T> for std::result::Result<T, E> {
    fn wrap<S: Into<String>>(self, msg: S) -> CniResult<T> {
        self.map_err(|err| CniError::wrap(msg, err.into()))
    }
}
