use thiserror::Error;

use crate::status::{DfuState, DfuStatus};

/// Every failure mode a DFU operation (transfer, file parse, or CLI
/// invocation) can produce. Exit code mapping lives in the binaries, not
/// here: the library only classifies, the binary decides the process exit.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    #[error("usage error: {0}")]
    UsageError(String),

    #[error("USB transport error while {action}")]
    TransportError {
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
        action: &'static str,
    },

    #[error("protocol error: {0}")]
    ProtocolError(String),

    #[error("device reported an error status: {status:?} ({})", .status.description())]
    DeviceStatusError { status: DfuStatus },

    #[error("device in wrong mode: {0}")]
    WrongMode(String),

    #[error("address 0x{address:08x} is not {requirement} in the device's memory layout")]
    AddressError {
        address: u32,
        requirement: &'static str,
    },

    #[error("bad firmware file format: {0}")]
    FileFormatError(String),

    #[error("unsupported DFU file revision {0:#06x}")]
    UnsupportedVersion(u16),

    #[error("I/O error")]
    IoError(#[from] std::io::Error),
}

impl Error {
    pub fn transport(action: &'static str, source: impl std::error::Error + Send + Sync + 'static) -> Self {
        Error::TransportError {
            source: Box::new(source),
            action,
        }
    }

    /// Exit code per spec §6: 0 success, 64 usage, 74 I/O/device, 70 internal.
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::UsageError(_) => 64,
            Error::ProtocolError(_) => 70,
            Error::TransportError { .. }
            | Error::DeviceStatusError { .. }
            | Error::WrongMode(_)
            | Error::AddressError { .. }
            | Error::FileFormatError(_)
            | Error::UnsupportedVersion(_)
            | Error::IoError(_) => 74,
        }
    }
}

/// A protocol-level state mismatch, kept separate from [`Error`] because
/// several callers want to match on it before converting (e.g. the
/// reconciliation loop treats `dfuERROR` specially).
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateError {
    #[error("device entered unexpected state: expected {expected:?}, got {actual:?}")]
    Unexpected { expected: DfuState, actual: DfuState },
}

impl From<StateError> for Error {
    fn from(e: StateError) -> Self {
        Error::ProtocolError(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
