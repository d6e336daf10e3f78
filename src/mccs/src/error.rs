use thiserror::Error;

use crate::bootstrap::BootstrapError;
use crate::gpu::DeviceError;
use crate::plan::PlanError;
use crate::transport::fabric::FabricError;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorCode {
    InvalidUsage,
    InternalError,
    ExecutorError,
    RemoteError,
    SystemError,
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("Invalid usage: {0}")]
    InvalidUsage(String),
    #[error("Internal error: {0}")]
    Internal(String),
    #[error("Executor error: {0}")]
    Executor(String),
    #[error("Bootstrap error: {0}")]
    Bootstrap(#[from] BootstrapError),
    #[error("Device error: {0}")]
    Device(#[from] DeviceError),
    #[error("Fabric error: {0}")]
    Fabric(#[from] FabricError),
    #[error("Execution plan error: {0}")]
    Plan(#[from] PlanError),
    #[error("Bincode error: {0}")]
    Serialization(#[from] bincode::Error),
    #[error("Setup future accessed before its batch was set up")]
    FutureNotReady,
}

impl Error {
    pub fn code(&self) -> ErrorCode {
        match self {
            Error::InvalidUsage(_) | Error::FutureNotReady => ErrorCode::InvalidUsage,
            Error::Internal(_) | Error::Serialization(_) => ErrorCode::InternalError,
            Error::Executor(_) | Error::Plan(_) => ErrorCode::ExecutorError,
            Error::Bootstrap(_) | Error::Fabric(_) => ErrorCode::RemoteError,
            Error::Device(_) => ErrorCode::SystemError,
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
