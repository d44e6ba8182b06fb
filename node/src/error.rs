use thiserror::Error;

use crate::config::ConfigError;
use crate::ephid::EphidError;
use crate::exposure::ExposureError;
use crate::logging::LoggingError;
use crate::orchestrator::HandleError;
use crate::radio::bluetooth::RadioError;
use crate::store::StoreError;

/// Top-level failure of the node binary.
#[derive(Debug, Error)]
pub enum NodeError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("ephid source: {0}")]
    Ephid(#[from] EphidError),
    #[error(transparent)]
    Radio(#[from] RadioError),
    #[error(transparent)]
    Orchestrator(#[from] HandleError),
    #[error(transparent)]
    Logging(#[from] LoggingError),
    #[error(transparent)]
    Exposure(#[from] ExposureError),
    #[error("runtime: {0}")]
    Runtime(#[from] std::io::Error),
}
