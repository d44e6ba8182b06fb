//! geotrace node - DP3T tracing orchestrator with spatio-temporal exposure
//! tokens.

pub mod cli;
pub mod clock;
pub mod config;
pub mod ephid;
pub mod error;
pub mod exposure;
pub mod feed;
pub mod host;
pub mod location;
pub mod logging;
pub mod orchestrator;
pub mod radio;
pub mod scheduler;
pub mod store;

#[cfg(test)]
pub(crate) mod testing;

pub use error::NodeError;
pub use orchestrator::{spawn, Capabilities, TracingHandle};
