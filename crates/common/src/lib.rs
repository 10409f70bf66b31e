//! stepwise common library
//!
//! Report model, failure information, identifiers, configuration and errors
//! shared by the stepwise reporter.

pub mod config;
pub mod digest;
pub mod error;
pub mod failure;
pub mod types;

// Re-export commonly used types
pub use config::{Config, RerunConfig, ReporterConfig, UngroupedSteps};
pub use error::{Error, Result};
pub use failure::{Comparison, Failure};
pub use types::*;

/// stepwise version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
