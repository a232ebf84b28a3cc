//! Shared configuration and error types for the user-core workspace.

pub mod config;
pub mod error;

pub use config::*;
pub use error::{CoreError, CoreResult, LimitScope};
