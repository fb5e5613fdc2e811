//! Forkcast Shared Types
//!
//! Identity, connection and error types shared by the realtime core and the API server.

pub mod error;
pub mod types;

pub use error::*;
pub use types::*;
