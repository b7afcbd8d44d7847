//! # Portcullis Core
//!
//! Core types and error handling shared by every stage of the Portcullis
//! request pipeline:
//! - Error taxonomy with HTTP status mapping
//! - Streaming body alias and constructors
//! - Request extensions set by the server loop
//! - Response builder

#![forbid(unsafe_code)]
#![warn(
    missing_docs,
    missing_debug_implementations,
    rust_2018_idioms,
    unreachable_pub
)]

pub mod error;
pub mod response;
pub mod types;

pub use error::{Error, Result};
pub use response::ResponseBuilder;
pub use types::*;

// Re-export commonly used HTTP types
pub use bytes::Bytes;
pub use http::{Method, Request, Response, StatusCode};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::error::{Error, Result};
    pub use crate::response::ResponseBuilder;
    pub use crate::types::*;
}
