//! # Error Types
//!
//! This module provides the error types used throughout the tunerio library.
//! It defines a central error type `TunerError` that encapsulates all possible
//! errors that can occur while discovering tuners and capturing their output.
//!
//! ## Example Usage
//!
//! ```rust
//! use tunerio::error::{Result, TunerError};
//!
//! fn check_frame(data: &[u8]) -> Result<()> {
//!     if data.len() < 8 {
//!         return Err(TunerError::InvalidData("frame too short".to_string()));
//!     }
//!
//!     // Process frame...
//!     Ok(())
//! }
//! ```

use std::num::ParseIntError;
use thiserror::Error;

/// Primary error type for the tunerio library
#[derive(Error, Debug)]
pub enum TunerError {
    /// I/O errors that occur during file or network operations
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Errors related to the discovery or upload wire protocols
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Errors that occur during parsing of frames and streams
    #[error("parser error: {0}")]
    Parser(String),

    /// Errors for invalid or malformed input data
    #[error("invalid data: {0}")]
    InvalidData(String),

    /// Configuration option errors (unknown key, out-of-range value)
    #[error("config error: {0}")]
    Config(String),

    /// The ring buffer or stream was closed while an operation was pending
    #[error("stream closed")]
    Closed,

    /// Lifecycle misuse (double start, busy tuner, missing session)
    #[error("state error: {0}")]
    State(String),

    /// Errors that occur during integer parsing
    #[error("parse int error: {0}")]
    ParseInt(#[from] ParseIntError),
}

/// A specialized Result type for tunerio operations.
///
/// This type is used throughout the tunerio library to handle operations
/// that can produce a `TunerError`.
pub type Result<T> = std::result::Result<T, TunerError>;
