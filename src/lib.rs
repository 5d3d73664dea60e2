#![doc(html_root_url = "https://docs.rs/tunerio/0.1.0")]
#![cfg_attr(docsrs, feature(doc_cfg))]
#![deny(missing_docs)]
#![deny(rustdoc::missing_crate_level_docs)]

//! # tunerio - HDHomeRun Capture Bridge
//!
//! `tunerio` bridges a home-DVR recorder and HDHomeRun-family network
//! tuners. It discovers tuners on the LAN, presents each physical tuner
//! as a logical capture device, and — when the recorder asks to record a
//! channel — pulls the tuner's MPEG-TS output and delivers it to a local
//! file or over the recorder's upload protocol, with seamless
//! mid-recording switchover to a new destination.
//!
//! ## Features
//!
//! ### Capture Pipeline
//! - Bounded ring buffer between the tuner producer and the consumer
//! - Video-PES lock-on so every recording starts on a decodable boundary
//! - Byte-exact switchover: old and new sinks concatenate to the input
//! - File sinks with circular overwrite, upload sinks with a time-shift
//!   window and reconnect-and-resume
//!
//! ### Discovery
//! - UDP broadcast and unicast probing with CRC-verified replies
//! - A registry reconciling dynamic addresses with stable device IDs
//! - Tuner-busy markers enforcing one capture session per tuner
//!
//! ## Quick Start
//!
//! Add this to your `Cargo.toml`:
//!
//! ```toml
//! [dependencies]
//! tunerio = "0.1.0"
//! ```
//!
//! ### Recording to a File
//!
//! ```rust,no_run
//! use tunerio::consumer::{ConsumerOptions, RawConsumer};
//! use std::path::Path;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let consumer = RawConsumer::new(ConsumerOptions::new("44-1"));
//!     consumer.consume_to_filename(Path::new("show.ts"), 0).await?;
//!
//!     // The tuner producer pushes transport-stream bytes in:
//!     consumer.write(&[0u8; 1316]).await?;
//!
//!     // Later, cut over to a new file without losing a byte:
//!     consumer.switch_to_filename(Path::new("next.ts"), 0).await?;
//!
//!     consumer.stop();
//!     consumer.wait_for_stop().await;
//!     Ok(())
//! }
//! ```
//!
//! ### Discovering Tuners
//!
//! ```rust,no_run
//! use tunerio::config::OptionStore;
//! use tunerio::discovery::Discoverer;
//! use std::sync::Arc;
//!
//! # async fn example(control: Arc<dyn tunerio::discovery::ControlClient>,
//! #                  loader: Arc<dyn tunerio::discovery::DeviceLoader>)
//! #                  -> tunerio::Result<()> {
//! let options = Arc::new(OptionStore::with_file("tunerio.properties".as_ref()));
//! let discoverer = Discoverer::new(options, control, loader);
//! discoverer.start().await?;
//!
//! for tuner in discoverer.tuners() {
//!     println!("found {}", tuner.name);
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Module Overview
//!
//! - `consumer`: the capture pipeline — ring buffer, sinks, and the
//!   consumer engine with lock-on and switchover
//!
//! - `discovery`: LAN discovery — wire protocol, probe engine, device
//!   registry, and the recorder-facing facade
//!
//! - `upload`: TCP client for the recorder's media-upload protocol
//!
//! - `ts`: MPEG-TS framing constants and alignment lookups
//!
//! - `config`: typed option store with properties-file persistence
//!
//! - `error`: error types and the crate-wide `Result` alias
//!
/// Typed option store with properties persistence
pub mod config;

/// Capture pipeline: ring buffer, sinks, consumer engine
pub mod consumer;

/// Tuner discovery: wire protocol, engine, registry, facade
pub mod discovery;

/// Error types and utilities
pub mod error;

/// MPEG-TS framing constants and alignment lookups
pub mod ts;

/// Recorder upload-protocol client
pub mod upload;

pub use error::{Result, TunerError};
