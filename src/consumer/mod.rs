//! # Capture Consumers
//!
//! Everything between "bytes arriving from a tuner" and "bytes landing at
//! their destination":
//!
//! - [`RingBuffer`] — the bounded byte queue the producer pushes into
//! - [`FileSink`] / [`SinkTarget`] — the destinations bytes are routed to
//! - [`RawConsumer`] — the engine that locks on to the video stream,
//!   delivers every byte exactly once, and cuts over to a new destination
//!   mid-recording on a clean MPEG-TS boundary
//!
//! Consumers come in kinds. The raw consumer passes the transport stream
//! through untouched; transcoding kinds exist in the routing model so a
//! channel table can name them, but this crate only builds the raw engine.
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use tunerio::consumer::{ConsumerKind, ConsumerOptions, ConsumerRouting, build_consumer};
//! use std::path::Path;
//!
//! # async fn example() -> tunerio::Result<()> {
//! let routing = ConsumerRouting::new(ConsumerKind::Raw);
//! let kind = routing.route("44-1");
//! let consumer = build_consumer(kind, ConsumerOptions::new("44-1"))?;
//! consumer.consume_to_filename(Path::new("out.ts"), 0).await?;
//! consumer.write(&[0u8; 188]).await?;
//! consumer.stop();
//! # Ok(())
//! # }
//! ```

/// Consumer engine driving a single recording
pub mod engine;

/// Write-to-disk sink with optional circular overwrite
pub mod file_sink;

/// Bounded single-producer/single-consumer byte queue
pub mod ring;

/// Sink targets and the active-sink dispatch
pub mod sink;

pub use engine::{ConsumerOptions, RawConsumer};
pub use file_sink::FileSink;
pub use ring::RingBuffer;
pub use sink::SinkTarget;

use crate::{Result, TunerError};
use std::collections::HashMap;

/// The consumer implementations a channel can be routed to.
///
/// A tagged variant instead of a name-to-implementation string lookup:
/// routing tables hold these values directly and the factory match is
/// exhaustive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerKind {
    /// Pass-through MPEG-TS capture.
    Raw,
    /// Transcode through ffmpeg before delivery (not built in this crate).
    FfmpegTrans,
    /// Hand off to a media server pipeline (not built in this crate).
    MediaServer,
}

/// Per-channel consumer selection with a default kind.
#[derive(Debug, Clone)]
pub struct ConsumerRouting {
    default: ConsumerKind,
    overrides: HashMap<String, ConsumerKind>,
}

impl ConsumerRouting {
    /// A routing table that sends every channel to `default`.
    pub fn new(default: ConsumerKind) -> Self {
        Self {
            default,
            overrides: HashMap::new(),
        }
    }

    /// Routes `channel` to a specific kind.
    pub fn set_route(&mut self, channel: &str, kind: ConsumerKind) {
        self.overrides.insert(channel.to_string(), kind);
    }

    /// The kind that will consume `channel`.
    pub fn route(&self, channel: &str) -> ConsumerKind {
        self.overrides
            .get(channel)
            .copied()
            .unwrap_or(self.default)
    }
}

/// Builds the concrete engine for `kind`.
///
/// Only [`ConsumerKind::Raw`] is available; the transcoding kinds report a
/// configuration error so a mis-routed channel fails loudly at start
/// rather than silently recording nothing.
pub fn build_consumer(kind: ConsumerKind, options: ConsumerOptions) -> Result<RawConsumer> {
    match kind {
        ConsumerKind::Raw => Ok(RawConsumer::new(options)),
        ConsumerKind::FfmpegTrans | ConsumerKind::MediaServer => Err(TunerError::Config(format!(
            "consumer kind {:?} is not built into this crate",
            kind
        ))),
    }
}
