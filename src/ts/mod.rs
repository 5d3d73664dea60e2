//! # MPEG Transport Stream Alignment
//!
//! This module provides the small slice of MPEG-TS knowledge the capture
//! pipeline needs: fixed packet framing constants and pure lookup functions
//! that locate safe cut points inside a byte window.
//!
//! There is intentionally no demuxing here. The consumer engine treats the
//! tuner output as an opaque byte stream and only needs to know where a
//! video PES packet, a PAT, or a random-access point begins so that every
//! recording (and every mid-recording switchover) starts on a boundary a
//! decoder can make sense of.
//!
//! ## Example Usage
//!
//! ```rust
//! use tunerio::ts::{align, TS_PACKET_SIZE};
//!
//! let window = vec![0u8; TS_PACKET_SIZE * 4];
//! // A window of zeroes holds no sync bytes, so there is nothing to cut on.
//! assert_eq!(align::video_pes_start(&window, None), None);
//! assert_eq!(align::pat_start(&window), None);
//! ```

/// Alignment lookups over raw TS byte windows
pub mod align;

/// Size of a Transport Stream packet in bytes
pub const TS_PACKET_SIZE: usize = 188;
/// Size of a Transport Stream header in bytes
pub const TS_HEADER_SIZE: usize = 4;
/// Synchronization byte that begins every TS packet
pub const TS_SYNC_BYTE: u8 = 0x47;
/// PID carrying the Program Association Table
pub const PID_PAT: u16 = 0x0000;
/// First PES stream ID assigned to video elementary streams
pub const PES_VIDEO_STREAM_ID_MIN: u8 = 0xE0;
/// Last PES stream ID assigned to video elementary streams
pub const PES_VIDEO_STREAM_ID_MAX: u8 = 0xEF;

pub use align::{packet_pid, pat_start, random_access_start, video_pes_start};
