//! # Recorder Upload Protocol
//!
//! TCP client for the recorder's media-upload service. A session is a
//! single connection per destination file speaking line-oriented,
//! CRLF-terminated ASCII commands, some followed by a binary payload:
//!
//! - `SIZE <filename> <uploadID>` — the OPEN handshake, answered `OK`
//! - `WRITEC <size> <offset>` + `<size>` payload bytes — positional write
//! - `CLOSE` — clean session end, answered `OK`
//!
//! The client tracks an auto-incrementing write offset so the consumer
//! engine can stream forward without bookkeeping, wrap writes inside a
//! circular window for time-shift buffers, and resume at the right place
//! after a reconnect.
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use tunerio::upload::UploadClient;
//!
//! # async fn example() -> tunerio::Result<()> {
//! let addr = "127.0.0.1:7818".parse().unwrap();
//! let mut client = UploadClient::new(addr);
//! client.open("show.ts", 4211, 0).await?;
//! client.upload_auto_increment(&[0u8; 188]).await?;
//! client.end().await?;
//! # Ok(())
//! # }
//! ```

mod client;
mod connection;

pub use client::UploadClient;
pub use connection::UploadConnection;

/// Default TCP port of the recorder's media-upload service.
pub const DEFAULT_UPLOAD_PORT: u16 = 7818;
