use super::connection::UploadConnection;
use crate::{Result, TunerError};
use bytes::{BufMut, BytesMut};
use std::net::SocketAddr;

/// Client for one upload session against the recorder.
///
/// The session is opened with [`open`], fed with [`upload_auto_increment`]
/// or [`upload_auto_buffered`], and ended with [`end`]. The client keeps
/// the auto-incrementing write offset so a reconnect can resume exactly
/// where the previous connection left off.
///
/// A failed write closes the socket, reconnects, replays the OPEN
/// handshake, and retries the write exactly once. A second consecutive
/// failure propagates to the caller as a stream error.
///
/// [`open`]: UploadClient::open
/// [`upload_auto_increment`]: UploadClient::upload_auto_increment
/// [`upload_auto_buffered`]: UploadClient::upload_auto_buffered
/// [`end`]: UploadClient::end
#[derive(Debug)]
pub struct UploadClient {
    connection: Option<UploadConnection>,
    addr: SocketAddr,
    filename: Option<String>,
    upload_id: u32,
    auto_offset: u64,
}

impl UploadClient {
    /// Creates a client for the upload service at `addr`. No connection is
    /// made until [`open`](UploadClient::open) is called.
    pub fn new(addr: SocketAddr) -> Self {
        Self {
            connection: None,
            addr,
            filename: None,
            upload_id: 0,
            auto_offset: 0,
        }
    }

    /// Opens an upload session for `filename` under `upload_id`.
    ///
    /// `start_offset` seeds the auto-incrementing write offset; a caller
    /// resuming after its own reconnect passes the offset it had reached.
    pub async fn open(&mut self, filename: &str, upload_id: u32, start_offset: u64) -> Result<()> {
        self.filename = Some(filename.to_string());
        self.upload_id = upload_id;
        self.auto_offset = start_offset;
        self.ensure_connected().await?;
        self.handshake().await
    }

    /// Pushes `data` at the current auto-offset and advances it.
    pub async fn upload_auto_increment(&mut self, data: &[u8]) -> Result<()> {
        let offset = self.auto_offset;
        self.write_at(offset, data).await?;
        self.auto_offset = offset + data.len() as u64;
        Ok(())
    }

    /// Pushes `data` into a circular window of `cap` bytes.
    ///
    /// When the auto-offset would run past `cap`, it wraps to 0 first.
    /// This backs the recorder's time-shift buffer semantics.
    pub async fn upload_auto_buffered(&mut self, cap: u64, data: &[u8]) -> Result<()> {
        if self.auto_offset + data.len() as u64 > cap {
            self.auto_offset = 0;
        }
        let offset = self.auto_offset;
        self.write_at(offset, data).await?;
        self.auto_offset = offset + data.len() as u64;
        Ok(())
    }

    /// Ends the session cleanly: `CLOSE`, then a socket half-close so the
    /// recorder sees EOF without waiting on a timeout.
    pub async fn end(&mut self) -> Result<()> {
        if self.connection.is_none() {
            return Ok(());
        }
        let result = self.command_expect_ok("CLOSE\r\n").await;
        if let Some(mut connection) = self.connection.take() {
            connection.shutdown().await;
        }
        result
    }

    /// The offset the next `upload_auto_increment` would write at.
    pub fn auto_offset(&self) -> u64 {
        self.auto_offset
    }

    /// The upload ID the session was opened with.
    pub fn upload_id(&self) -> u32 {
        self.upload_id
    }

    async fn ensure_connected(&mut self) -> Result<()> {
        if self.connection.is_none() {
            self.connection = Some(UploadConnection::connect(self.addr).await?);
        }
        Ok(())
    }

    /// Replays the `SIZE <filename> <uploadID>` OPEN handshake.
    async fn handshake(&mut self) -> Result<()> {
        let filename = self
            .filename
            .clone()
            .ok_or_else(|| TunerError::State("upload session was never opened".into()))?;
        let command = format!("SIZE {} {}\r\n", filename, self.upload_id);
        self.command_expect_ok(&command).await
    }

    async fn command_expect_ok(&mut self, command: &str) -> Result<()> {
        let conn = self
            .connection
            .as_mut()
            .ok_or_else(|| TunerError::State("not connected".into()))?;
        conn.write_all(command.as_bytes()).await?;
        let reply = conn.read_line().await?;
        if reply.trim() == "OK" {
            Ok(())
        } else {
            Err(TunerError::Protocol(format!(
                "recorder rejected {:?}: {}",
                command.trim_end(),
                reply
            )))
        }
    }

    /// Sends one `WRITEC` frame, reconnecting and retrying exactly once on
    /// an I/O failure.
    async fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        match self.send_writec(offset, data).await {
            Ok(()) => Ok(()),
            Err(TunerError::Io(e)) => {
                log::warn!(
                    "upload write failed at offset {} ({}), reconnecting to {}",
                    offset,
                    e,
                    self.addr
                );
                self.connection = None;
                self.ensure_connected().await?;
                self.handshake().await?;
                self.send_writec(offset, data).await.map_err(|e| {
                    TunerError::Protocol(format!(
                        "upload write failed twice at offset {}: {}",
                        offset, e
                    ))
                })
            }
            Err(e) => Err(e),
        }
    }

    async fn send_writec(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        self.ensure_connected().await?;
        let conn = self
            .connection
            .as_mut()
            .ok_or_else(|| TunerError::State("not connected".into()))?;

        let mut frame = BytesMut::with_capacity(32 + data.len());
        frame.put_slice(format!("WRITEC {} {}\r\n", data.len(), offset).as_bytes());
        frame.put_slice(data);
        conn.write_all(&frame).await
    }
}
