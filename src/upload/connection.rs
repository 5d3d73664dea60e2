use crate::{Result, TunerError};
use std::net::SocketAddr;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

/// A single TCP connection to the recorder's upload service.
///
/// Owns the socket and a small read buffer; the [`UploadClient`] layers
/// command framing and reconnect handling on top.
///
/// [`UploadClient`]: super::UploadClient
#[derive(Debug)]
pub struct UploadConnection {
    stream: TcpStream,
    buffer: Vec<u8>,
}

impl UploadConnection {
    /// Connects to the upload service at `addr`.
    pub async fn connect(addr: SocketAddr) -> Result<Self> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|e| TunerError::Protocol(format!("Failed to connect to {}: {}", addr, e)))?;

        stream.set_nodelay(true)?;

        Ok(Self {
            stream,
            buffer: Vec::with_capacity(256),
        })
    }

    /// Writes `data` in full and flushes the socket.
    pub async fn write_all(&mut self, data: &[u8]) -> Result<()> {
        self.stream.write_all(data).await?;
        self.stream.flush().await?;
        Ok(())
    }

    /// Reads one CRLF-terminated response line, without the terminator.
    pub async fn read_line(&mut self) -> Result<String> {
        self.buffer.clear();
        let mut byte = [0u8; 1];

        loop {
            match self.stream.read(&mut byte).await {
                Ok(0) => {
                    return Err(TunerError::Io(std::io::Error::new(
                        std::io::ErrorKind::UnexpectedEof,
                        "connection closed by recorder",
                    )))
                }
                Ok(_) => {
                    if byte[0] == b'\n' {
                        if self.buffer.last() == Some(&b'\r') {
                            self.buffer.pop();
                        }
                        break;
                    }
                    self.buffer.push(byte[0]);
                    if self.buffer.len() > 512 {
                        return Err(TunerError::Protocol("response line too long".into()));
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }

        String::from_utf8(std::mem::take(&mut self.buffer))
            .map_err(|_| TunerError::Protocol("non-ASCII response line".into()))
    }

    /// Half-closes the socket so the recorder sees EOF right after the
    /// session ends. A shutdown failure is logged and otherwise ignored;
    /// dropping the connection still closes the descriptor.
    pub async fn shutdown(&mut self) {
        if let Err(e) = self.stream.shutdown().await {
            log::debug!("upload socket shutdown failed: {}", e);
        }
    }
}
