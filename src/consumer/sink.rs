use super::file_sink::FileSink;
use crate::upload::UploadClient;
use crate::Result;
use std::net::SocketAddr;
use std::path::PathBuf;

/// Destination a consumer engine delivers bytes to.
///
/// A target describes where bytes should land; the engine opens it into an
/// [`ActiveSink`] when a recording starts or a switchover commits.
#[derive(Debug, Clone)]
pub enum SinkTarget {
    /// Write to a local file, circularly past `cap` bytes when `cap > 0`.
    File {
        /// Destination path.
        path: PathBuf,
        /// Circular-buffer size in bytes; 0 grows without bound.
        cap: u64,
    },
    /// Stream over the recorder's upload protocol.
    Upload {
        /// Recorder upload-service address.
        addr: SocketAddr,
        /// Destination filename as the recorder knows it.
        filename: String,
        /// Upload session nonce.
        upload_id: u32,
        /// Circular-window size in bytes; 0 streams forward without wrap.
        cap: u64,
    },
}

impl SinkTarget {
    /// Whether this target is an upload destination.
    pub fn is_upload(&self) -> bool {
        matches!(self, SinkTarget::Upload { .. })
    }

    /// Short human description for log context.
    pub fn describe(&self) -> String {
        match self {
            SinkTarget::File { path, .. } => format!("file {}", path.display()),
            SinkTarget::Upload {
                filename,
                upload_id,
                ..
            } => format!("upload {} (id {})", filename, upload_id),
        }
    }
}

/// An opened sink the engine is actively writing to.
pub(crate) enum ActiveSink {
    File(FileSink),
    Upload { client: UploadClient, cap: u64 },
}

impl ActiveSink {
    /// Opens `target`: creates the file, or connects and performs the
    /// upload OPEN handshake at offset 0.
    pub async fn open(target: &SinkTarget) -> Result<Self> {
        match target {
            SinkTarget::File { path, cap } => {
                let sink = FileSink::create(path, *cap).await?;
                Ok(ActiveSink::File(sink))
            }
            SinkTarget::Upload {
                addr,
                filename,
                upload_id,
                cap,
            } => {
                let mut client = UploadClient::new(*addr);
                client.open(filename, *upload_id, 0).await?;
                Ok(ActiveSink::Upload { client, cap: *cap })
            }
        }
    }

    /// Delivers `data` to the destination.
    ///
    /// Upload errors (after the client's single retry) propagate as fatal;
    /// file write errors are logged and swallowed, the OS being expected to
    /// surface persistent problems on its own.
    pub async fn deliver(&mut self, data: &[u8]) -> Result<()> {
        match self {
            ActiveSink::File(sink) => {
                if let Err(e) = sink.write(data).await {
                    log::error!("file sink {} write failed: {}", sink.path().display(), e);
                }
                Ok(())
            }
            ActiveSink::Upload { client, cap } => {
                if *cap > 0 {
                    client.upload_auto_buffered(*cap, data).await
                } else {
                    client.upload_auto_increment(data).await
                }
            }
        }
    }

    /// Finishes the sink: flushes the file, or ENDs the upload session.
    pub async fn finish(&mut self) -> Result<()> {
        match self {
            ActiveSink::File(sink) => sink.finish().await,
            ActiveSink::Upload { client, .. } => client.end().await,
        }
    }

    /// Runs the file sink's direct-flush growth check; no-op for uploads.
    pub async fn verify_growth(&mut self, min_size: u64) -> Result<()> {
        if let ActiveSink::File(sink) = self {
            sink.verify_growth(min_size).await?;
        }
        Ok(())
    }

    /// Whether the active sink is an upload session.
    pub fn is_upload(&self) -> bool {
        matches!(self, ActiveSink::Upload { .. })
    }
}
