use crate::Result;
use std::path::{Path, PathBuf};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncSeekExt, AsyncWriteExt, SeekFrom};

/// Write-to-disk sink with optional circular overwrite.
///
/// Writes are positional. With a recording-buffer cap of `cap > 0` bytes
/// the file behaves as a ring: once the write position reaches `cap`, the
/// next write seeks back to offset 0. A cap of 0 grows the file forever.
pub struct FileSink {
    file: File,
    path: PathBuf,
    cap: u64,
    position: u64,
    total_written: u64,
    growth_checked: bool,
}

impl FileSink {
    /// Creates (or truncates) the file at `path`.
    pub async fn create(path: &Path, cap: u64) -> Result<Self> {
        let file = File::create(path).await?;
        Ok(Self {
            file,
            path: path.to_path_buf(),
            cap,
            position: 0,
            total_written: 0,
            growth_checked: false,
        })
    }

    /// Appends `data` at the current position, wrapping to offset 0 first
    /// when a configured cap has been reached.
    pub async fn write(&mut self, data: &[u8]) -> Result<()> {
        if self.cap > 0 && self.position >= self.cap {
            self.file.seek(SeekFrom::Start(0)).await?;
            self.position = 0;
        }
        self.file.write_all(data).await?;
        self.position += data.len() as u64;
        self.total_written += data.len() as u64;
        Ok(())
    }

    /// Direct-flush check: once at least `min_size` bytes have gone out,
    /// flush and verify the file size is advancing. A zero-length file at
    /// that point means the filesystem silently discarded the writes, so
    /// the file is recreated. Returns `true` when a recreate happened.
    ///
    /// The check runs at most once per sink.
    pub async fn verify_growth(&mut self, min_size: u64) -> Result<bool> {
        if self.growth_checked || self.total_written < min_size {
            return Ok(false);
        }
        self.growth_checked = true;
        self.file.flush().await?;
        let size = self.file.metadata().await?.len();
        if size > 0 {
            return Ok(false);
        }
        log::warn!(
            "file {} is empty after writing {} bytes, recreating",
            self.path.display(),
            self.total_written
        );
        self.file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&self.path)
            .await?;
        self.position = 0;
        Ok(true)
    }

    /// Flushes buffered bytes to the OS.
    pub async fn finish(&mut self) -> Result<()> {
        self.file.flush().await?;
        Ok(())
    }

    /// Current write position within the file.
    pub fn position(&self) -> u64 {
        self.position
    }

    /// Total bytes handed to the sink over its lifetime.
    pub fn total_written(&self) -> u64 {
        self.total_written
    }

    /// Path the sink writes to.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl std::fmt::Debug for FileSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileSink")
            .field("path", &self.path)
            .field("cap", &self.cap)
            .field("position", &self.position)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn test_linear_writes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("linear.ts");

        let mut sink = FileSink::create(&path, 0).await.unwrap();
        sink.write(b"abc").await.unwrap();
        sink.write(b"def").await.unwrap();
        sink.finish().await.unwrap();

        assert_eq!(sink.total_written(), 6);
        assert_eq!(std::fs::read(&path).unwrap(), b"abcdef");
    }

    #[tokio::test]
    async fn test_circular_wrap_at_cap() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ring.ts");

        let mut sink = FileSink::create(&path, 8).await.unwrap();
        sink.write(b"aaaa").await.unwrap();
        sink.write(b"bbbb").await.unwrap();
        // Position reached the cap, so this write lands at offset 0.
        sink.write(b"cc").await.unwrap();
        sink.finish().await.unwrap();

        assert_eq!(sink.position(), 2);
        assert_eq!(sink.total_written(), 10);
        assert_eq!(std::fs::read(&path).unwrap(), b"ccbbbb");
    }

    #[tokio::test]
    async fn test_growth_check_passes_on_healthy_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("healthy.ts");

        let mut sink = FileSink::create(&path, 0).await.unwrap();
        sink.write(&[0u8; 1024]).await.unwrap();

        // Below the minimum nothing is checked.
        assert!(!sink.verify_growth(4096).await.unwrap());
        sink.write(&[0u8; 4096]).await.unwrap();
        assert!(!sink.verify_growth(4096).await.unwrap());
        // The check only runs once.
        assert!(!sink.verify_growth(1).await.unwrap());
    }
}
