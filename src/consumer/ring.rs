use crate::error::{Result, TunerError};
use parking_lot::Mutex;
use tokio::sync::Notify;

/// Bounded single-producer/single-consumer byte queue feeding a consumer
/// engine.
///
/// Capacity is fixed at construction and the backing memory is allocated
/// up front. `write` waits while the buffer is full and `read` waits while
/// it is empty; `close` wakes both sides. Bytes are never dropped: a
/// successful `read` observes every byte of the matching `write`, in order.
///
/// The single-producer/single-consumer restriction is a hard precondition.
/// The buffer does not detect concurrent producers or consumers; running
/// more than one of either is a programmer error and the byte ordering
/// guarantees no longer hold.
pub struct RingBuffer {
    state: Mutex<State>,
    not_empty: Notify,
    not_full: Notify,
}

struct State {
    buf: Box<[u8]>,
    /// Next byte to read.
    head: usize,
    /// Next byte to write.
    tail: usize,
    len: usize,
    closed: bool,
}

impl RingBuffer {
    /// Creates a buffer holding at most `capacity` bytes.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "ring buffer capacity must be non-zero");
        Self {
            state: Mutex::new(State {
                buf: vec![0u8; capacity].into_boxed_slice(),
                head: 0,
                tail: 0,
                len: 0,
                closed: false,
            }),
            not_empty: Notify::new(),
            not_full: Notify::new(),
        }
    }

    /// Appends all of `data`, waiting for the consumer to free space when
    /// the buffer is full. Returns `Err(TunerError::Closed)` once the
    /// buffer has been closed; no byte of `data` is ever silently dropped.
    pub async fn write(&self, data: &[u8]) -> Result<()> {
        let mut remaining = data;
        while !remaining.is_empty() {
            // Register interest before checking state so a wakeup between
            // the check and the await is retained as a permit.
            let notified = self.not_full.notified();
            {
                let mut state = self.state.lock();
                if state.closed {
                    return Err(TunerError::Closed);
                }
                let free = state.buf.len() - state.len;
                if free > 0 {
                    let n = free.min(remaining.len());
                    state.push(&remaining[..n]);
                    remaining = &remaining[n..];
                    self.not_empty.notify_one();
                    continue;
                }
            }
            notified.await;
        }
        Ok(())
    }

    /// Fills `dst` with up to `dst.len()` bytes, waiting until at least one
    /// byte is available. Returns the number of bytes copied; `Ok(0)` means
    /// the buffer was closed and has been fully drained.
    ///
    /// Cancellation-safe: dropping the returned future before completion
    /// copies nothing.
    pub async fn read(&self, dst: &mut [u8]) -> Result<usize> {
        if dst.is_empty() {
            return Ok(0);
        }
        loop {
            let notified = self.not_empty.notified();
            {
                let mut state = self.state.lock();
                if state.len > 0 {
                    let n = state.pop(dst);
                    self.not_full.notify_one();
                    return Ok(n);
                }
                if state.closed {
                    return Ok(0);
                }
            }
            notified.await;
        }
    }

    /// Number of bytes a `read` could return right now without waiting.
    pub fn read_available(&self) -> usize {
        self.state.lock().len
    }

    /// Number of bytes a `write` could accept right now without waiting.
    pub fn write_available(&self) -> usize {
        let state = self.state.lock();
        state.buf.len() - state.len
    }

    /// Marks the buffer closed and wakes any waiter. Idempotent. After
    /// close, `write` fails and `read` drains the remaining bytes before
    /// reporting `Ok(0)`.
    pub fn close(&self) {
        {
            let mut state = self.state.lock();
            state.closed = true;
        }
        self.not_empty.notify_one();
        self.not_full.notify_one();
    }

    /// Whether `close` has been called.
    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Resets the read and write cursors, discarding buffered bytes.
    ///
    /// Only safe while no task is actively reading or writing; the caller
    /// guarantees quiescence.
    pub fn clear(&self) {
        let mut state = self.state.lock();
        state.head = 0;
        state.tail = 0;
        state.len = 0;
        self.not_full.notify_one();
    }

    /// Total capacity in bytes.
    pub fn capacity(&self) -> usize {
        self.state.lock().buf.len()
    }
}

impl State {
    fn push(&mut self, data: &[u8]) {
        let capacity = self.buf.len();
        let first = data.len().min(capacity - self.tail);
        self.buf[self.tail..self.tail + first].copy_from_slice(&data[..first]);
        let rest = data.len() - first;
        if rest > 0 {
            self.buf[..rest].copy_from_slice(&data[first..]);
        }
        self.tail = (self.tail + data.len()) % capacity;
        self.len += data.len();
    }

    fn pop(&mut self, dst: &mut [u8]) -> usize {
        let capacity = self.buf.len();
        let n = dst.len().min(self.len);
        let first = n.min(capacity - self.head);
        dst[..first].copy_from_slice(&self.buf[self.head..self.head + first]);
        let rest = n - first;
        if rest > 0 {
            dst[first..n].copy_from_slice(&self.buf[..rest]);
        }
        self.head = (self.head + n) % capacity;
        self.len -= n;
        n
    }
}

impl std::fmt::Debug for RingBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("RingBuffer")
            .field("capacity", &state.buf.len())
            .field("len", &state.len)
            .field("closed", &state.closed)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quickcheck::{Arbitrary, Gen};
    use std::sync::Arc;
    use tokio::runtime::Runtime;

    #[derive(Debug, Clone)]
    struct TransferCase {
        data: Vec<u8>,
        capacity: usize,
        chunk: usize,
    }

    impl Arbitrary for TransferCase {
        fn arbitrary(g: &mut Gen) -> Self {
            let data = Vec::<u8>::arbitrary(g);
            let capacity = usize::arbitrary(g) % 64 + 1;
            let chunk = usize::arbitrary(g) % 32 + 1;
            Self {
                data,
                capacity,
                chunk,
            }
        }
    }

    #[quickcheck_macros::quickcheck]
    fn prop_transfer_preserves_bytes(case: TransferCase) -> bool {
        let rt = Runtime::new().unwrap();
        rt.block_on(async {
            let ring = Arc::new(RingBuffer::new(case.capacity));
            let producer = {
                let ring = Arc::clone(&ring);
                let data = case.data.clone();
                let chunk = case.chunk;
                tokio::spawn(async move {
                    for piece in data.chunks(chunk) {
                        ring.write(piece).await.unwrap();
                    }
                    ring.close();
                })
            };

            let mut sink = Vec::new();
            let mut scratch = vec![0u8; case.capacity];
            loop {
                let n = ring.read(&mut scratch).await.unwrap();
                if n == 0 {
                    break;
                }
                sink.extend_from_slice(&scratch[..n]);
            }
            producer.await.unwrap();
            sink == case.data
        })
    }

    #[tokio::test]
    async fn test_close_drains_then_reports_closed() {
        let ring = RingBuffer::new(16);
        ring.write(b"abcdef").await.unwrap();
        ring.close();

        // Writes fail immediately after close.
        assert!(matches!(
            ring.write(b"x").await,
            Err(TunerError::Closed)
        ));

        // Reads drain the remaining bytes, then report closed.
        let mut dst = [0u8; 4];
        assert_eq!(ring.read(&mut dst).await.unwrap(), 4);
        assert_eq!(&dst, b"abcd");
        assert_eq!(ring.read(&mut dst).await.unwrap(), 2);
        assert_eq!(&dst[..2], b"ef");
        assert_eq!(ring.read(&mut dst).await.unwrap(), 0);
        assert_eq!(ring.read(&mut dst).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_close_wakes_blocked_reader() {
        let ring = Arc::new(RingBuffer::new(8));
        let reader = {
            let ring = Arc::clone(&ring);
            tokio::spawn(async move {
                let mut dst = [0u8; 8];
                ring.read(&mut dst).await.unwrap()
            })
        };
        tokio::task::yield_now().await;
        ring.close();
        assert_eq!(reader.await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_writer_blocks_until_reader_drains() {
        let ring = Arc::new(RingBuffer::new(4));
        ring.write(b"full").await.unwrap();
        assert_eq!(ring.write_available(), 0);

        let writer = {
            let ring = Arc::clone(&ring);
            tokio::spawn(async move { ring.write(b"more").await })
        };
        tokio::task::yield_now().await;
        assert!(!writer.is_finished());

        let mut sink = Vec::new();
        let mut dst = [0u8; 4];
        while sink.len() < 8 {
            let n = ring.read(&mut dst).await.unwrap();
            sink.extend_from_slice(&dst[..n]);
        }
        writer.await.unwrap().unwrap();
        assert_eq!(&sink, b"fullmore");
    }

    #[tokio::test]
    async fn test_clear_resets_to_fresh_state() {
        let ring = RingBuffer::new(8);
        ring.write(b"stale").await.unwrap();
        ring.clear();
        assert_eq!(ring.read_available(), 0);
        assert_eq!(ring.write_available(), 8);

        ring.write(b"fresh").await.unwrap();
        let mut dst = [0u8; 8];
        let n = ring.read(&mut dst).await.unwrap();
        assert_eq!(&dst[..n], b"fresh");
    }

    #[tokio::test]
    async fn test_wraparound_preserves_order() {
        let ring = RingBuffer::new(8);
        let mut dst = [0u8; 8];

        ring.write(b"abcde").await.unwrap();
        assert_eq!(ring.read(&mut dst[..3]).await.unwrap(), 3);
        // Tail wraps past the end of the backing buffer here.
        ring.write(b"fghij").await.unwrap();

        let mut sink = Vec::new();
        loop {
            let n = ring.read(&mut dst).await.unwrap();
            sink.extend_from_slice(&dst[..n]);
            if ring.read_available() == 0 {
                break;
            }
        }
        assert_eq!(&sink, b"defghij");
    }
}
