use super::ring::RingBuffer;
use super::sink::{ActiveSink, SinkTarget};
use crate::ts;
use crate::{Result, TunerError};
use std::net::SocketAddr;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

/// Cutover searches prefer a random-access indicator for this many loop
/// iterations before accepting any video PES start.
const SWITCH_RAI_ATTEMPTS: u32 = 100;

/// Tuning knobs for a single consumer engine.
#[derive(Debug, Clone)]
pub struct ConsumerOptions {
    /// Channel being recorded, for log context and routing. Required up
    /// front; an engine never exists without knowing its channel.
    pub channel: String,
    /// Program number the recorder asked for, when it knows one.
    pub program: Option<u16>,
    /// Quality label attached to the recording request.
    pub quality: Option<String>,
    /// Ring buffer capacity in bytes.
    pub ring_capacity: usize,
    /// Streaming writes wait for at least this many bytes unless a switch
    /// is pending, a stop was requested, or the producer closed.
    pub min_transfer: usize,
    /// Upper bound on a single transfer window.
    pub max_transfer: usize,
    /// Direct-flush check threshold for file sinks.
    pub direct_flush_min: u64,
}

impl ConsumerOptions {
    /// Options for `channel` with the stock transfer sizes.
    pub fn new(channel: &str) -> Self {
        Self {
            channel: channel.to_string(),
            program: None,
            quality: None,
            ring_capacity: 2 * 1024 * 1024,
            min_transfer: 65536,
            max_transfer: 131072,
            direct_flush_min: 1024 * 1024,
        }
    }
}

/// A switchover in flight: the new destination plus the acknowledgement
/// channel the blocked caller waits on.
struct SwitchCommand {
    target: SinkTarget,
    done: oneshot::Sender<Result<()>>,
}

struct Shared {
    started: AtomicBool,
    running: AtomicBool,
    streaming: AtomicBool,
    bytes_streamed: AtomicU64,
}

/// Consumer engine for one recording: drains the ring buffer, locks on to
/// the video stream, and delivers every byte to the active sink, switching
/// sinks mid-stream without losing or duplicating a byte.
///
/// The producer pushes tuner output through [`write`]; the engine task
/// pulls, aligns, and routes. One engine serves exactly one recording and
/// cannot be restarted once stopped.
///
/// [`write`]: RawConsumer::write
pub struct RawConsumer {
    ring: Arc<RingBuffer>,
    shared: Arc<Shared>,
    options: ConsumerOptions,
    switch_tx: mpsc::Sender<SwitchCommand>,
    switch_rx: parking_lot::Mutex<Option<mpsc::Receiver<SwitchCommand>>>,
    task: parking_lot::Mutex<Option<JoinHandle<()>>>,
    upload_addr: parking_lot::Mutex<Option<SocketAddr>>,
}

impl RawConsumer {
    /// Creates an engine for the channel named in `options`. No task runs
    /// until one of the `consume_to_*` calls starts the recording.
    pub fn new(options: ConsumerOptions) -> Self {
        let (switch_tx, switch_rx) = mpsc::channel(1);
        Self {
            ring: Arc::new(RingBuffer::new(options.ring_capacity)),
            shared: Arc::new(Shared {
                started: AtomicBool::new(false),
                running: AtomicBool::new(false),
                streaming: AtomicBool::new(false),
                bytes_streamed: AtomicU64::new(0),
            }),
            options,
            switch_tx,
            switch_rx: parking_lot::Mutex::new(Some(switch_rx)),
            task: parking_lot::Mutex::new(None),
            upload_addr: parking_lot::Mutex::new(None),
        }
    }

    /// Starts recording to a local file. Fails before any byte is consumed
    /// when the file cannot be created.
    pub async fn consume_to_filename(&self, path: &Path, cap: u64) -> Result<()> {
        let target = SinkTarget::File {
            path: path.to_path_buf(),
            cap,
        };
        self.start(target).await
    }

    /// Starts recording over the recorder's upload protocol. Fails before
    /// any byte is consumed when the session cannot be opened.
    pub async fn consume_to_upload_id(
        &self,
        addr: SocketAddr,
        filename: &str,
        upload_id: u32,
        cap: u64,
    ) -> Result<()> {
        *self.upload_addr.lock() = Some(addr);
        let target = SinkTarget::Upload {
            addr,
            filename: filename.to_string(),
            upload_id,
            cap,
        };
        self.start(target).await
    }

    async fn start(&self, target: SinkTarget) -> Result<()> {
        if self.shared.started.swap(true, Ordering::SeqCst) {
            return Err(TunerError::State(format!(
                "consumer for channel {} was already started",
                self.options.channel
            )));
        }
        let sink = match ActiveSink::open(&target).await {
            Ok(sink) => sink,
            Err(e) => {
                log::error!(
                    "channel {}: cannot open {}: {}",
                    self.options.channel,
                    target.describe(),
                    e
                );
                return Err(e);
            }
        };

        let switch_rx = self
            .switch_rx
            .lock()
            .take()
            .ok_or_else(|| TunerError::State("consumer engine cannot be restarted".into()))?;

        self.shared.running.store(true, Ordering::SeqCst);
        log::info!(
            "channel {}: consuming to {}",
            self.options.channel,
            target.describe()
        );

        let engine = Engine {
            ring: Arc::clone(&self.ring),
            shared: Arc::clone(&self.shared),
            options: self.options.clone(),
        };
        let handle = tokio::spawn(engine.run(sink, target, switch_rx));
        *self.task.lock() = Some(handle);
        Ok(())
    }

    /// Producer-side push of tuner bytes into the ring buffer. Blocks while
    /// the buffer is full; fails with [`TunerError::Closed`] once the
    /// recording stopped.
    pub async fn write(&self, data: &[u8]) -> Result<()> {
        self.ring.write(data).await
    }

    /// Switches the recording to a new file. Blocks until the engine has
    /// cut over on a PAT boundary, or fails if the engine exits first.
    pub async fn switch_to_filename(&self, path: &Path, cap: u64) -> Result<()> {
        self.submit_switch(SinkTarget::File {
            path: path.to_path_buf(),
            cap,
        })
        .await
    }

    /// Switches the recording to a new upload session on the same recorder.
    /// Blocks until the engine has cut over on a random-access point (or a
    /// PES start after prolonged searching), or fails if the engine exits.
    pub async fn switch_to_upload_id(
        &self,
        filename: &str,
        upload_id: u32,
        cap: u64,
    ) -> Result<()> {
        let addr = (*self.upload_addr.lock()).ok_or_else(|| {
            TunerError::State("switch to upload requires an upload recording".into())
        })?;
        self.submit_switch(SinkTarget::Upload {
            addr,
            filename: filename.to_string(),
            upload_id,
            cap,
        })
        .await
    }

    async fn submit_switch(&self, target: SinkTarget) -> Result<()> {
        if !self.is_running() {
            return Err(TunerError::State("consumer engine is not running".into()));
        }
        let (done, ack) = oneshot::channel();
        self.switch_tx
            .send(SwitchCommand { target, done })
            .await
            .map_err(|_| TunerError::Closed)?;
        match ack.await {
            Ok(outcome) => outcome,
            // Engine exited without acknowledging.
            Err(_) => Err(TunerError::Closed),
        }
    }

    /// Requests shutdown: closes the ring buffer, which the engine notices
    /// at its next read. Returns immediately.
    pub fn stop(&self) {
        self.ring.close();
    }

    /// Waits for the engine task to flush and exit.
    pub async fn wait_for_stop(&self) {
        let handle = self.task.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    /// Bytes delivered to the current sink. Resets to zero on a successful
    /// switchover.
    pub fn bytes_streamed(&self) -> u64 {
        self.shared.bytes_streamed.load(Ordering::SeqCst)
    }

    /// Whether the engine task is alive.
    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    /// Waits up to `timeout` for evidence of forward progress: true once
    /// `bytes_streamed` moves (or streaming starts), false on timeout.
    pub async fn is_streaming(&self, timeout: Duration) -> bool {
        let baseline = self.bytes_streamed();
        let streaming_baseline = self.shared.streaming.load(Ordering::SeqCst);
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.bytes_streamed() != baseline
                || (!streaming_baseline && self.shared.streaming.load(Ordering::SeqCst))
            {
                return true;
            }
            if !self.is_running() || tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }

    /// The channel this engine records.
    pub fn channel(&self) -> &str {
        &self.options.channel
    }
}

impl Drop for RawConsumer {
    fn drop(&mut self) {
        self.ring.close();
    }
}

/// The engine task state; consumed by [`Engine::run`].
struct Engine {
    ring: Arc<RingBuffer>,
    shared: Arc<Shared>,
    options: ConsumerOptions,
}

impl Engine {
    async fn run(
        self,
        mut sink: ActiveSink,
        target: SinkTarget,
        mut switch_rx: mpsc::Receiver<SwitchCommand>,
    ) {
        let channel = self.options.channel.clone();
        match self.pump(&mut sink, &mut switch_rx).await {
            Ok(()) => log::info!("channel {}: consumer stopped cleanly", channel),
            Err(e) => log::error!(
                "channel {}: consumer stopped on stream error for {}: {} ({} bytes streamed)",
                channel,
                target.describe(),
                e,
                self.shared.bytes_streamed.load(Ordering::SeqCst)
            ),
        }
        if let Err(e) = sink.finish().await {
            log::warn!("channel {}: closing sink failed: {}", channel, e);
        }
        self.ring.close();
        self.shared.streaming.store(false, Ordering::SeqCst);
        self.shared.running.store(false, Ordering::SeqCst);
        // Dropping switch_rx here releases any still-blocked switch caller
        // with a failure.
    }

    async fn pump(
        &self,
        sink: &mut ActiveSink,
        switch_rx: &mut mpsc::Receiver<SwitchCommand>,
    ) -> Result<()> {
        let mut window = vec![0u8; self.options.max_transfer];
        let mut filled = 0usize;

        // Lock-on: consume without forwarding until a video PES start is
        // found, then reposition the window on it.
        let locked_pid;
        loop {
            if filled == window.len() {
                // Keep one packet's worth of tail so a start straddling two
                // reads is still found.
                let keep = ts::TS_PACKET_SIZE - 1;
                window.copy_within(filled - keep..filled, 0);
                filled = keep;
            }
            let n = self.ring.read(&mut window[filled..]).await?;
            if n == 0 {
                log::info!(
                    "channel {}: producer closed before video lock-on",
                    self.options.channel
                );
                return Ok(());
            }
            filled += n;
            if let Some(offset) = ts::video_pes_start(&window[..filled], None) {
                locked_pid = ts::packet_pid(&window[offset..filled]);
                window.copy_within(offset..filled, 0);
                filled -= offset;
                break;
            }
        }
        self.shared.streaming.store(true, Ordering::SeqCst);
        log::info!(
            "channel {} (program {:?}, quality {:?}): video PES lock-on, pid {:?}",
            self.options.channel,
            self.options.program,
            self.options.quality,
            locked_pid
        );

        let mut pending: Option<SwitchCommand> = None;
        let mut switch_spins = 0u32;
        let mut closed = false;

        loop {
            if pending.is_none() {
                // Fill to min-transfer, but let a switch request or the
                // producer closing interrupt the wait.
                while filled < self.options.min_transfer && !closed && pending.is_none() {
                    tokio::select! {
                        read = self.ring.read(&mut window[filled..]) => {
                            let n = read?;
                            if n == 0 {
                                closed = true;
                            } else {
                                filled += n;
                            }
                        }
                        command = switch_rx.recv() => {
                            if let Some(command) = command {
                                pending = Some(command);
                                switch_spins = 0;
                            }
                        }
                    }
                }
                if pending.is_none() {
                    if let Ok(command) = switch_rx.try_recv() {
                        pending = Some(command);
                        switch_spins = 0;
                    }
                }
            } else if !closed && filled < window.len() {
                // A switch is pending: keep pulling whatever is available
                // so the cutover search sees fresh bytes each iteration.
                let n = self.ring.read(&mut window[filled..]).await?;
                if n == 0 {
                    closed = true;
                } else {
                    filled += n;
                }
            }

            if closed {
                if let Some(command) = pending.take() {
                    log::warn!(
                        "channel {}: switch to {} abandoned by shutdown",
                        self.options.channel,
                        command.target.describe()
                    );
                    let _ = command.done.send(Err(TunerError::Closed));
                }
                // Flush the in-flight window, even one shorter than
                // min-transfer, then stop.
                if filled > 0 {
                    sink.deliver(&window[..filled]).await?;
                    self.shared
                        .bytes_streamed
                        .fetch_add(filled as u64, Ordering::SeqCst);
                }
                return Ok(());
            }

            if let Some(command) = pending.take() {
                match find_cutover(&window[..filled], &command.target, locked_pid, switch_spins) {
                    Some(cut) => {
                        self.cut_over(sink, command, &mut window, &mut filled, cut)
                            .await?;
                    }
                    None => {
                        // No boundary in this window: the old sink gets all
                        // of it and the caller stays blocked.
                        switch_spins += 1;
                        if filled > 0 {
                            sink.deliver(&window[..filled]).await?;
                            self.shared
                                .bytes_streamed
                                .fetch_add(filled as u64, Ordering::SeqCst);
                            filled = 0;
                        }
                        pending = Some(command);
                    }
                }
            } else if filled > 0 {
                sink.deliver(&window[..filled]).await?;
                self.shared
                    .bytes_streamed
                    .fetch_add(filled as u64, Ordering::SeqCst);
                filled = 0;
                sink.verify_growth(self.options.direct_flush_min).await?;
            }
        }
    }

    /// Commits a switchover at window offset `cut`: old sink takes
    /// `[0, cut)`, the new sink opens at offset zero and takes the rest,
    /// and the blocked caller is released.
    async fn cut_over(
        &self,
        sink: &mut ActiveSink,
        command: SwitchCommand,
        window: &mut [u8],
        filled: &mut usize,
        cut: usize,
    ) -> Result<()> {
        if cut > 0 {
            sink.deliver(&window[..cut]).await?;
            self.shared
                .bytes_streamed
                .fetch_add(cut as u64, Ordering::SeqCst);
        }

        if sink.is_upload() {
            // Protocol order: END the old session before opening the new.
            sink.finish().await?;
            match ActiveSink::open(&command.target).await {
                Ok(new_sink) => *sink = new_sink,
                Err(e) => {
                    log::error!(
                        "channel {}: cannot open switch target {}: {}",
                        self.options.channel,
                        command.target.describe(),
                        e
                    );
                    let _ = command.done.send(Err(e));
                    return Err(TunerError::Protocol(
                        "switch target failed to open after old session ended".into(),
                    ));
                }
            }
        } else {
            // The new file is opened before the old one is let go, so a
            // failed open leaves the running recording untouched.
            match ActiveSink::open(&command.target).await {
                Ok(new_sink) => {
                    if let Err(e) = sink.finish().await {
                        log::warn!(
                            "channel {}: closing old sink failed: {}",
                            self.options.channel,
                            e
                        );
                    }
                    *sink = new_sink;
                }
                Err(e) => {
                    log::error!(
                        "channel {}: cannot open switch target {}: {}",
                        self.options.channel,
                        command.target.describe(),
                        e
                    );
                    let _ = command.done.send(Err(e));
                    return Ok(());
                }
            }
        }

        log::info!(
            "channel {}: switched to {} at cutover offset {}",
            self.options.channel,
            command.target.describe(),
            cut
        );
        self.shared.bytes_streamed.store(0, Ordering::SeqCst);

        window.copy_within(cut..*filled, 0);
        *filled -= cut;
        if *filled > 0 {
            sink.deliver(&window[..*filled]).await?;
            self.shared
                .bytes_streamed
                .fetch_add(*filled as u64, Ordering::SeqCst);
            *filled = 0;
        }
        let _ = command.done.send(Ok(()));
        Ok(())
    }
}

/// Picks the cutover offset for a pending switch inside `window`.
///
/// Upload targets prefer a random-access indicator and fall back to any
/// video PES start after [`SWITCH_RAI_ATTEMPTS`] fruitless iterations;
/// file targets cut on a PAT so the new file is self-contained from its
/// first table.
fn find_cutover(
    window: &[u8],
    target: &SinkTarget,
    locked_pid: Option<u16>,
    spins: u32,
) -> Option<usize> {
    if target.is_upload() {
        if let Some(cut) = ts::random_access_start(window, locked_pid) {
            return Some(cut);
        }
        if spins >= SWITCH_RAI_ATTEMPTS {
            return ts::video_pes_start(window, locked_pid);
        }
        None
    } else {
        ts::pat_start(window)
    }
}
