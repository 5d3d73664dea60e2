use super::protocol::{self, DEFAULT_DISCOVERY_PORT};
use super::registry::DeviceRegistry;
use super::ControlClient;
use crate::{Result, TunerError};
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;

/// Local ports below this bind an ephemeral port instead; the configured
/// value stays the probe destination.
const MIN_LOCAL_PORT: u16 = 1024;

/// Spacing between the packets of one probe cycle.
const PROBE_SPACING: Duration = Duration::from_millis(20);

/// Packets sent per probe cycle, to tolerate datagram loss.
const PROBES_PER_CYCLE: u32 = 3;

/// How a discovery engine probes the network.
#[derive(Debug, Clone)]
pub struct DiscoverySettings {
    /// UDP port to bind; values below 1024 bind an ephemeral port.
    pub broadcast_port: u16,
    /// Destination port probes are sent to.
    pub target_port: u16,
    /// Interval between periodic probe cycles; zero disables them.
    pub broadcast_interval: Duration,
    /// Suppress periodic probes unless a broadcast was requested.
    pub smart_broadcast: bool,
    /// Addresses probed by unicast on every cycle, for tuners outside the
    /// broadcast domain.
    pub static_addresses: Vec<Ipv4Addr>,
}

impl Default for DiscoverySettings {
    fn default() -> Self {
        Self {
            broadcast_port: DEFAULT_DISCOVERY_PORT,
            target_port: DEFAULT_DISCOVERY_PORT,
            broadcast_interval: Duration::from_secs(58),
            smart_broadcast: true,
            static_addresses: Vec::new(),
        }
    }
}

struct EngineTasks {
    socket: Arc<UdpSocket>,
    stop_tx: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

/// UDP discovery loop: one socket, a receive task feeding the registry,
/// and a send task emitting probe cycles periodically or on demand.
pub struct DiscoveryEngine {
    registry: Arc<DeviceRegistry>,
    control: Arc<dyn ControlClient>,
    running: AtomicBool,
    need_broadcast: AtomicBool,
    broadcast_wakeup: Notify,
    dropped_frames: AtomicU64,
    tasks: parking_lot::Mutex<Option<EngineTasks>>,
}

impl DiscoveryEngine {
    /// Creates an engine feeding `registry`, resolving replies through
    /// `control`. Nothing runs until [`start`](DiscoveryEngine::start).
    pub fn new(registry: Arc<DeviceRegistry>, control: Arc<dyn ControlClient>) -> Self {
        Self {
            registry,
            control,
            running: AtomicBool::new(false),
            need_broadcast: AtomicBool::new(false),
            broadcast_wakeup: Notify::new(),
            dropped_frames: AtomicU64::new(0),
            tasks: parking_lot::Mutex::new(None),
        }
    }

    /// Binds the socket and spawns the receive and send tasks. The first
    /// probe cycle goes out immediately.
    pub async fn start(self: &Arc<Self>, settings: DiscoverySettings) -> Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(TunerError::State("discovery engine already running".into()));
        }

        let local_port = if settings.broadcast_port < MIN_LOCAL_PORT {
            // Out-of-range config means "pick ephemeral", not "disabled".
            0
        } else {
            settings.broadcast_port
        };
        let bind = SocketAddr::from((Ipv4Addr::UNSPECIFIED, local_port));
        let socket = match UdpSocket::bind(bind).await {
            Ok(socket) => socket,
            Err(e) => {
                self.running.store(false, Ordering::SeqCst);
                return Err(TunerError::Protocol(format!(
                    "cannot bind discovery socket on {}: {}",
                    bind, e
                )));
            }
        };
        if let Err(e) = socket.set_broadcast(true) {
            self.running.store(false, Ordering::SeqCst);
            return Err(e.into());
        }
        let socket = Arc::new(socket);
        log::info!(
            "discovery listening on {} ({} static addresses)",
            socket.local_addr()?,
            settings.static_addresses.len()
        );

        let (stop_tx, stop_rx) = watch::channel(false);
        let mut handles = Vec::new();

        {
            let engine = Arc::clone(self);
            let socket = Arc::clone(&socket);
            let mut stop_rx = stop_rx.clone();
            handles.push(tokio::spawn(async move {
                engine.receive_loop(socket, &mut stop_rx).await;
            }));
        }
        {
            let engine = Arc::clone(self);
            let socket = Arc::clone(&socket);
            let mut stop_rx = stop_rx.clone();
            handles.push(tokio::spawn(async move {
                engine.send_loop(socket, settings, &mut stop_rx).await;
            }));
        }

        *self.tasks.lock() = Some(EngineTasks {
            socket,
            stop_tx,
            handles,
        });
        Ok(())
    }

    /// Requests an on-demand probe cycle. Atomic set; the send task clears
    /// it with an atomic read-and-clear.
    pub fn request_broadcast(&self) {
        self.need_broadcast.store(true, Ordering::SeqCst);
        self.broadcast_wakeup.notify_one();
    }

    /// Whether an on-demand probe cycle is queued but not yet sent.
    pub fn need_broadcast(&self) -> bool {
        self.need_broadcast.load(Ordering::SeqCst)
    }

    /// Stops the engine: the socket closes and blocked receives return.
    /// Returns immediately; use [`wait_for_stop`] to join the tasks.
    ///
    /// [`wait_for_stop`]: DiscoveryEngine::wait_for_stop
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(tasks) = self.tasks.lock().as_ref() {
            let _ = tasks.stop_tx.send(true);
        }
    }

    /// Joins all background work started by [`start`](DiscoveryEngine::start).
    pub async fn wait_for_stop(&self) {
        let tasks = self.tasks.lock().take();
        if let Some(tasks) = tasks {
            futures::future::join_all(tasks.handles).await;
            // The socket drops here, releasing the port.
            drop(tasks.socket);
        }
    }

    /// Whether the discovery socket is open.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Datagrams discarded for bad CRCs or malformed framing.
    pub fn dropped_frames(&self) -> u64 {
        self.dropped_frames.load(Ordering::SeqCst)
    }

    async fn receive_loop(&self, socket: Arc<UdpSocket>, stop_rx: &mut watch::Receiver<bool>) {
        let mut buf = [0u8; 1500];
        loop {
            let (len, from) = tokio::select! {
                _ = stop_rx.changed() => return,
                received = socket.recv_from(&mut buf) => match received {
                    Ok(pair) => pair,
                    Err(e) => {
                        if !self.is_running() {
                            return;
                        }
                        log::error!("discovery receive error: {}", e);
                        tokio::time::sleep(Duration::from_secs(1)).await;
                        continue;
                    }
                },
            };

            let reply = match protocol::parse_discover_reply(&buf[..len]) {
                Ok(reply) => reply,
                Err(e) => {
                    // Our own probes loop back here too; everything that is
                    // not a well-formed reply is silently dropped and counted.
                    self.dropped_frames.fetch_add(1, Ordering::SeqCst);
                    log::trace!("dropped datagram from {}: {}", from, e);
                    continue;
                }
            };
            if !reply.is_tuner() {
                continue;
            }

            match self.control.resolve(&reply, from).await {
                Ok(resolved) => self.registry.register(resolved),
                Err(e) => log::warn!(
                    "cannot resolve device {:08X} at {}: {}",
                    reply.device_id.unwrap_or(0),
                    from,
                    e
                ),
            }
        }
    }

    async fn send_loop(
        &self,
        socket: Arc<UdpSocket>,
        settings: DiscoverySettings,
        stop_rx: &mut watch::Receiver<bool>,
    ) {
        let probe = protocol::build_discover_request();
        let tick = if settings.broadcast_interval.is_zero() {
            Duration::from_secs(3600)
        } else {
            settings.broadcast_interval
        };

        // The first cycle goes out without waiting for the interval.
        self.send_cycle(&socket, &settings, &probe).await;

        loop {
            let periodic = tokio::select! {
                _ = stop_rx.changed() => return,
                _ = self.broadcast_wakeup.notified() => false,
                _ = tokio::time::sleep(tick) => true,
            };
            if !self.is_running() {
                return;
            }
            let demanded = self.need_broadcast.swap(false, Ordering::SeqCst);
            if periodic && settings.smart_broadcast && !demanded {
                // Smart broadcast: the periodic cycle is suppressed unless
                // something asked for one.
                continue;
            }
            if periodic && settings.broadcast_interval.is_zero() && !demanded {
                continue;
            }
            self.send_cycle(&socket, &settings, &probe).await;
        }
    }

    /// One probe cycle: several spaced packets to every interface
    /// broadcast address and every static address.
    async fn send_cycle(&self, socket: &UdpSocket, settings: &DiscoverySettings, probe: &[u8]) {
        let mut targets: Vec<SocketAddr> = broadcast_addresses()
            .into_iter()
            .map(|addr| SocketAddr::from((addr, settings.target_port)))
            .collect();
        targets.extend(
            settings
                .static_addresses
                .iter()
                .map(|addr| SocketAddr::from((*addr, settings.target_port))),
        );
        if targets.is_empty() {
            log::warn!("no discovery targets: no broadcast interfaces or static addresses");
            return;
        }

        for round in 0..PROBES_PER_CYCLE {
            for target in &targets {
                if let Err(e) = socket.send_to(probe, target).await {
                    log::debug!("probe to {} failed: {}", target, e);
                }
            }
            if round + 1 < PROBES_PER_CYCLE {
                tokio::time::sleep(PROBE_SPACING).await;
            }
        }
    }
}

/// Broadcast addresses of every usable interface: IPv4, not loopback, and
/// carrying a broadcast address (which point-to-point links lack).
fn broadcast_addresses() -> Vec<Ipv4Addr> {
    let interfaces = match get_if_addrs::get_if_addrs() {
        Ok(interfaces) => interfaces,
        Err(e) => {
            log::warn!("cannot enumerate interfaces: {}", e);
            return Vec::new();
        }
    };
    interfaces
        .into_iter()
        .filter(|interface| !interface.is_loopback())
        .filter_map(|interface| match interface.addr {
            get_if_addrs::IfAddr::V4(addr) => addr.broadcast,
            _ => None,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::registry::ResolvedDevice;
    use crate::discovery::DiscoverReply;
    use async_trait::async_trait;

    /// Resolver that fabricates device facts from the reply alone, the way
    /// a scripted control client would.
    struct StaticResolver;

    #[async_trait]
    impl ControlClient for StaticResolver {
        async fn resolve(
            &self,
            reply: &DiscoverReply,
            from: SocketAddr,
        ) -> crate::Result<ResolvedDevice> {
            Ok(ResolvedDevice {
                device_id: reply
                    .device_id
                    .ok_or_else(|| TunerError::Protocol("reply without device ID".into()))?,
                model: "HDHR5-2US".to_string(),
                tuner_count: reply.tuner_count.unwrap_or(2),
                ip: from.ip(),
                base_url: None,
                legacy: false,
                features: Vec::new(),
            })
        }
    }

    fn test_settings(target_port: u16) -> DiscoverySettings {
        DiscoverySettings {
            // Below 1024, so the engine binds an ephemeral port and the
            // test never collides with a real discovery service.
            broadcast_port: 0,
            target_port,
            broadcast_interval: Duration::from_millis(200),
            smart_broadcast: false,
            static_addresses: vec![Ipv4Addr::LOCALHOST],
        }
    }

    /// Responder that answers every third probe, exercising the engine's
    /// packet-loss tolerance.
    async fn lossy_responder(socket: UdpSocket, device_id: u32, tuner_count: u8) {
        let mut buf = [0u8; 1500];
        let mut probes = 0u32;
        loop {
            let Ok((len, from)) = socket.recv_from(&mut buf).await else {
                return;
            };
            if len < 2 || u16::from_be_bytes([buf[0], buf[1]]) != protocol::TYPE_DISCOVER_REQ {
                continue;
            }
            probes += 1;
            if probes % 3 != 0 {
                continue;
            }
            let reply = protocol::build_discover_reply(device_id, tuner_count, None);
            let _ = socket.send_to(&reply, from).await;
        }
    }

    #[tokio::test]
    async fn test_lossy_responder_is_discovered_exactly_once() {
        let responder = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
        let responder_port = responder.local_addr().unwrap().port();
        tokio::spawn(lossy_responder(responder, 0x1010_1010, 2));

        let registry = Arc::new(DeviceRegistry::new());
        let engine = Arc::new(DiscoveryEngine::new(
            Arc::clone(&registry),
            Arc::new(StaticResolver),
        ));
        engine.start(test_settings(responder_port)).await.unwrap();
        assert!(engine.is_running());

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while registry.device_count() == 0 && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        assert_eq!(registry.device_count(), 1);
        let device = registry.device(0x1010_1010).unwrap();
        assert_eq!(device.tuner_count, 2);
        assert_eq!(registry.tuners().len(), 2);

        engine.stop();
        engine.wait_for_stop().await;
        assert!(!engine.is_running());
    }

    #[tokio::test]
    async fn test_request_broadcast_under_smart_mode() {
        let responder = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
        let responder_port = responder.local_addr().unwrap().port();
        tokio::spawn(lossy_responder(responder, 0x2020_2020, 1));

        let registry = Arc::new(DeviceRegistry::new());
        let engine = Arc::new(DiscoveryEngine::new(
            Arc::clone(&registry),
            Arc::new(StaticResolver),
        ));
        let mut settings = test_settings(responder_port);
        settings.smart_broadcast = true;
        engine.start(settings).await.unwrap();

        // The responder answers every third probe cycle, so keep asking.
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while registry.device_count() == 0 && tokio::time::Instant::now() < deadline {
            engine.request_broadcast();
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        assert_eq!(registry.device_count(), 1);

        engine.stop();
        engine.wait_for_stop().await;
    }

    #[tokio::test]
    async fn test_double_start_is_rejected() {
        let registry = Arc::new(DeviceRegistry::new());
        let engine = Arc::new(DiscoveryEngine::new(registry, Arc::new(StaticResolver)));
        engine.start(test_settings(1)).await.unwrap();
        assert!(matches!(
            engine.start(test_settings(1)).await,
            Err(TunerError::State(_))
        ));
        engine.stop();
        engine.wait_for_stop().await;
    }
}
