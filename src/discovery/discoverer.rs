use super::engine::{DiscoveryEngine, DiscoverySettings};
use super::protocol::DEFAULT_DISCOVERY_PORT;
use super::registry::{
    DeviceRegistry, ParentRecord, PhysicalDevice, TunerBusyGuard, TunerRecord,
};
use super::{ControlClient, DeviceLoader};
use crate::config::{keys, OptionSpec, OptionStore, OptionValue};
use crate::consumer::ConsumerOptions;
use crate::upload::DEFAULT_UPLOAD_PORT;
use crate::{Result, TunerError};
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// The capture-device discoverer the recorder-facing controller talks to.
///
/// Glues the discovery engine and the registry behind one surface:
/// enable/disable, start/stop, enumeration, lookup, and loading a capture
/// device for a recording. The facade owns no tasks itself; lifecycle
/// calls forward to the engine.
///
/// All tunables live in the [`OptionStore`] passed at construction; the
/// facade defines its options there (reverting to defaults when persisted
/// values fail validation) and persists every change.
pub struct Discoverer {
    options: Arc<OptionStore>,
    registry: Arc<DeviceRegistry>,
    engine: Arc<DiscoveryEngine>,
    enabled: AtomicBool,
}

impl Discoverer {
    /// Builds the facade, defining its options in `options` and wiring the
    /// registry to `loader`.
    pub fn new(
        options: Arc<OptionStore>,
        control: Arc<dyn ControlClient>,
        loader: Arc<dyn DeviceLoader>,
    ) -> Self {
        define_options(&options);

        let registry = Arc::new(DeviceRegistry::new());
        registry.set_loader(loader);
        let engine = Arc::new(DiscoveryEngine::new(Arc::clone(&registry), control));

        Self {
            options,
            registry,
            engine,
            enabled: AtomicBool::new(true),
        }
    }

    /// Enables or disables the discoverer; a disabled discoverer refuses
    /// to start.
    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    /// Whether the discoverer may start.
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    /// Starts discovery with the current option values.
    pub async fn start(&self) -> Result<()> {
        if !self.is_enabled() {
            return Err(TunerError::State("discoverer is disabled".into()));
        }
        self.registry.set_ignore_lists(
            self.options
                .get_text_array(keys::IGNORE_MODELS)
                .unwrap_or_default(),
            self.options
                .get_text_array(keys::IGNORE_DEVICE_IDS)
                .unwrap_or_default(),
        );
        self.engine.start(self.settings()).await
    }

    /// Stops discovery; returns immediately.
    pub fn stop(&self) {
        self.engine.stop();
    }

    /// Joins the engine's background work.
    pub async fn wait_for_stop(&self) {
        self.engine.wait_for_stop().await;
    }

    /// Whether the discovery socket is open.
    pub fn is_running(&self) -> bool {
        self.engine.is_running()
    }

    /// Every known physical device.
    pub fn devices(&self) -> Vec<PhysicalDevice> {
        self.registry.devices()
    }

    /// A device by ID. A miss flags the engine for an on-demand broadcast
    /// so an unseen device gets probed promptly.
    pub fn device(&self, device_id: u32) -> Option<PhysicalDevice> {
        let found = self.registry.device(device_id);
        if found.is_none() {
            self.engine.request_broadcast();
        }
        found
    }

    /// Every known tuner.
    pub fn tuners(&self) -> Vec<TunerRecord> {
        self.registry.tuners()
    }

    /// Loads a tuner as a capture device, taking the tuner-busy marker.
    ///
    /// Fails when the tuner is unknown (which also flags a broadcast) or
    /// already captured. The returned device holds the busy marker until
    /// dropped.
    pub fn load_capture_device(&self, tuner_id: u32) -> Result<CaptureDevice> {
        let Some(tuner) = self.registry.tuner(tuner_id) else {
            self.engine.request_broadcast();
            return Err(TunerError::State(format!("unknown tuner {:08X}", tuner_id)));
        };
        let parent = self
            .registry
            .parent(tuner.parent_id)
            .ok_or_else(|| TunerError::State("tuner without parent record".into()))?;
        let device = self
            .registry
            .device(parent.device_id)
            .ok_or_else(|| TunerError::State("parent without physical device".into()))?;
        let guard = self.registry.claim_tuner(tuner_id)?;

        log::info!(
            "loaded capture device {} (tuner {} of {:08X})",
            tuner.name,
            tuner.index,
            device.device_id
        );
        Ok(CaptureDevice {
            tuner,
            parent,
            device,
            _guard: guard,
        })
    }

    /// Consumer engine options for `channel`, from the store's tunables.
    pub fn consumer_options(&self, channel: &str) -> ConsumerOptions {
        let mut options = ConsumerOptions::new(channel);
        if let Some(v) = self.options.get_long(keys::STREAM_BUFFER_SIZE) {
            options.ring_capacity = v as usize;
        }
        if let Some(v) = self.options.get_integer(keys::MIN_TRANSFER_SIZE) {
            options.min_transfer = v as usize;
        }
        if let Some(v) = self.options.get_integer(keys::MAX_TRANSFER_SIZE) {
            options.max_transfer = v as usize;
        }
        if let Some(v) = self.options.get_long(keys::DIRECT_FLUSH_MIN) {
            options.direct_flush_min = v as u64;
        }
        options
    }

    /// TCP port of the recorder's upload service.
    pub fn upload_port(&self) -> u16 {
        self.options
            .get_integer(keys::UPLOAD_PORT)
            .map(|v| v as u16)
            .unwrap_or(DEFAULT_UPLOAD_PORT)
    }

    /// Interval between retune liveness polls.
    pub fn retune_poll(&self) -> Duration {
        Duration::from_secs(
            self.options
                .get_integer(keys::RETUNE_POLL_S)
                .unwrap_or(1)
                .max(0) as u64,
        )
    }

    /// Whether capture always takes the tuner hardware lock.
    pub fn always_force_lockout(&self) -> bool {
        self.options
            .get_bool(keys::ALWAYS_FORCE_LOCKOUT)
            .unwrap_or(false)
    }

    /// Attempts for failed tuner operations.
    pub fn retry_count(&self) -> u32 {
        self.options.get_integer(keys::RETRY_COUNT).unwrap_or(2).max(0) as u32
    }

    /// Replaces the static probe addresses, persists the option, and
    /// requests an immediate broadcast so the new addresses are probed
    /// right away.
    pub fn set_static_addresses(&self, addresses: &[Ipv4Addr]) -> Result<()> {
        self.options.set(
            keys::STATIC_ADDRESSES,
            OptionValue::TextArray(addresses.iter().map(|a| a.to_string()).collect()),
        )?;
        self.engine.request_broadcast();
        Ok(())
    }

    /// Sets an arbitrary option through the store (validated, persisted).
    pub fn set_option(&self, key: &str, value: OptionValue) -> Result<()> {
        self.options.set(key, value)
    }

    /// The store this facade reads its tunables from.
    pub fn options(&self) -> &Arc<OptionStore> {
        &self.options
    }

    /// The registry backing this facade.
    pub fn registry(&self) -> &Arc<DeviceRegistry> {
        &self.registry
    }

    /// The discovery engine backing this facade.
    pub fn engine(&self) -> &Arc<DiscoveryEngine> {
        &self.engine
    }

    fn settings(&self) -> DiscoverySettings {
        let mut static_addresses = Vec::new();
        for raw in self
            .options
            .get_text_array(keys::STATIC_ADDRESSES)
            .unwrap_or_default()
        {
            match raw.parse::<Ipv4Addr>() {
                Ok(addr) => static_addresses.push(addr),
                Err(_) => log::warn!("ignoring invalid static address {:?}", raw),
            }
        }
        DiscoverySettings {
            broadcast_port: self
                .options
                .get_integer(keys::BROADCAST_PORT)
                .map(|v| v as u16)
                .unwrap_or(DEFAULT_DISCOVERY_PORT),
            target_port: DEFAULT_DISCOVERY_PORT,
            broadcast_interval: Duration::from_secs(
                self.options.get_integer(keys::BROADCAST_S).unwrap_or(58).max(0) as u64,
            ),
            smart_broadcast: self
                .options
                .get_bool(keys::SMART_BROADCAST)
                .unwrap_or(true),
            static_addresses,
        }
    }
}

/// A tuner loaded for capture: the records describing it plus the busy
/// marker keeping other sessions off the hardware until this is dropped.
pub struct CaptureDevice {
    tuner: TunerRecord,
    parent: ParentRecord,
    device: PhysicalDevice,
    _guard: TunerBusyGuard,
}

impl CaptureDevice {
    /// The tuner being captured.
    pub fn tuner(&self) -> &TunerRecord {
        &self.tuner
    }

    /// The capture parent owning the tuner.
    pub fn parent(&self) -> &ParentRecord {
        &self.parent
    }

    /// The physical device the tuner lives on.
    pub fn device(&self) -> &PhysicalDevice {
        &self.device
    }
}

/// Defines every option this facade consults. Construction never fails:
/// persisted values that no longer validate revert to these defaults.
fn define_options(store: &OptionStore) {
    store.define(OptionSpec::integer(
        keys::BROADCAST_S,
        "Seconds between periodic discovery broadcasts (0 disables them)",
        58,
        0,
        3600,
    ));
    store.define(OptionSpec::integer(
        keys::BROADCAST_PORT,
        "UDP port the discovery socket binds; below 1024 binds ephemeral",
        DEFAULT_DISCOVERY_PORT as i32,
        0,
        65535,
    ));
    store.define(OptionSpec::bool(
        keys::SMART_BROADCAST,
        "Only broadcast when something asked for a probe",
        true,
    ));
    store.define(OptionSpec::text_array(
        keys::STATIC_ADDRESSES,
        "Unicast probe targets outside the broadcast domain",
    ));
    store.define(OptionSpec::text_array(
        keys::IGNORE_MODELS,
        "Device models dropped at registration",
    ));
    store.define(OptionSpec::text_array(
        keys::IGNORE_DEVICE_IDS,
        "Device IDs (hex) dropped at registration",
    ));
    store.define(OptionSpec::integer(
        keys::RETUNE_POLL_S,
        "Seconds between retune liveness polls",
        1,
        0,
        60,
    ));
    store.define(OptionSpec::bool(
        keys::ALWAYS_FORCE_LOCKOUT,
        "Always take the tuner hardware lock when capturing",
        false,
    ));
    store.define(OptionSpec::integer(
        keys::RETRY_COUNT,
        "Attempts for failed tuner operations",
        2,
        0,
        10,
    ));
    store.define(OptionSpec::integer(
        keys::UPLOAD_PORT,
        "TCP port of the recorder's upload service",
        DEFAULT_UPLOAD_PORT as i32,
        1,
        65535,
    ));
    store.define(OptionSpec::long(
        keys::STREAM_BUFFER_SIZE,
        "Ring buffer capacity in bytes",
        2 * 1024 * 1024,
        1024 * 1024,
        64 * 1024 * 1024,
    ));
    store.define(OptionSpec::integer(
        keys::MIN_TRANSFER_SIZE,
        "Minimum bytes per streaming transfer",
        65536,
        1316,
        1024 * 1024,
    ));
    store.define(OptionSpec::integer(
        keys::MAX_TRANSFER_SIZE,
        "Maximum bytes per streaming transfer",
        131072,
        4096,
        4 * 1024 * 1024,
    ));
    store.define(OptionSpec::long(
        keys::DIRECT_FLUSH_MIN,
        "Bytes written before the file sink's direct-flush check",
        1024 * 1024,
        0,
        i64::MAX,
    ));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::registry::ResolvedDevice;
    use crate::discovery::DiscoverReply;
    use async_trait::async_trait;
    use std::net::{IpAddr, SocketAddr};

    struct NullResolver;

    #[async_trait]
    impl ControlClient for NullResolver {
        async fn resolve(
            &self,
            _reply: &DiscoverReply,
            _from: SocketAddr,
        ) -> Result<ResolvedDevice> {
            Err(TunerError::Protocol("not scripted".into()))
        }
    }

    struct NullLoader;

    impl DeviceLoader for NullLoader {
        fn advertise_tuner(&self, _tuner: &TunerRecord, _parent: &ParentRecord) {}
    }

    fn test_discoverer() -> Discoverer {
        Discoverer::new(
            Arc::new(OptionStore::new()),
            Arc::new(NullResolver),
            Arc::new(NullLoader),
        )
    }

    fn seed_device(discoverer: &Discoverer, device_id: u32) {
        discoverer.registry().register(ResolvedDevice {
            device_id,
            model: "HDHR5-2US".to_string(),
            tuner_count: 2,
            ip: IpAddr::V4(Ipv4Addr::new(192, 168, 1, 50)),
            base_url: None,
            legacy: false,
            features: Vec::new(),
        });
    }

    #[test]
    fn test_options_are_defined_with_defaults() {
        let discoverer = test_discoverer();
        assert_eq!(discoverer.upload_port(), DEFAULT_UPLOAD_PORT);
        assert_eq!(discoverer.retune_poll(), Duration::from_secs(1));
        assert_eq!(discoverer.retry_count(), 2);
        assert!(!discoverer.always_force_lockout());

        let options = discoverer.consumer_options("44-1");
        assert_eq!(options.channel, "44-1");
        assert_eq!(options.ring_capacity, 2 * 1024 * 1024);
        assert_eq!(options.min_transfer, 65536);
    }

    #[test]
    fn test_device_miss_requests_broadcast() {
        let discoverer = test_discoverer();
        assert!(!discoverer.engine().need_broadcast());
        assert!(discoverer.device(0xDEAD_BEEF).is_none());
        assert!(discoverer.engine().need_broadcast());
    }

    #[test]
    fn test_set_static_addresses_persists_and_flags_broadcast() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tunerio.properties");
        let discoverer = Discoverer::new(
            Arc::new(OptionStore::with_file(&path)),
            Arc::new(NullResolver),
            Arc::new(NullLoader),
        );

        discoverer
            .set_static_addresses(&[Ipv4Addr::new(10, 0, 0, 9)])
            .unwrap();
        assert!(discoverer.engine().need_broadcast());
        let persisted = std::fs::read_to_string(&path).unwrap();
        assert!(persisted.contains("hdhr.static_addresses=10.0.0.9"));
    }

    #[test]
    fn test_load_capture_device_enforces_busy_marker() {
        let discoverer = test_discoverer();
        seed_device(&discoverer, 0x1010_1010);
        let tuner_id = discoverer.tuners()[0].tuner_id;

        let capture = discoverer.load_capture_device(tuner_id).unwrap();
        assert_eq!(capture.tuner().tuner_id, tuner_id);
        assert_eq!(capture.device().device_id, 0x1010_1010);
        assert!(discoverer.load_capture_device(tuner_id).is_err());

        drop(capture);
        assert!(discoverer.load_capture_device(tuner_id).is_ok());
    }

    #[test]
    fn test_unknown_tuner_flags_broadcast() {
        let discoverer = test_discoverer();
        assert!(discoverer.load_capture_device(0x1234_5678).is_err());
        assert!(discoverer.engine().need_broadcast());
    }

    #[tokio::test]
    async fn test_disabled_discoverer_refuses_to_start() {
        let discoverer = test_discoverer();
        discoverer.set_enabled(false);
        assert!(matches!(
            discoverer.start().await,
            Err(TunerError::State(_))
        ));
        assert!(!discoverer.is_running());
    }
}
