use super::DeviceLoader;
use crate::{Result, TunerError};
use chrono::{DateTime, Utc};
use md5::{Digest, Md5};
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use url::Url;

/// A physical HDHomeRun device as the registry knows it.
///
/// Created on the first discovery reply for its ID and destroyed only when
/// the registry is torn down; in between, only the address, feature flags,
/// and timestamps change.
#[derive(Debug, Clone)]
pub struct PhysicalDevice {
    /// 32-bit device ID from the discovery reply; the stable identity.
    pub device_id: u32,
    /// Model string, e.g. `HDHR5-4US`.
    pub model: String,
    /// Number of physical tuners on the device.
    pub tuner_count: u8,
    /// Address the device most recently replied from.
    pub ip: IpAddr,
    /// HTTP base URL advertised by the device.
    pub base_url: Option<Url>,
    /// Whether the device only supports legacy RF tuning.
    pub legacy: bool,
    /// Hardware feature strings reported by the control protocol.
    pub features: Vec<String>,
    /// When the device was first registered.
    pub first_seen: DateTime<Utc>,
    /// When the device last replied.
    pub last_seen: DateTime<Utc>,
}

/// Registry record for a capture parent: one per physical device.
#[derive(Debug, Clone)]
pub struct ParentRecord {
    /// Hash of the unique device name.
    pub parent_id: u32,
    /// Unique device name the ID was derived from.
    pub name: String,
    /// Local NIC address routing to the device.
    pub local_address: IpAddr,
    /// The physical device this parent fronts.
    pub device_id: u32,
    /// Children, one per tuner.
    pub tuner_ids: Vec<u32>,
}

/// Registry record for a single tuner. Immutable after creation.
#[derive(Debug, Clone)]
pub struct TunerRecord {
    /// Hash of the unique tuner name.
    pub tuner_id: u32,
    /// Unique tuner name the ID was derived from.
    pub name: String,
    /// Owning parent; always resolves in the registry.
    pub parent_id: u32,
    /// Tuner index on the device, `0..tuner_count`.
    pub index: u8,
    /// Human description for UIs and logs.
    pub description: String,
}

/// A discovery reply resolved into device facts, possibly via a follow-up
/// control-protocol query by the external [`ControlClient`].
///
/// [`ControlClient`]: super::ControlClient
#[derive(Debug, Clone)]
pub struct ResolvedDevice {
    /// 32-bit device ID.
    pub device_id: u32,
    /// Model string.
    pub model: String,
    /// Number of tuners.
    pub tuner_count: u8,
    /// Address the reply came from.
    pub ip: IpAddr,
    /// Advertised HTTP base URL.
    pub base_url: Option<Url>,
    /// Whether the device only supports legacy RF tuning.
    pub legacy: bool,
    /// Hardware feature strings.
    pub features: Vec<String>,
}

/// Derives a stable 32-bit ID from a unique name: the first four bytes of
/// the name's MD5 digest, big-endian.
pub fn hash_name(name: &str) -> u32 {
    let mut hasher = Md5::new();
    hasher.update(name.as_bytes());
    let digest = hasher.finalize();
    u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]])
}

struct Maps {
    devices: HashMap<u32, PhysicalDevice>,
    parents: HashMap<u32, ParentRecord>,
    tuners: HashMap<u32, TunerRecord>,
    busy: HashSet<u32>,
}

/// Ignore rules applied before a reply touches the maps.
#[derive(Debug, Clone, Default)]
struct IgnoreList {
    models: Vec<String>,
    device_ids: Vec<String>,
}

impl IgnoreList {
    fn matches(&self, device_id: u32, model: &str) -> bool {
        if self
            .models
            .iter()
            .any(|m| m.eq_ignore_ascii_case(model))
        {
            return true;
        }
        self.device_ids.iter().any(|entry| {
            let entry = entry.trim().trim_start_matches("0x").trim_start_matches("0X");
            // Hex comparison, case-insensitive, padded or not.
            u32::from_str_radix(entry, 16) == Ok(device_id)
        })
    }
}

/// The authority on every discovered device, parent, and tuner.
///
/// All three maps share one reader-writer lock: mutations are atomic with
/// respect to readers, and enumeration takes the read lock. The registry
/// also hands out tuner-busy guards so at most one capture session can
/// hold a tuner at a time.
pub struct DeviceRegistry {
    inner: RwLock<Maps>,
    ignore: RwLock<IgnoreList>,
    loader: RwLock<Option<Arc<dyn DeviceLoader>>>,
}

impl DeviceRegistry {
    /// An empty registry with no ignore rules and no loader.
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Maps {
                devices: HashMap::new(),
                parents: HashMap::new(),
                tuners: HashMap::new(),
                busy: HashSet::new(),
            }),
            ignore: RwLock::new(IgnoreList::default()),
            loader: RwLock::new(None),
        }
    }

    /// Sets the collaborator advertised to whenever a new tuner appears.
    pub fn set_loader(&self, loader: Arc<dyn DeviceLoader>) {
        *self.loader.write() = Some(loader);
    }

    /// Replaces the ignore rules. Models compare case-insensitively; IDs
    /// compare as hex, accepting both zero-padded and unpadded forms.
    pub fn set_ignore_lists(&self, models: Vec<String>, device_ids: Vec<String>) {
        *self.ignore.write() = IgnoreList { models, device_ids };
    }

    /// Feeds one resolved discovery arrival into the maps.
    ///
    /// An ignored device is dropped. A known device only has its address
    /// and feature flags refreshed; its children are never recreated. A
    /// new device gets a `PhysicalDevice`, a `ParentRecord` bound to the
    /// local NIC that routes to it, and one `TunerRecord` per tuner, each
    /// advertised to the loader.
    pub fn register(&self, resolved: ResolvedDevice) {
        if self.ignore.read().matches(resolved.device_id, &resolved.model) {
            log::debug!(
                "ignoring device {:08X} ({})",
                resolved.device_id,
                resolved.model
            );
            return;
        }

        let mut created: Vec<(TunerRecord, ParentRecord)> = Vec::new();
        {
            let mut maps = self.inner.write();
            if let Some(existing) = maps.devices.get_mut(&resolved.device_id) {
                if existing.ip != resolved.ip {
                    log::info!(
                        "device {:08X} address changed from {} to {}",
                        resolved.device_id,
                        existing.ip,
                        resolved.ip
                    );
                    existing.ip = resolved.ip;
                    existing.base_url = resolved.base_url;
                }
                existing.legacy = resolved.legacy;
                existing.features = resolved.features;
                existing.last_seen = Utc::now();
                return;
            }

            let now = Utc::now();
            let device_name = format!("HDHomeRun {} {:08X}", resolved.model, resolved.device_id);
            let parent_id = hash_name(&device_name);
            let local_address = choose_local_address(resolved.ip);

            let mut parent = ParentRecord {
                parent_id,
                name: device_name.clone(),
                local_address,
                device_id: resolved.device_id,
                tuner_ids: Vec::with_capacity(resolved.tuner_count as usize),
            };

            let mut new_tuners = Vec::with_capacity(resolved.tuner_count as usize);
            for index in 0..resolved.tuner_count {
                let tuner_name = format!("{} Tuner {}", device_name, index);
                let tuner = TunerRecord {
                    tuner_id: hash_name(&tuner_name),
                    name: tuner_name,
                    parent_id,
                    index,
                    description: format!(
                        "{} {:08X} tuner {}",
                        resolved.model, resolved.device_id, index
                    ),
                };
                parent.tuner_ids.push(tuner.tuner_id);
                maps.tuners.insert(tuner.tuner_id, tuner.clone());
                new_tuners.push(tuner);
            }
            // The advertised parent snapshot carries the full child list.
            for tuner in new_tuners {
                created.push((tuner, parent.clone()));
            }

            log::info!(
                "registered device {:08X} ({}) at {} with {} tuners",
                resolved.device_id,
                resolved.model,
                resolved.ip,
                resolved.tuner_count
            );
            maps.devices.insert(
                resolved.device_id,
                PhysicalDevice {
                    device_id: resolved.device_id,
                    model: resolved.model,
                    tuner_count: resolved.tuner_count,
                    ip: resolved.ip,
                    base_url: resolved.base_url,
                    legacy: resolved.legacy,
                    features: resolved.features,
                    first_seen: now,
                    last_seen: now,
                },
            );
            maps.parents.insert(parent_id, parent);
        }

        // Advertise outside the write lock; the loader may call back in.
        if let Some(loader) = self.loader.read().clone() {
            for (tuner, parent) in &created {
                loader.advertise_tuner(tuner, parent);
            }
        }
    }

    /// Snapshot of a device by ID.
    pub fn device(&self, device_id: u32) -> Option<PhysicalDevice> {
        self.inner.read().devices.get(&device_id).cloned()
    }

    /// Snapshot of every known device.
    pub fn devices(&self) -> Vec<PhysicalDevice> {
        self.inner.read().devices.values().cloned().collect()
    }

    /// Snapshot of a parent record by ID.
    pub fn parent(&self, parent_id: u32) -> Option<ParentRecord> {
        self.inner.read().parents.get(&parent_id).cloned()
    }

    /// Snapshot of a tuner record by ID.
    pub fn tuner(&self, tuner_id: u32) -> Option<TunerRecord> {
        self.inner.read().tuners.get(&tuner_id).cloned()
    }

    /// Snapshot of every known tuner.
    pub fn tuners(&self) -> Vec<TunerRecord> {
        self.inner.read().tuners.values().cloned().collect()
    }

    /// Number of known devices.
    pub fn device_count(&self) -> usize {
        self.inner.read().devices.len()
    }

    /// Marks `tuner_id` busy for an upcoming capture session.
    ///
    /// Fails when the tuner is unknown or already held; the returned guard
    /// releases the tuner on drop. This is what makes "at most one
    /// consumer engine per tuner" hold.
    pub fn claim_tuner(self: &Arc<Self>, tuner_id: u32) -> Result<TunerBusyGuard> {
        let mut maps = self.inner.write();
        if !maps.tuners.contains_key(&tuner_id) {
            return Err(TunerError::State(format!("unknown tuner {:08X}", tuner_id)));
        }
        if !maps.busy.insert(tuner_id) {
            return Err(TunerError::State(format!(
                "tuner {:08X} is already in use",
                tuner_id
            )));
        }
        Ok(TunerBusyGuard {
            registry: Arc::clone(self),
            tuner_id,
        })
    }

    /// Whether `tuner_id` is currently held by a capture session.
    pub fn is_tuner_busy(&self, tuner_id: u32) -> bool {
        self.inner.read().busy.contains(&tuner_id)
    }
}

impl Default for DeviceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Exclusive hold on a tuner for the lifetime of a capture session.
pub struct TunerBusyGuard {
    registry: Arc<DeviceRegistry>,
    tuner_id: u32,
}

impl TunerBusyGuard {
    /// The tuner this guard holds.
    pub fn tuner_id(&self) -> u32 {
        self.tuner_id
    }
}

impl Drop for TunerBusyGuard {
    fn drop(&mut self) {
        self.registry.inner.write().busy.remove(&self.tuner_id);
    }
}

/// Picks the local IPv4 address whose network covers `device_ip`, falling
/// back to the first broadcast-capable NIC (the one the discovery
/// broadcast went out on) and finally to the unspecified address.
fn choose_local_address(device_ip: IpAddr) -> IpAddr {
    let interfaces = match get_if_addrs::get_if_addrs() {
        Ok(interfaces) => interfaces,
        Err(e) => {
            log::warn!("cannot enumerate interfaces: {}", e);
            return IpAddr::V4(Ipv4Addr::UNSPECIFIED);
        }
    };

    let device_v4 = match device_ip {
        IpAddr::V4(v4) => v4,
        IpAddr::V6(_) => return IpAddr::V4(Ipv4Addr::UNSPECIFIED),
    };

    let mut fallback = None;
    for interface in interfaces {
        if interface.is_loopback() {
            continue;
        }
        if let get_if_addrs::IfAddr::V4(ref addr) = interface.addr {
            if addr.broadcast.is_none() {
                continue;
            }
            let mask = u32::from(addr.netmask);
            if u32::from(addr.ip) & mask == u32::from(device_v4) & mask {
                return IpAddr::V4(addr.ip);
            }
            if fallback.is_none() {
                fallback = Some(addr.ip);
            }
        }
    }
    IpAddr::V4(fallback.unwrap_or(Ipv4Addr::UNSPECIFIED))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn resolved(device_id: u32, model: &str, tuner_count: u8, ip: [u8; 4]) -> ResolvedDevice {
        ResolvedDevice {
            device_id,
            model: model.to_string(),
            tuner_count,
            ip: IpAddr::V4(Ipv4Addr::new(ip[0], ip[1], ip[2], ip[3])),
            base_url: None,
            legacy: false,
            features: Vec::new(),
        }
    }

    #[test]
    fn test_registration_creates_parent_and_tuners() {
        let registry = DeviceRegistry::new();
        registry.register(resolved(0x1010_1010, "HDHR5-4US", 4, [192, 168, 1, 50]));

        assert_eq!(registry.device_count(), 1);
        let device = registry.device(0x1010_1010).unwrap();
        assert_eq!(device.model, "HDHR5-4US");
        assert_eq!(device.ip.to_string(), "192.168.1.50");

        let tuners = registry.tuners();
        assert_eq!(tuners.len(), 4);
        for tuner in &tuners {
            // Every tuner resolves through its parent to the device.
            let parent = registry.parent(tuner.parent_id).unwrap();
            assert_eq!(parent.device_id, 0x1010_1010);
            assert!(parent.tuner_ids.contains(&tuner.tuner_id));
        }
    }

    #[test]
    fn test_address_change_does_not_recreate_tuners() {
        let registry = DeviceRegistry::new();
        registry.register(resolved(0x1010_1010, "HDHR5-4US", 2, [192, 168, 1, 50]));
        let before: Vec<u32> = {
            let mut ids: Vec<u32> = registry.tuners().iter().map(|t| t.tuner_id).collect();
            ids.sort_unstable();
            ids
        };

        registry.register(resolved(0x1010_1010, "HDHR5-4US", 2, [192, 168, 1, 77]));

        assert_eq!(registry.device_count(), 1);
        let device = registry.device(0x1010_1010).unwrap();
        assert_eq!(device.ip.to_string(), "192.168.1.77");
        let after: Vec<u32> = {
            let mut ids: Vec<u32> = registry.tuners().iter().map(|t| t.tuner_id).collect();
            ids.sort_unstable();
            ids
        };
        assert_eq!(before, after);
    }

    #[test]
    fn test_ignore_by_model_and_hex_id() {
        let registry = DeviceRegistry::new();
        registry.set_ignore_lists(vec!["hdhr3-us".to_string()], vec![]);
        registry.register(resolved(0x1010_1010, "HDHR3-US", 2, [192, 168, 1, 50]));
        assert_eq!(registry.device_count(), 0);

        // Unpadded, lowercase hex matches too.
        registry.set_ignore_lists(vec![], vec!["a0b0c".to_string()]);
        registry.register(resolved(0x000A_0B0C, "HDHR5-2US", 2, [192, 168, 1, 51]));
        assert_eq!(registry.device_count(), 0);

        registry.set_ignore_lists(vec![], vec!["0x000A0B0C".to_string()]);
        registry.register(resolved(0x000A_0B0C, "HDHR5-2US", 2, [192, 168, 1, 51]));
        assert_eq!(registry.device_count(), 0);

        // A non-matching list lets the device through.
        registry.set_ignore_lists(vec![], vec!["deadbeef".to_string()]);
        registry.register(resolved(0x000A_0B0C, "HDHR5-2US", 2, [192, 168, 1, 51]));
        assert_eq!(registry.device_count(), 1);
    }

    #[test]
    fn test_loader_is_advertised_new_tuners_only() {
        use parking_lot::Mutex;

        struct CountingLoader {
            seen: Mutex<Vec<u32>>,
        }
        impl DeviceLoader for CountingLoader {
            fn advertise_tuner(&self, tuner: &TunerRecord, _parent: &ParentRecord) {
                self.seen.lock().push(tuner.tuner_id);
            }
        }

        let registry = DeviceRegistry::new();
        let loader = Arc::new(CountingLoader {
            seen: Mutex::new(Vec::new()),
        });
        registry.set_loader(loader.clone());

        registry.register(resolved(0x2020_2020, "HDHR5-2US", 2, [192, 168, 1, 60]));
        assert_eq!(loader.seen.lock().len(), 2);

        // A refresh of the same device advertises nothing new.
        registry.register(resolved(0x2020_2020, "HDHR5-2US", 2, [192, 168, 1, 61]));
        assert_eq!(loader.seen.lock().len(), 2);
    }

    #[test]
    fn test_busy_guard_is_exclusive_and_releases() {
        let registry = Arc::new(DeviceRegistry::new());
        registry.register(resolved(0x3030_3030, "HDHR5-2US", 1, [192, 168, 1, 70]));
        let tuner_id = registry.tuners()[0].tuner_id;

        let guard = registry.claim_tuner(tuner_id).unwrap();
        assert!(registry.is_tuner_busy(tuner_id));
        assert!(registry.claim_tuner(tuner_id).is_err());

        drop(guard);
        assert!(!registry.is_tuner_busy(tuner_id));
        let _again = registry.claim_tuner(tuner_id).unwrap();
    }

    #[test]
    fn test_hash_name_is_stable_and_distinct() {
        let a = hash_name("HDHomeRun HDHR5-4US 10101010 Tuner 0");
        let b = hash_name("HDHomeRun HDHR5-4US 10101010 Tuner 1");
        assert_ne!(a, b);
        assert_eq!(a, hash_name("HDHomeRun HDHR5-4US 10101010 Tuner 0"));
    }
}
