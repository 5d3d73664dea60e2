//! # LAN Tuner Discovery
//!
//! Finds HDHomeRun-family tuners on the local network and keeps their
//! records current while their addresses drift:
//!
//! - [`protocol`] — the UDP discovery wire format (framing, TLVs, CRC)
//! - [`DiscoveryEngine`] — broadcast/unicast probe loop and receive path
//! - [`DeviceRegistry`] — the authority mapping stable device IDs to
//!   parent and tuner records
//! - [`Discoverer`] — the facade the recorder-facing controller talks to
//!
//! Two collaborators stay outside this crate and are reached through
//! traits: the HDHomeRun control client that turns a discovery reply into
//! full device facts, and the device loader that is told about every new
//! tuner.
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use tunerio::discovery::{DeviceRegistry, DiscoverySettings};
//! use std::sync::Arc;
//!
//! let registry = Arc::new(DeviceRegistry::new());
//! let settings = DiscoverySettings::default();
//! assert_eq!(settings.broadcast_port, 65001);
//! assert!(registry.devices().is_empty());
//! ```

/// Discovery probe loop over UDP
pub mod engine;

/// Recorder-facing facade over the engine and registry
pub mod discoverer;

/// Discovery wire format
pub mod protocol;

/// Device, parent, and tuner bookkeeping
pub mod registry;

pub use discoverer::{CaptureDevice, Discoverer};
pub use engine::{DiscoveryEngine, DiscoverySettings};
pub use protocol::{DiscoverReply, DEFAULT_DISCOVERY_PORT};
pub use registry::{
    DeviceRegistry, ParentRecord, PhysicalDevice, ResolvedDevice, TunerBusyGuard, TunerRecord,
};

use crate::Result;
use async_trait::async_trait;
use std::net::SocketAddr;

/// External HDHomeRun control-protocol client.
///
/// A discovery reply only carries a device ID, type, and base URL; model,
/// tuner count, and feature facts may need a follow-up control query. That
/// query belongs to the recorder's HDHomeRun client, which implements this
/// trait; tunerio only consumes the resolved result.
#[async_trait]
pub trait ControlClient: Send + Sync {
    /// Resolves a verified discover reply from `from` into device facts.
    async fn resolve(&self, reply: &DiscoverReply, from: SocketAddr) -> Result<ResolvedDevice>;
}

/// External collaborator told about every newly registered tuner so the
/// recorder can offer it as a capture device.
pub trait DeviceLoader: Send + Sync {
    /// Called once per new tuner, outside the registry lock.
    fn advertise_tuner(&self, tuner: &TunerRecord, parent: &ParentRecord);
}
