//! Collaborator interfaces for port topology and queue-pair allocation
//!
//! The engine only queries these; it never mutates them. The in-memory
//! implementations here back tests and offline tooling.

use crate::error::{SyncError, SyncResult};
use ctxsync_types::{CommId, DeviceId, PortId, PortMask};
use std::collections::{BTreeMap, HashMap};
use std::fmt;

/// Which physical port reaches which remote device
pub trait PortTopology {
    /// Remote device behind `port`, `None` if the port is unconnected
    fn remote_device(&self, port: PortId) -> Option<DeviceId>;

    /// Whether `port` belongs to the inter-chassis (scale-out) fabric
    fn is_scaleout_port(&self, port: PortId) -> bool;

    /// Every active port connected to `device`, both fabrics
    fn all_active_ports_for(&self, device: DeviceId) -> PortMask;
}

/// Hardware queue-pair numbers of logical endpoints
pub trait QueuePairProvider {
    fn queue_pair_number(&self, comm: CommId, port: PortId, peer: DeviceId) -> u32;
}

impl<F> QueuePairProvider for F
where
    F: Fn(CommId, PortId, DeviceId) -> u32,
{
    fn queue_pair_number(&self, comm: CommId, port: PortId, peer: DeviceId) -> u32 {
        self(comm, port, peer)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct PortEntry {
    device: DeviceId,
    scaleout: bool,
    active: bool,
}

/// Fixed port-to-device map
#[derive(Debug, Clone, Default)]
pub struct StaticTopology {
    ports: BTreeMap<PortId, PortEntry>,
}

impl StaticTopology {
    pub fn builder() -> StaticTopologyBuilder {
        StaticTopologyBuilder::default()
    }

    /// Connected ports in ascending order
    pub fn ports(&self) -> impl Iterator<Item = PortId> + '_ {
        self.ports.keys().copied()
    }

    /// Active ports of one fabric
    pub fn active_ports(&self, scaleout: bool) -> PortMask {
        self.ports
            .iter()
            .filter(|(_, e)| e.active && e.scaleout == scaleout)
            .map(|(port, _)| *port)
            .collect()
    }
}

impl PortTopology for StaticTopology {
    fn remote_device(&self, port: PortId) -> Option<DeviceId> {
        self.ports.get(&port).map(|e| e.device)
    }

    fn is_scaleout_port(&self, port: PortId) -> bool {
        self.ports.get(&port).is_some_and(|e| e.scaleout)
    }

    fn all_active_ports_for(&self, device: DeviceId) -> PortMask {
        self.ports
            .iter()
            .filter(|(_, e)| e.active && e.device == device)
            .map(|(port, _)| *port)
            .collect()
    }
}

/// Builder for [`StaticTopology`]
#[derive(Debug, Default)]
pub struct StaticTopologyBuilder {
    ports: BTreeMap<PortId, PortEntry>,
    duplicate: Option<PortId>,
}

impl StaticTopologyBuilder {
    fn connect(mut self, port: PortId, device: DeviceId, scaleout: bool) -> Self {
        let entry = PortEntry {
            device,
            scaleout,
            active: true,
        };
        if self.ports.insert(port, entry).is_some() && self.duplicate.is_none() {
            self.duplicate = Some(port);
        }
        self
    }

    /// Intra-chassis port wired to `device`
    pub fn scale_up(self, port: PortId, device: DeviceId) -> Self {
        self.connect(port, device, false)
    }

    /// Inter-chassis port wired to `device`
    pub fn scale_out(self, port: PortId, device: DeviceId) -> Self {
        self.connect(port, device, true)
    }

    /// Keep the port in the map but exclude it from active port sets
    pub fn inactive(mut self, port: PortId) -> Self {
        if let Some(entry) = self.ports.get_mut(&port) {
            entry.active = false;
        }
        self
    }

    pub fn build(self) -> SyncResult<StaticTopology> {
        if let Some(port) = self.duplicate {
            return Err(SyncError::invalid_input(format!(
                "{} connected more than once",
                port
            )));
        }
        if let Some(port) = self.ports.keys().find(|p| p.index() >= PortMask::MAX_PORTS as usize) {
            return Err(SyncError::invalid_input(format!(
                "{} is beyond the {}-port mask",
                port,
                PortMask::MAX_PORTS
            )));
        }
        Ok(StaticTopology { ports: self.ports })
    }
}

/// Table-backed queue-pair numbers with a fallback
pub struct FixedQueuePairs {
    table: HashMap<(CommId, PortId), u32>,
    fallback: Box<dyn Fn(CommId, PortId, DeviceId) -> u32>,
}

impl FixedQueuePairs {
    /// Every endpoint uses `qpn` unless overridden
    pub fn uniform(qpn: u32) -> Self {
        Self::from_fn(move |_, _, _| qpn)
    }

    pub fn from_fn<F>(f: F) -> Self
    where
        F: Fn(CommId, PortId, DeviceId) -> u32 + 'static,
    {
        Self {
            table: HashMap::new(),
            fallback: Box::new(f),
        }
    }

    /// Override the number used by `comm` on `port`
    pub fn with(mut self, comm: CommId, port: PortId, qpn: u32) -> Self {
        self.table.insert((comm, port), qpn);
        self
    }
}

impl QueuePairProvider for FixedQueuePairs {
    fn queue_pair_number(&self, comm: CommId, port: PortId, peer: DeviceId) -> u32 {
        match self.table.get(&(comm, port)) {
            Some(qpn) => *qpn,
            None => (self.fallback)(comm, port, peer),
        }
    }
}

impl fmt::Debug for FixedQueuePairs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FixedQueuePairs")
            .field("overrides", &self.table.len())
            .finish_non_exhaustive()
    }
}
