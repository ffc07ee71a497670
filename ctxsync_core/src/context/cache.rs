//! Host-side mirror of one collective context
//!
//! A [`CachedContext`] holds the register values last written to its
//! context index on the device. Callers describe the state they need with a
//! [`RequiredContext`]; [`CachedContext::diff`] reports exactly the fields
//! that differ and [`CachedContext::apply`] commits them once the matching
//! command bytes have been built.
//!
//! The synchronization-object address is double-buffered. A required
//! address that matches either slot needs no write. Otherwise the write
//! goes to the slot opposite the one used last, so a signal still in flight
//! on the previous slot is never overwritten.

use super::fields::ContextFields;
use crate::error::SyncResult;
use crate::sync_invariant;
use ctxsync_types::{CommId, DeviceId, PortId};

/// Number of alternating sync-object address slots per context
pub const SYNC_OBJECT_SLOTS: usize = 2;

/// Desired state of one context index for the next collective step
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct RequiredContext {
    reduction_opcode: u32,
    sync_object_address: u32,
    address_msb: u32,
    stride: u32,
    remote_peers: u32,
}

impl RequiredContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_reduction_opcode(mut self, opcode: u32) -> Self {
        self.reduction_opcode = opcode;
        self
    }

    pub fn with_sync_object(mut self, address: u32) -> Self {
        self.sync_object_address = address;
        self
    }

    pub fn with_address_msb(mut self, msb: u32) -> Self {
        self.address_msb = msb;
        self
    }

    pub fn with_stride(mut self, stride: u32) -> Self {
        self.stride = stride;
        self
    }

    /// Bit `d` enables remote device `d`
    pub fn with_remote_peers(mut self, peers: u32) -> Self {
        self.remote_peers = peers;
        self
    }

    pub fn reduction_opcode(&self) -> u32 {
        self.reduction_opcode
    }

    pub fn sync_object_address(&self) -> u32 {
        self.sync_object_address
    }

    pub fn address_msb(&self) -> u32 {
        self.address_msb
    }

    pub fn stride(&self) -> u32 {
        self.stride
    }

    pub fn remote_peers(&self) -> u32 {
        self.remote_peers
    }

    /// Enabled remote devices in ascending order
    pub fn remote_devices(&self) -> impl Iterator<Item = DeviceId> {
        let peers = self.remote_peers;
        (0..u32::BITS)
            .filter(move |d| peers & (1 << d) != 0)
            .map(DeviceId)
    }

    /// Register value of a single base field, `None` for per-port fields
    pub fn field_value(&self, field: ContextFields) -> Option<u32> {
        if field == ContextFields::REDUCTION_OPCODE {
            Some(self.reduction_opcode)
        } else if field == ContextFields::SYNC_OBJECT_0 || field == ContextFields::SYNC_OBJECT_1 {
            Some(self.sync_object_address)
        } else if field == ContextFields::ADDRESS_MSB {
            Some(self.address_msb)
        } else if field == ContextFields::STRIDE {
            Some(self.stride)
        } else if field == ContextFields::REMOTE_RANKS {
            Some(self.remote_peers)
        } else {
            None
        }
    }
}

/// Result of comparing a cached context against a required one
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContextDiff {
    /// Fields whose cached value differs from the required value
    pub fields: ContextFields,
    /// Sync-object slot the required address lives in after the update
    pub sync_slot: usize,
}

impl ContextDiff {
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Whether the sync-object address has to be written
    #[inline]
    pub fn writes_sync_object(&self) -> bool {
        self.fields.intersects(ContextFields::SYNC_OBJECTS)
    }
}

/// Communicator and hardware descriptor slot a context last referenced
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommBinding {
    pub comm: CommId,
    pub slot: u32,
}

/// Per-port state last written for a context
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PortBinding {
    pub qpn: Option<u32>,
    pub peer: Option<DeviceId>,
}

/// Last-known device-side state of one collective context
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedContext {
    index: u32,
    reduction_opcode: u32,
    sync_objects: [u32; SYNC_OBJECT_SLOTS],
    last_sync_slot: usize,
    address_msb: u32,
    stride: u32,
    remote_peers: u32,
    comm: Option<CommBinding>,
    ports: Vec<PortBinding>,
}

impl CachedContext {
    /// Context in device reset state: every register zero. The last-used
    /// sync slot starts at 1 so the first address write lands in slot 0.
    pub fn new(index: u32, num_ports: usize) -> Self {
        Self {
            index,
            reduction_opcode: 0,
            sync_objects: [0; SYNC_OBJECT_SLOTS],
            last_sync_slot: SYNC_OBJECT_SLOTS - 1,
            address_msb: 0,
            stride: 0,
            remote_peers: 0,
            comm: None,
            ports: vec![PortBinding::default(); num_ports],
        }
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn reduction_opcode(&self) -> u32 {
        self.reduction_opcode
    }

    pub fn sync_object(&self, slot: usize) -> Option<u32> {
        self.sync_objects.get(slot).copied()
    }

    pub fn last_sync_slot(&self) -> usize {
        self.last_sync_slot
    }

    pub fn address_msb(&self) -> u32 {
        self.address_msb
    }

    pub fn stride(&self) -> u32 {
        self.stride
    }

    pub fn remote_peers(&self) -> u32 {
        self.remote_peers
    }

    pub fn comm_binding(&self) -> Option<CommBinding> {
        self.comm
    }

    pub fn port_binding(&self, port: PortId) -> PortBinding {
        self.ports.get(port.index()).copied().unwrap_or_default()
    }

    /// Compare against `required`. Pure: the cache is not touched.
    pub fn diff(&self, required: &RequiredContext) -> ContextDiff {
        let mut fields = ContextFields::empty();

        if self.reduction_opcode != required.reduction_opcode {
            fields |= ContextFields::REDUCTION_OPCODE;
        }
        if self.address_msb != required.address_msb {
            fields |= ContextFields::ADDRESS_MSB;
        }
        if self.stride != required.stride {
            fields |= ContextFields::STRIDE;
        }
        if self.remote_peers != required.remote_peers {
            fields |= ContextFields::REMOTE_RANKS;
        }

        let last = self.last_sync_slot;
        let other = SYNC_OBJECT_SLOTS - 1 - last;
        let sync_slot = if self.sync_objects[last] == required.sync_object_address {
            last
        } else if self.sync_objects[other] == required.sync_object_address {
            other
        } else {
            fields |= ContextFields::sync_object(other);
            other
        };

        ContextDiff { fields, sync_slot }
    }

    /// Commit the base fields of `diff` so the cache mirrors `required`.
    ///
    /// All checks run before anything is written: on error the cache is
    /// unchanged. Per-port fields in `diff` are ignored here, see
    /// [`bind_port`](Self::bind_port).
    pub fn apply(&mut self, required: &RequiredContext, diff: &ContextDiff) -> SyncResult<()> {
        if diff.sync_slot >= SYNC_OBJECT_SLOTS {
            return Err(sync_invariant!(
                "context {}: sync slot {} out of range",
                self.index,
                diff.sync_slot
            ));
        }
        if diff.fields.contains(ContextFields::SYNC_OBJECTS) {
            return Err(sync_invariant!(
                "context {}: both sync-object slots written in one update",
                self.index
            ));
        }
        if diff.writes_sync_object() {
            let flagged = ContextFields::sync_object(diff.sync_slot);
            if !diff.fields.contains(flagged) {
                return Err(sync_invariant!(
                    "context {}: sync write flagged for the wrong slot (expected slot {})",
                    self.index,
                    diff.sync_slot
                ));
            }
        } else if self.sync_objects[diff.sync_slot] != required.sync_object_address {
            return Err(sync_invariant!(
                "context {}: sync slot {} holds {:#x}, required {:#x} without a write",
                self.index,
                diff.sync_slot,
                self.sync_objects[diff.sync_slot],
                required.sync_object_address
            ));
        }

        let mut next = self.clone();
        for field in diff.fields.intersection(ContextFields::BASE).each() {
            let value = required.field_value(field).unwrap_or_default();
            let register = next.register_mut(field, diff.sync_slot);
            if *register == value {
                return Err(sync_invariant!(
                    "context {}: field {:?} rewritten with its current value {:#x}",
                    self.index,
                    field,
                    value
                ));
            }
            *register = value;
        }
        next.last_sync_slot = diff.sync_slot;
        *self = next;
        Ok(())
    }

    fn register_mut(&mut self, field: ContextFields, sync_slot: usize) -> &mut u32 {
        if field == ContextFields::REDUCTION_OPCODE {
            &mut self.reduction_opcode
        } else if field.intersects(ContextFields::SYNC_OBJECTS) {
            &mut self.sync_objects[sync_slot]
        } else if field == ContextFields::ADDRESS_MSB {
            &mut self.address_msb
        } else if field == ContextFields::STRIDE {
            &mut self.stride
        } else {
            &mut self.remote_peers
        }
    }

    pub(crate) fn bind_comm(&mut self, binding: CommBinding) {
        self.comm = Some(binding);
    }

    pub(crate) fn unbind_comm(&mut self) -> Option<CommBinding> {
        for port in &mut self.ports {
            port.qpn = None;
        }
        self.comm.take()
    }

    pub(crate) fn bind_port(&mut self, port: PortId, binding: PortBinding) {
        if let Some(slot) = self.ports.get_mut(port.index()) {
            *slot = binding;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn required() -> RequiredContext {
        RequiredContext::new()
            .with_reduction_opcode(0x21)
            .with_sync_object(0x4000)
            .with_address_msb(0x7f)
            .with_stride(256)
            .with_remote_peers(0b1011)
    }

    #[test]
    fn test_fresh_context_diff_flags_all_nonzero_fields() {
        let cache = CachedContext::new(0, 4);
        let diff = cache.diff(&required());
        assert_eq!(
            diff.fields,
            ContextFields::REDUCTION_OPCODE
                | ContextFields::SYNC_OBJECT_0
                | ContextFields::ADDRESS_MSB
                | ContextFields::STRIDE
                | ContextFields::REMOTE_RANKS
        );
        assert_eq!(diff.sync_slot, 0);
    }

    #[test]
    fn test_apply_then_diff_is_empty() {
        let mut cache = CachedContext::new(0, 4);
        let req = required();
        let diff = cache.diff(&req);
        cache.apply(&req, &diff).unwrap();
        let again = cache.diff(&req);
        assert!(again.is_empty(), "{:?}", again);
        assert_eq!(again.sync_slot, 0);
    }

    #[test]
    fn test_stride_only_change() {
        let mut cache = CachedContext::new(0, 4);
        let req = required();
        cache.apply(&req, &cache.diff(&req)).unwrap();
        let slot_before = cache.last_sync_slot();

        let next = req.with_stride(512);
        let diff = cache.diff(&next);
        assert_eq!(diff.fields, ContextFields::STRIDE);
        cache.apply(&next, &diff).unwrap();

        assert_eq!(cache.stride(), 512);
        assert_eq!(cache.reduction_opcode(), 0x21);
        assert_eq!(cache.last_sync_slot(), slot_before);
        assert!(cache.diff(&next).is_empty());
    }

    #[test]
    fn test_sync_object_ping_pong() {
        let mut cache = CachedContext::new(0, 1);
        let a = RequiredContext::new().with_sync_object(0xa0);
        let b = RequiredContext::new().with_sync_object(0xb0);
        let c = RequiredContext::new().with_sync_object(0xc0);

        let diff = cache.diff(&a);
        assert_eq!(diff.fields, ContextFields::SYNC_OBJECT_0);
        cache.apply(&a, &diff).unwrap();

        let diff = cache.diff(&b);
        assert_eq!(diff.fields, ContextFields::SYNC_OBJECT_1);
        assert_eq!(diff.sync_slot, 1);
        cache.apply(&b, &diff).unwrap();

        // a is still resident in slot 0
        let diff = cache.diff(&a);
        assert!(diff.is_empty());
        assert_eq!(diff.sync_slot, 0);
        cache.apply(&a, &diff).unwrap();
        assert_eq!(cache.last_sync_slot(), 0);

        // a new address must not clobber slot 0, which was used last
        let diff = cache.diff(&c);
        assert_eq!(diff.fields, ContextFields::SYNC_OBJECT_1);
        cache.apply(&c, &diff).unwrap();
        assert_eq!(cache.sync_object(0), Some(0xa0));
        assert_eq!(cache.sync_object(1), Some(0xc0));
    }

    #[test]
    fn test_rewriting_equal_value_is_invariant_violation() {
        let mut cache = CachedContext::new(3, 1);
        let req = required();
        let bogus = ContextDiff {
            fields: ContextFields::STRIDE,
            sync_slot: 1,
        };
        // stride differs but sync slot 1 does not hold the address
        assert!(cache.apply(&req, &bogus).unwrap_err().is_invariant());

        cache.apply(&req, &cache.diff(&req)).unwrap();
        let stale = ContextDiff {
            fields: ContextFields::STRIDE,
            sync_slot: 0,
        };
        let err = cache.apply(&req, &stale).unwrap_err();
        assert!(err.is_invariant());
        assert!(err.to_string().contains("current value"), "{}", err);
    }

    #[test]
    fn test_failed_apply_leaves_cache_untouched() {
        let mut cache = CachedContext::new(0, 1);
        let req = RequiredContext::new().with_stride(8);
        let diff = ContextDiff {
            fields: ContextFields::STRIDE | ContextFields::REDUCTION_OPCODE,
            sync_slot: 0,
        };
        let before = cache.clone();
        assert!(cache.apply(&req, &diff).is_err());
        assert_eq!(cache, before);
    }

    #[test]
    fn test_both_sync_slots_rejected() {
        let mut cache = CachedContext::new(0, 1);
        let req = RequiredContext::new().with_sync_object(1);
        let diff = ContextDiff {
            fields: ContextFields::SYNC_OBJECTS,
            sync_slot: 0,
        };
        assert!(cache.apply(&req, &diff).unwrap_err().is_invariant());
    }

    #[test]
    fn test_remote_devices() {
        let req = RequiredContext::new().with_remote_peers(0b1010_0001);
        let devices: Vec<_> = req.remote_devices().collect();
        assert_eq!(devices, vec![DeviceId(0), DeviceId(5), DeviceId(7)]);
    }

    #[test]
    fn test_unbind_clears_queue_pairs() {
        let mut cache = CachedContext::new(0, 2);
        cache.bind_comm(CommBinding {
            comm: CommId(1),
            slot: 4,
        });
        cache.bind_port(
            PortId(1),
            PortBinding {
                qpn: Some(9),
                peer: Some(DeviceId(2)),
            },
        );
        assert_eq!(
            cache.unbind_comm(),
            Some(CommBinding {
                comm: CommId(1),
                slot: 4
            })
        );
        let binding = cache.port_binding(PortId(1));
        assert_eq!(binding.qpn, None);
        assert_eq!(binding.peer, Some(DeviceId(2)));
        assert_eq!(cache.port_binding(PortId(9)), PortBinding::default());
    }
}
