//! Hardware capability descriptor
//!
//! One engine serves every accelerator family; what differs between
//! families (word size, record capacity, command budget, slot counts) is
//! described here and handed to the engine at construction time.

use serde::{Deserialize, Serialize};

/// Default number of hardware communicator-descriptor slots
pub const DEFAULT_CONTEXT_SLOT_CAPACITY: u32 = 11;

/// Default maximum size of one scheduler command, header included
pub const DEFAULT_MAX_COMMAND_DWORDS: u32 = 32;

/// Capability descriptor of the target device family
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HardwareParams {
    /// Size of one command word in bytes
    pub dword_bytes: u32,
    /// Number of NIC ports on the local device
    pub max_ports: u32,
    /// Payload words a single NIC record can carry
    pub max_payload_dwords_per_record: u32,
    /// Maximum scheduler command size in dwords, command header included
    pub max_command_dwords: u32,
    /// Dwords kept free at the end of every packed command for no-op padding
    pub nop_reserve_dwords: u32,
    /// Hardware communicator-descriptor slots shared by all contexts
    pub context_slot_capacity: u32,
    /// Entries added to the communicator table each time it grows
    pub lru_growth_increment: u32,
    /// Collective contexts reserved for the scale-up (intra-chassis) path
    pub scaleup_contexts: u32,
    /// Collective contexts reserved for the scale-out (inter-chassis) path
    pub scaleout_contexts: u32,
}

impl Default for HardwareParams {
    fn default() -> Self {
        Self {
            dword_bytes: 4,
            max_ports: 24,
            max_payload_dwords_per_record: 2,
            max_command_dwords: DEFAULT_MAX_COMMAND_DWORDS,
            nop_reserve_dwords: 2,
            context_slot_capacity: DEFAULT_CONTEXT_SLOT_CAPACITY,
            lru_growth_increment: 32,
            scaleup_contexts: 8,
            scaleout_contexts: 8,
        }
    }
}

impl HardwareParams {
    /// Total number of collective contexts on the device
    #[inline]
    pub fn total_contexts(&self) -> u32 {
        self.scaleup_contexts + self.scaleout_contexts
    }

    /// Largest NIC record in dwords (record header plus full payload)
    #[inline]
    pub fn max_record_dwords(&self) -> u32 {
        1 + self.max_payload_dwords_per_record
    }

    /// Dwords available for records in one command before the no-op reserve
    #[inline]
    pub fn command_body_budget(&self) -> u32 {
        self.max_command_dwords
            .saturating_sub(1)
            .saturating_sub(self.nop_reserve_dwords)
    }

    /// Whether `index` names a scale-up context
    #[inline]
    pub fn is_scaleup_context(&self, index: u32) -> bool {
        index < self.scaleup_contexts
    }

    /// Whether `index` names a scale-out context
    #[inline]
    pub fn is_scaleout_context(&self, index: u32) -> bool {
        index >= self.scaleup_contexts && index < self.total_contexts()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let params = HardwareParams::default();
        assert_eq!(params.context_slot_capacity, 11);
        assert_eq!(params.max_record_dwords(), 3);
        assert_eq!(params.command_body_budget(), 29);
        assert_eq!(params.total_contexts(), 16);
    }

    #[test]
    fn test_context_pools() {
        let params = HardwareParams::default();
        assert!(params.is_scaleup_context(0));
        assert!(params.is_scaleup_context(7));
        assert!(!params.is_scaleup_context(8));
        assert!(params.is_scaleout_context(8));
        assert!(params.is_scaleout_context(15));
        assert!(!params.is_scaleout_context(16));
    }

    #[test]
    fn test_budget_saturates() {
        let params = HardwareParams {
            max_command_dwords: 2,
            nop_reserve_dwords: 4,
            ..Default::default()
        };
        assert_eq!(params.command_body_budget(), 0);
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let params: HardwareParams = toml::from_str("context_slot_capacity = 4").unwrap();
        assert_eq!(params.context_slot_capacity, 4);
        assert_eq!(params.max_ports, 24);
    }
}
