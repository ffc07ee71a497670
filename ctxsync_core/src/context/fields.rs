//! Register fields of a collective context

use bitflags::bitflags;

bitflags! {
    /// Set of collective-context fields, one bit per register.
    ///
    /// Bit order is wire order: a context-update command carries the values
    /// of its flagged fields from the lowest bit upwards.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct ContextFields: u32 {
        const REDUCTION_OPCODE = 1 << 0;
        const SYNC_OBJECT_0    = 1 << 1;
        const SYNC_OBJECT_1    = 1 << 2;
        const ADDRESS_MSB      = 1 << 3;
        const STRIDE           = 1 << 4;
        const REMOTE_RANKS     = 1 << 5;
        /// Per-port queue-pair numbers of the bound communicator
        const QUEUE_PAIRS      = 1 << 6;
        /// Per-port remote device binding
        const PORT_PEERS       = 1 << 7;

        const SYNC_OBJECTS = Self::SYNC_OBJECT_0.bits() | Self::SYNC_OBJECT_1.bits();
        const BASE = Self::REDUCTION_OPCODE.bits()
            | Self::SYNC_OBJECTS.bits()
            | Self::ADDRESS_MSB.bits()
            | Self::STRIDE.bits()
            | Self::REMOTE_RANKS.bits();
        const PER_PORT = Self::QUEUE_PAIRS.bits() | Self::PORT_PEERS.bits();
    }
}

impl ContextFields {
    /// Field for one of the two sync-object slots
    #[inline]
    pub fn sync_object(slot: usize) -> Self {
        if slot == 0 {
            ContextFields::SYNC_OBJECT_0
        } else {
            ContextFields::SYNC_OBJECT_1
        }
    }

    /// Single-bit fields in wire order
    pub fn each(self) -> impl Iterator<Item = ContextFields> {
        let bits = self.bits();
        (0..u32::BITS)
            .map(|bit| 1u32 << bit)
            .filter(move |b| bits & b != 0)
            .map(ContextFields::from_bits_retain)
    }

    /// Number of single-bit fields set
    #[inline]
    pub fn count(self) -> u32 {
        self.bits().count_ones()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_groups_partition_all_fields() {
        assert_eq!(ContextFields::BASE | ContextFields::PER_PORT, ContextFields::all());
        assert!(ContextFields::BASE.intersection(ContextFields::PER_PORT).is_empty());
        assert_eq!(ContextFields::all().bits(), 0xff);
    }

    #[test]
    fn test_each_in_wire_order() {
        let fields = ContextFields::STRIDE | ContextFields::REDUCTION_OPCODE | ContextFields::QUEUE_PAIRS;
        let order: Vec<_> = fields.each().collect();
        assert_eq!(
            order,
            vec![
                ContextFields::REDUCTION_OPCODE,
                ContextFields::STRIDE,
                ContextFields::QUEUE_PAIRS
            ]
        );
        assert_eq!(fields.count(), 3);
    }

    #[test]
    fn test_sync_object_slot() {
        assert_eq!(ContextFields::sync_object(0), ContextFields::SYNC_OBJECT_0);
        assert_eq!(ContextFields::sync_object(1), ContextFields::SYNC_OBJECT_1);
    }
}
