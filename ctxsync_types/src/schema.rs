//! Command-stream wire schema
//!
//! Every word the engine emits is a 32-bit dword assembled from named bit
//! fields. The exact positions and widths belong to the firmware of the
//! target family, so they are data, not code: a [`CommandSchema`] is loaded
//! alongside [`HardwareParams`](crate::HardwareParams) and the encoder only
//! ever goes through [`BitField::pack`].
//!
//! # Default layout
//!
//! ```text
//! command header    [31:27 opcode][15:0 body_dwords]
//! context update    [31:27 opcode][22 sync_slot][21:16 comm_slot][15:8 field_mask][7:0 ctx_index]
//! record header     [31:27 credits][26 nop][25:24 payload_len][23:0 dup_mask]
//! port update word  [21:14 field][13:8 comm_slot][7:0 ctx_index]
//! ```

use serde::{Deserialize, Serialize};

/// A contiguous run of bits inside a dword
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BitField {
    pub shift: u8,
    pub width: u8,
}

impl BitField {
    pub const fn new(shift: u8, width: u8) -> Self {
        Self { shift, width }
    }

    /// Largest value the field can hold
    #[inline]
    pub const fn max_value(&self) -> u32 {
        if self.width >= 32 {
            u32::MAX
        } else {
            (1u32 << self.width) - 1
        }
    }

    /// Whether the field lies entirely within a 32-bit word
    #[inline]
    pub const fn fits_in_dword(&self) -> bool {
        self.width > 0 && (self.shift as u32) + (self.width as u32) <= 32
    }

    /// Bits occupied by the field within the word
    #[inline]
    pub const fn word_mask(&self) -> u32 {
        if !self.fits_in_dword() {
            0
        } else {
            self.max_value() << self.shift
        }
    }

    #[inline]
    pub const fn overlaps(&self, other: &BitField) -> bool {
        self.word_mask() & other.word_mask() != 0
    }

    /// Place `value` into the field, or `None` if it does not fit
    #[inline]
    pub fn pack(&self, value: u64) -> Option<u32> {
        if !self.fits_in_dword() || value > self.max_value() as u64 {
            return None;
        }
        Some((value as u32) << self.shift)
    }

    /// Read the field back out of `word`
    #[inline]
    pub const fn extract(&self, word: u32) -> u32 {
        (word & self.word_mask()) >> self.shift
    }
}

/// Header shared by every scheduler command
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CommandHeaderLayout {
    pub opcode: BitField,
    /// Number of dwords following the header (NIC passthrough commands)
    pub body_dwords: BitField,
}

impl Default for CommandHeaderLayout {
    fn default() -> Self {
        Self {
            opcode: BitField::new(27, 5),
            body_dwords: BitField::new(0, 16),
        }
    }
}

/// Header of a collective-context update command
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContextUpdateLayout {
    pub ctx_index: BitField,
    pub field_mask: BitField,
    pub comm_slot: BitField,
    pub sync_slot: BitField,
}

impl Default for ContextUpdateLayout {
    fn default() -> Self {
        Self {
            ctx_index: BitField::new(0, 8),
            field_mask: BitField::new(8, 8),
            comm_slot: BitField::new(16, 6),
            sync_slot: BitField::new(22, 1),
        }
    }
}

/// Header word of one NIC record inside a passthrough command
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecordHeaderLayout {
    pub dup_mask: BitField,
    pub payload_len: BitField,
    pub nop: BitField,
    /// Credits consumed by a no-op record
    pub credits: BitField,
}

impl Default for RecordHeaderLayout {
    fn default() -> Self {
        Self {
            dup_mask: BitField::new(0, 24),
            payload_len: BitField::new(24, 2),
            nop: BitField::new(26, 1),
            credits: BitField::new(27, 5),
        }
    }
}

/// First payload word of a per-port context update
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PortUpdateLayout {
    pub ctx_index: BitField,
    pub comm_slot: BitField,
    pub field: BitField,
}

impl Default for PortUpdateLayout {
    fn default() -> Self {
        Self {
            ctx_index: BitField::new(0, 8),
            comm_slot: BitField::new(8, 6),
            field: BitField::new(14, 8),
        }
    }
}

/// Scheduler opcodes understood by the firmware
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Opcodes {
    pub context_update: u32,
    pub nic_passthrough: u32,
}

impl Default for Opcodes {
    fn default() -> Self {
        Self {
            context_update: 0x0b,
            nic_passthrough: 0x0c,
        }
    }
}

/// Complete binary schema of the command stream
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CommandSchema {
    pub command: CommandHeaderLayout,
    pub context_update: ContextUpdateLayout,
    pub record: RecordHeaderLayout,
    pub port_update: PortUpdateLayout,
    pub opcodes: Opcodes,
}

impl CommandSchema {
    /// Named field groups that share one dword, for layout validation
    pub fn word_layouts(&self) -> Vec<(&'static str, Vec<(&'static str, BitField)>)> {
        vec![
            (
                "command",
                vec![
                    ("opcode", self.command.opcode),
                    ("body_dwords", self.command.body_dwords),
                ],
            ),
            (
                "context_update",
                vec![
                    ("opcode", self.command.opcode),
                    ("ctx_index", self.context_update.ctx_index),
                    ("field_mask", self.context_update.field_mask),
                    ("comm_slot", self.context_update.comm_slot),
                    ("sync_slot", self.context_update.sync_slot),
                ],
            ),
            (
                "record",
                vec![
                    ("dup_mask", self.record.dup_mask),
                    ("payload_len", self.record.payload_len),
                    ("nop", self.record.nop),
                    ("credits", self.record.credits),
                ],
            ),
            (
                "port_update",
                vec![
                    ("ctx_index", self.port_update.ctx_index),
                    ("comm_slot", self.port_update.comm_slot),
                    ("field", self.port_update.field),
                ],
            ),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pack_and_extract() {
        let field = BitField::new(8, 4);
        assert_eq!(field.max_value(), 0xf);
        assert_eq!(field.pack(0xa), Some(0xa00));
        assert_eq!(field.pack(0x10), None);
        assert_eq!(field.extract(0xfa5f), 0xa);
    }

    #[test]
    fn test_full_width_field() {
        let field = BitField::new(0, 32);
        assert!(field.fits_in_dword());
        assert_eq!(field.pack(u32::MAX as u64), Some(u32::MAX));
        assert_eq!(field.pack(u32::MAX as u64 + 1), None);
    }

    #[test]
    fn test_out_of_word_field_never_packs() {
        let field = BitField::new(30, 4);
        assert!(!field.fits_in_dword());
        assert_eq!(field.pack(0), None);
        assert_eq!(field.word_mask(), 0);
    }

    #[test]
    fn test_default_layouts_do_not_overlap() {
        let schema = CommandSchema::default();
        for (word, fields) in schema.word_layouts() {
            for (i, (name_a, a)) in fields.iter().enumerate() {
                assert!(a.fits_in_dword(), "{}.{} leaves the dword", word, name_a);
                for (name_b, b) in &fields[i + 1..] {
                    assert!(!a.overlaps(b), "{}.{} overlaps {}", word, name_a, name_b);
                }
            }
        }
    }
}
