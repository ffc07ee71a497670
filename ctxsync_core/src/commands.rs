//! Dword encoders for the scheduler command format
//!
//! All bit placement goes through the [`CommandSchema`]; a value that does
//! not fit its field means the configuration and the caller disagree about
//! the hardware, which is reported as an invariant violation.

use crate::context::ContextFields;
use crate::error::SyncResult;
use crate::sync_invariant;
use ctxsync_types::{BitField, CommandSchema, PortMask};

fn put(field: BitField, value: u64, name: &str) -> SyncResult<u32> {
    field.pack(value).ok_or_else(|| {
        sync_invariant!(
            "value {:#x} does not fit field {} ({} bits at {})",
            value,
            name,
            field.width,
            field.shift
        )
    })
}

/// Header of a NIC passthrough command carrying `body_dwords` record dwords
pub fn passthrough_header(schema: &CommandSchema, body_dwords: usize) -> SyncResult<u32> {
    Ok(put(schema.command.opcode, schema.opcodes.nic_passthrough as u64, "opcode")?
        | put(schema.command.body_dwords, body_dwords as u64, "body_dwords")?)
}

/// Header of a collective-context update command
pub fn context_update_header(
    schema: &CommandSchema,
    ctx_index: u32,
    fields: ContextFields,
    comm_slot: u32,
    sync_slot: usize,
) -> SyncResult<u32> {
    let layout = &schema.context_update;
    Ok(put(schema.command.opcode, schema.opcodes.context_update as u64, "opcode")?
        | put(layout.ctx_index, ctx_index as u64, "ctx_index")?
        | put(layout.field_mask, fields.bits() as u64, "field_mask")?
        | put(layout.comm_slot, comm_slot as u64, "comm_slot")?
        | put(layout.sync_slot, sync_slot as u64, "sync_slot")?)
}

/// Header word of a data record shared by the ports in `dup_mask`
pub fn record_header(schema: &CommandSchema, dup_mask: PortMask, payload_len: usize) -> SyncResult<u32> {
    let layout = &schema.record;
    Ok(put(layout.dup_mask, dup_mask.bits(), "dup_mask")?
        | put(layout.payload_len, payload_len as u64, "payload_len")?)
}

/// No-op record consuming `credits` on every port in `dup_mask`
pub fn nop_record(schema: &CommandSchema, dup_mask: PortMask, credits: u32) -> SyncResult<u32> {
    let layout = &schema.record;
    Ok(put(layout.dup_mask, dup_mask.bits(), "dup_mask")?
        | put(layout.nop, 1, "nop")?
        | put(layout.credits, credits as u64, "credits")?)
}

/// First payload word of a per-port context update
pub fn port_update_word(
    schema: &CommandSchema,
    ctx_index: u32,
    comm_slot: u32,
    fields: ContextFields,
) -> SyncResult<u32> {
    let layout = &schema.port_update;
    Ok(put(layout.ctx_index, ctx_index as u64, "ctx_index")?
        | put(layout.comm_slot, comm_slot as u64, "comm_slot")?
        | put(layout.field, fields.bits() as u64, "field")?)
}

/// Decoded record header, for tooling and tests
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordHeader {
    pub dup_mask: PortMask,
    pub payload_len: usize,
    pub nop: bool,
    pub credits: u32,
}

impl RecordHeader {
    pub fn decode(schema: &CommandSchema, word: u32) -> Self {
        let layout = &schema.record;
        Self {
            dup_mask: PortMask(layout.dup_mask.extract(word) as u64),
            payload_len: layout.payload_len.extract(word) as usize,
            nop: layout.nop.extract(word) != 0,
            credits: layout.credits.extract(word),
        }
    }

    /// Dwords the record occupies, header included
    pub fn dwords(&self) -> usize {
        if self.nop {
            1
        } else {
            1 + self.payload_len
        }
    }

    /// Credits the record charges to each port in its mask
    pub fn charged_credits(&self) -> u64 {
        if self.nop {
            self.credits as u64
        } else {
            self.dwords() as u64
        }
    }
}

/// Decoded context-update header, for tooling and tests
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContextUpdateHeader {
    pub opcode: u32,
    pub ctx_index: u32,
    pub fields: ContextFields,
    pub comm_slot: u32,
    pub sync_slot: usize,
}

impl ContextUpdateHeader {
    pub fn decode(schema: &CommandSchema, word: u32) -> Self {
        let layout = &schema.context_update;
        Self {
            opcode: schema.command.opcode.extract(word),
            ctx_index: layout.ctx_index.extract(word),
            fields: ContextFields::from_bits_retain(layout.field_mask.extract(word)),
            comm_slot: layout.comm_slot.extract(word),
            sync_slot: layout.sync_slot.extract(word) as usize,
        }
    }
}

/// Opcode of a command header
pub fn opcode_of(schema: &CommandSchema, word: u32) -> u32 {
    schema.command.opcode.extract(word)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_header_roundtrip() {
        let schema = CommandSchema::default();
        let word = record_header(&schema, PortMask(0b1010), 2).unwrap();
        let header = RecordHeader::decode(&schema, word);
        assert_eq!(header.dup_mask, PortMask(0b1010));
        assert_eq!(header.payload_len, 2);
        assert!(!header.nop);
        assert_eq!(header.dwords(), 3);
        assert_eq!(header.charged_credits(), 3);
    }

    #[test]
    fn test_nop_record() {
        let schema = CommandSchema::default();
        let header = RecordHeader::decode(&schema, nop_record(&schema, PortMask(1), 31).unwrap());
        assert!(header.nop);
        assert_eq!(header.credits, 31);
        assert_eq!(header.dwords(), 1);
        assert_eq!(header.charged_credits(), 31);
        assert!(nop_record(&schema, PortMask(1), 32).unwrap_err().is_invariant());
    }

    #[test]
    fn test_context_update_header() {
        let schema = CommandSchema::default();
        let fields = ContextFields::STRIDE | ContextFields::SYNC_OBJECT_1;
        let word = context_update_header(&schema, 9, fields, 10, 1).unwrap();
        let header = ContextUpdateHeader::decode(&schema, word);
        assert_eq!(header.opcode, schema.opcodes.context_update);
        assert_eq!(header.ctx_index, 9);
        assert_eq!(header.fields, fields);
        assert_eq!(header.comm_slot, 10);
        assert_eq!(header.sync_slot, 1);
    }

    #[test]
    fn test_mask_wider_than_field_is_rejected() {
        let schema = CommandSchema::default();
        let err = record_header(&schema, PortMask(1 << 30), 1).unwrap_err();
        assert!(err.to_string().contains("dup_mask"), "{}", err);
    }

    #[test]
    fn test_passthrough_header() {
        let schema = CommandSchema::default();
        let word = passthrough_header(&schema, 17).unwrap();
        assert_eq!(opcode_of(&schema, word), schema.opcodes.nic_passthrough);
        assert_eq!(schema.command.body_dwords.extract(word), 17);
    }
}
