//! # ctxsync types - leaf definitions with no engine dependencies
//!
//! This crate provides the canonical definitions shared by the engine and by
//! whatever loads its configuration:
//! - [`CommId`], [`DeviceId`], [`PortId`], [`PortMask`] - identifiers
//! - [`HardwareParams`] - capability descriptor of the target device family
//! - [`CommandSchema`] - bit layout of the scheduler command stream

pub mod ids;
pub mod params;
pub mod schema;

pub use ids::{CommId, DeviceId, PortId, PortMask, PortMaskIter};
pub use params::{HardwareParams, DEFAULT_CONTEXT_SLOT_CAPACITY, DEFAULT_MAX_COMMAND_DWORDS};
pub use schema::{
    BitField, CommandHeaderLayout, CommandSchema, ContextUpdateLayout, Opcodes, PortUpdateLayout,
    RecordHeaderLayout,
};
