//! # ctxsync core
//!
//! Host-side synchronization engine for the collective contexts of
//! clustered accelerator devices. It keeps a mirror of what every
//! on-device collective context holds and emits only the register writes
//! a collective step actually needs.
//!
//! - **Context cache**: per-index mirror with field-level diff and apply,
//!   including the double-buffered sync-object address
//! - **Communicator LRU**: maps many communicators onto a few hardware
//!   descriptor slots, evicting the least recently used
//! - **NIC aggregator**: deduplicates per-port writes with union-find,
//!   packs them into size-bounded commands and pads credits with no-ops
//! - **Context manager**: drives the three for one update at a time
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use ctxsync_core::{
//!     CommandStream, ContextManager, FixedQueuePairs, RequiredContext, StaticTopology,
//!     SyncConfig,
//! };
//! use ctxsync_types::{CommId, DeviceId, PortId};
//!
//! # fn main() -> ctxsync_core::SyncResult<()> {
//! let config = SyncConfig::load_or_default()?;
//! let topology = StaticTopology::builder()
//!     .scale_up(PortId(0), DeviceId(1))
//!     .build()?;
//! let queue_pairs = FixedQueuePairs::uniform(16);
//! let mut manager = ContextManager::from_config(&config, &topology, &queue_pairs)?;
//!
//! let mut stream = CommandStream::new();
//! manager.create_collective_contexts(&mut stream)?;
//! manager.register_comm(CommId(0))?;
//!
//! let required = RequiredContext::new()
//!     .with_reduction_opcode(1)
//!     .with_sync_object(0x4000)
//!     .with_remote_peers(1 << 1);
//! let outcome = manager.update_collective_context_scale_up(0, CommId(0), &required, &mut stream)?;
//! println!("slot {} fields {:?}", outcome.lru_slot, outcome.fields);
//! # Ok(())
//! # }
//! ```

pub mod aggregator;
pub mod commands;
pub mod config;
pub mod context;
pub mod error;
pub mod lru;
pub mod manager;
pub mod stream;
pub mod topology;

pub use aggregator::{AggregatorStats, FlushSummary, NicAggregator, NicRecord};
pub use config::SyncConfig;
pub use context::{CachedContext, ContextDiff, ContextFields, RequiredContext};
pub use error::{SyncError, SyncResult};
pub use lru::{CommLru, LruOutcome, LruStats, MAX_COMM_ID};
pub use manager::{
    ContextManager, ContextState, ContextUpdateOutcome, ContextUpdatePlan, PortClass, PortUpdate,
};
pub use stream::{CommandSink, CommandStream};
pub use topology::{FixedQueuePairs, PortTopology, QueuePairProvider, StaticTopology};

pub use ctxsync_types as types;
