//! Collective context cache
//!
//! One [`CachedContext`] per hardware context index, mirroring what the
//! device holds, plus the [`ContextFields`] mask used to describe updates.

pub mod cache;
pub mod fields;

pub use cache::{
    CachedContext, CommBinding, ContextDiff, PortBinding, RequiredContext, SYNC_OBJECT_SLOTS,
};
pub use fields::ContextFields;
