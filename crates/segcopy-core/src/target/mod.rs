//! Replica-side segment copy
//!
//! The [`SegmentsCopyTargetService`] answers the requests of every primary
//! and hands them to the [`LocalTargetShardCopyState`] of the addressed
//! shard.

mod local_state;
mod service;

pub use local_state::{CopyPhase, LocalTargetShardCopyState, ReceiverStats};
pub use service::SegmentsCopyTargetService;
