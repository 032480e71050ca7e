// ABOUTME: Logical switchover sync between a live source and its replacement database
// ABOUTME: Trigger-captured changes are replayed in pipelined batches, then cut over once

pub mod error;
pub mod pipeline;
pub mod replicator;
pub mod sequence;
pub mod switchover;
pub mod table;

pub use error::{SyncError, SyncPhase};
pub use pipeline::{Batch, BatchError, BatchResults};
pub use replicator::{describe_tables, LogicalReplicator, SyncMode, SyncStats};
pub use sequence::{SequenceState, SequenceSync};
pub use switchover::{check_transition, SwitchoverGuard, SwitchoverPhase, SwitchoverState};
pub use table::{
    exec_delete_changes, rank_by_dependencies, PruneRange, RowWrite, TableDescriptor, TableSync,
};
