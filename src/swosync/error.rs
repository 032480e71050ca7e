// ABOUTME: Phase-tagged errors returned by sync passes
// ABOUTME: Distinguishes retryable incremental failures from fatal cutover failures

use std::fmt;

use super::switchover::SwitchoverPhase;

/// Pipeline step a sync pass was in when it failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SyncPhase {
    Begin,
    ScanSequences,
    ScanChanges,
    ReadRows,
    ApplyChanges,
    CommitRead,
    StateTransition,
    DeleteChanges,
}

impl SyncPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncPhase::Begin => "begin",
            SyncPhase::ScanSequences => "scan-sequences",
            SyncPhase::ScanChanges => "scan-changes",
            SyncPhase::ReadRows => "read-rows",
            SyncPhase::ApplyChanges => "apply-changes",
            SyncPhase::CommitRead => "commit-read",
            SyncPhase::StateTransition => "state-transition",
            SyncPhase::DeleteChanges => "delete-changes",
        }
    }
}

impl fmt::Display for SyncPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("{phase}: {source}")]
    Phase {
        phase: SyncPhase,
        fatal: bool,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync + 'static>,
    },

    #[error("begin: switchover is {state}, expected in_progress")]
    NotInProgress { state: SwitchoverPhase, fatal: bool },

    #[error("state-transition: switchover_state was not in_progress, cutover rolled back")]
    StateConflict,

    #[error("{phase}: sync pass timed out")]
    Timeout { phase: SyncPhase, fatal: bool },
}

impl SyncError {
    pub(crate) fn phase(phase: SyncPhase, fatal: bool, err: anyhow::Error) -> Self {
        SyncError::Phase {
            phase,
            fatal,
            source: err.into(),
        }
    }

    /// Pipeline step the failure belongs to.
    pub fn sync_phase(&self) -> SyncPhase {
        match self {
            SyncError::Phase { phase, .. } | SyncError::Timeout { phase, .. } => *phase,
            SyncError::NotInProgress { .. } => SyncPhase::Begin,
            SyncError::StateConflict => SyncPhase::StateTransition,
        }
    }

    /// True when the failure must not be retried automatically and the
    /// operator has to inspect `switchover_state` before doing anything else.
    pub fn is_fatal(&self) -> bool {
        match self {
            SyncError::Phase { fatal, .. }
            | SyncError::NotInProgress { fatal, .. }
            | SyncError::Timeout { fatal, .. } => *fatal,
            SyncError::StateConflict => true,
        }
    }
}
