//! Pool states and their legal transitions.

use serde::{Deserialize, Serialize};

use super::ProcessorError;

/// State of a cloud processor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PoolState {
    Init,
    SendStartingContract,
    DownloadStartingContract,
    StartExec,
    Finished,
    Failed,
}

impl PoolState {
    /// Every state, in ordinal order.
    pub const ALL: [PoolState; 6] = [
        PoolState::Init,
        PoolState::SendStartingContract,
        PoolState::DownloadStartingContract,
        PoolState::StartExec,
        PoolState::Finished,
        PoolState::Failed,
    ];

    pub fn ordinal(self) -> usize {
        self as usize
    }

    pub fn from_ordinal(ordinal: usize) -> Option<Self> {
        Self::ALL.get(ordinal).copied()
    }

    pub fn name(self) -> &'static str {
        match self {
            PoolState::Init => "INIT",
            PoolState::SendStartingContract => "SEND_STARTING_CONTRACT",
            PoolState::DownloadStartingContract => "DOWNLOAD_STARTING_CONTRACT",
            PoolState::StartExec => "START_EXEC",
            PoolState::Finished => "FINISHED",
            PoolState::Failed => "FAILED",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|s| s.name() == name)
    }

    /// Declared successor states.
    pub fn successors(self) -> &'static [PoolState] {
        use PoolState::*;
        match self {
            Init => &[SendStartingContract, DownloadStartingContract, Failed],
            SendStartingContract | DownloadStartingContract => &[StartExec, Failed],
            StartExec => &[Finished, Failed],
            Finished | Failed => &[],
        }
    }

    pub fn can_transition_to(self, next: PoolState) -> bool {
        self.successors().contains(&next)
    }

    pub fn is_terminal(self) -> bool {
        self.successors().is_empty()
    }
}

impl std::fmt::Display for PoolState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Current state plus transition checking.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolStateMachine {
    current: PoolState,
}

impl Default for PoolStateMachine {
    fn default() -> Self {
        Self {
            current: PoolState::Init,
        }
    }
}

impl PoolStateMachine {
    pub fn current(&self) -> PoolState {
        self.current
    }

    /// Move to `next` if it is a declared successor.
    pub fn transition(&mut self, next: PoolState) -> Result<PoolState, ProcessorError> {
        if !self.current.can_transition_to(next) {
            return Err(ProcessorError::IllegalTransition {
                from: self.current,
                to: next,
            });
        }
        let previous = self.current;
        self.current = next;
        Ok(previous)
    }
}
