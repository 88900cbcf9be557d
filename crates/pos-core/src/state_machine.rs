use thiserror::Error;

use crate::{
    error::RequestErrorCategory,
    types::{Attempted, ResourcePhase, ResourceState},
};

/// Why a fetch result or transition was not applied.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransitionRejected {
    /// A newer fetch was issued after this one.
    #[error("fetch #{seq} is stale, latest issued is #{latest}")]
    Stale { seq: u64, latest: u64 },
    /// The fetch is current but no automatic retry is pending.
    #[error("fetch #{seq} cannot continue from phase {phase:?}")]
    NotRetrying { seq: u64, phase: ResourcePhase },
    /// The owning resource was torn down.
    #[error("resource state was torn down")]
    TornDown,
}

/// Fetch lifecycle for one resource key.
///
/// Every fetch is tagged with a monotonically increasing sequence number and
/// only the latest issued number may change state.
#[derive(Debug, Clone)]
pub struct ResourceStateMachine<T> {
    state: ResourceState<T>,
    latest_seq: u64,
    torn_down: bool,
}

impl<T: Clone> ResourceStateMachine<T> {
    pub fn new(max_retries: u32) -> Self {
        Self {
            state: ResourceState::idle(max_retries),
            latest_seq: 0,
            torn_down: false,
        }
    }

    pub fn state(&self) -> &ResourceState<T> {
        &self.state
    }

    pub fn latest_seq(&self) -> u64 {
        self.latest_seq
    }

    /// Start a fetch unless one is already outstanding.
    pub fn begin(&mut self) -> Option<u64> {
        if self.torn_down || self.state.is_in_flight() {
            return None;
        }
        self.state.phase = ResourcePhase::Loading;
        Some(self.issue())
    }

    /// Start a fetch with a fresh retry budget, superseding any outstanding one.
    pub fn begin_manual_retry(&mut self) -> Option<u64> {
        if self.torn_down {
            return None;
        }
        self.state.retry_count = 0;
        self.state.phase = ResourcePhase::Loading;
        Some(self.issue())
    }

    /// Issue the next automatic retry for the fetch tagged `seq`.
    pub fn continue_retry(&mut self, seq: u64) -> Result<u64, TransitionRejected> {
        self.ensure_current(seq)?;
        if self.state.phase != ResourcePhase::Retrying {
            return Err(TransitionRejected::NotRetrying {
                seq,
                phase: self.state.phase,
            });
        }
        Ok(self.issue())
    }

    /// Apply the settled outcome of the fetch tagged `seq`.
    pub fn apply(
        &mut self,
        seq: u64,
        attempted: Attempted<T>,
    ) -> Result<&ResourceState<T>, TransitionRejected> {
        self.ensure_current(seq)?;

        self.state.attempts_used = attempted.attempts_used;
        match attempted.outcome {
            Ok(data) => {
                self.state.data = Some(data);
                self.state.phase = ResourcePhase::Ready;
                self.state.retry_count = 0;
                self.state.last_error = None;
            }
            Err(err) => {
                match err.category {
                    RequestErrorCategory::NotFound => {
                        self.state.data = None;
                        self.state.phase = ResourcePhase::NotFound;
                        self.state.retry_count = 0;
                    }
                    RequestErrorCategory::Inactive => {
                        self.state.data = None;
                        self.state.phase = ResourcePhase::Inactive;
                        self.state.retry_count = 0;
                    }
                    RequestErrorCategory::Network | RequestErrorCategory::Server => {
                        if self.state.retry_count < self.state.max_retries {
                            self.state.retry_count += 1;
                            self.state.phase = ResourcePhase::Retrying;
                        } else {
                            self.state.phase = ResourcePhase::Failed;
                        }
                    }
                    RequestErrorCategory::Auth | RequestErrorCategory::Validation => {
                        self.state.phase = ResourcePhase::Failed;
                    }
                }
                self.state.last_error = Some(err);
            }
        }

        Ok(&self.state)
    }

    /// Drop all state; results of outstanding fetches are rejected afterwards.
    pub fn tear_down(&mut self) {
        self.torn_down = true;
        self.latest_seq += 1;
        self.state = ResourceState::idle(self.state.max_retries);
    }

    fn issue(&mut self) -> u64 {
        self.latest_seq += 1;
        self.latest_seq
    }

    fn ensure_current(&self, seq: u64) -> Result<(), TransitionRejected> {
        if self.torn_down {
            return Err(TransitionRejected::TornDown);
        }
        if seq != self.latest_seq {
            return Err(TransitionRejected::Stale {
                seq,
                latest: self.latest_seq,
            });
        }
        Ok(())
    }
}
