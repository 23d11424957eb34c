// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

use crate::ids::{GroupId, RunId, WorkerId};
use crate::vector::NamedVector;
use std::time::Instant;

//==============================================================================
// Constants & Structures
//==============================================================================

/// A run's lifecycle state (spec §3). `Queued` and `Dispatched` are the only
/// non-terminal states; the rest are terminal.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RunState {
    Queued,
    Dispatched,
    Finished,
    Failed,
    Killed,
    Cancelled,
}

//==============================================================================
// Associate Functions
//==============================================================================

/// Associate functions for [RunState].
impl RunState {
    pub fn is_terminal(self) -> bool {
        matches!(self, RunState::Finished | RunState::Failed | RunState::Killed | RunState::Cancelled)
    }
}

/// One invariant run record (spec §3). Parameters are frozen at creation;
/// everything else mutates as the run moves through the scheduler.
#[derive(Clone, Debug)]
pub struct Run {
    pub run_id: RunId,
    pub group_id: GroupId,
    pub parameters: NamedVector,
    pub state: RunState,
    pub attempts: u32,
    pub observations: Option<NamedVector>,
    pub duration_seconds: Option<f64>,
    pub assigned_worker: Option<WorkerId>,
    pub dispatch_time: Option<Instant>,
    pub deadline: Option<Instant>,
    /// Set once `cancel()` has been requested, so a later deadline-exceeded
    /// or worker-loss event doesn't re-requeue a run the driver gave up on.
    pub cancel_requested: bool,
    /// Worker holding a speculative duplicate dispatch of this run, if any
    /// (spec §4.5 "Speculative dispatch").
    pub speculative_worker: Option<WorkerId>,
}

/// Associate functions for [Run].
impl Run {
    pub fn new(run_id: RunId, group_id: GroupId, parameters: NamedVector) -> Self {
        Self {
            run_id,
            group_id,
            parameters,
            state: RunState::Queued,
            attempts: 0,
            observations: None,
            duration_seconds: None,
            assigned_worker: None,
            dispatch_time: None,
            deadline: None,
            cancel_requested: false,
            speculative_worker: None,
        }
    }
}
