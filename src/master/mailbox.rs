// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! The driver-facing mailbox (spec §5): a thread-safe channel through which
//! `submit`/`poll_complete`/`cancel`/`num_failed`/`shutdown` calls enter the
//! single-threaded event loop. All worker- and run-table mutation happens
//! only inside the loop that drains this channel; callers never touch the
//! tables directly.

use crate::ids::{GroupId, RunId};
use crate::master::run::RunState;
use crate::vector::NamedVector;
use crossbeam_channel::Sender;

//==============================================================================
// Constants & Structures
//==============================================================================

/// A run that reached a terminal state since the last `poll_complete` call.
#[derive(Clone, Debug)]
pub struct CompletedRun {
    pub run_id: RunId,
    pub state: RunState,
    pub observations: Option<NamedVector>,
    pub duration_seconds: Option<f64>,
}

pub enum Command {
    Submit {
        parameters: NamedVector,
        group_id: GroupId,
        reply: Sender<RunId>,
    },
    PollComplete {
        reply: Sender<Vec<CompletedRun>>,
    },
    Cancel {
        run_id: RunId,
    },
    NumFailed {
        run_id: RunId,
        reply: Sender<u32>,
    },
    OutstandingCount {
        reply: Sender<usize>,
    },
    Shutdown {
        reply: Sender<()>,
    },
}
