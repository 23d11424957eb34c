// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

use crate::ids::RunId;
use crate::master::conn::Conn;
use std::net::SocketAddr;
use std::time::Instant;

//==============================================================================
// Constants & Structures
//==============================================================================

/// A worker's connection state (spec §3). `Connected` is the brief window
/// between accept and a completed handshake; after that a worker is
/// `Ready`, `Busy`, being drained for shutdown, or declared `Lost`.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum WorkerState {
    Connected,
    Ready,
    Busy,
    Draining,
    Lost,
}

/// Where a worker's handshake currently stands (spec §6). The master walks
/// each worker through this in order before it ever enters the ready-list.
/// `PAR_NAMES`/`OBS_NAMES` carry no acknowledgement frame of their own — the
/// original agent only replies when it rejects them (`CORRUPT_MESG`) — so
/// there is no stage waiting on them specifically; the master sends both
/// immediately after `RUNDIR` and waits on whatever comes next.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum HandshakeStage {
    AwaitingRunDir,
    AwaitingLinpack,
    AwaitingReady,
    Done,
}

/// Per-connected-worker bookkeeping (spec §3). Holds the transport
/// connection plus everything the scheduler needs to know about it.
pub struct WorkerSession {
    pub conn: Conn,
    pub remote_endpoint: SocketAddr,
    pub state: WorkerState,
    pub handshake: HandshakeStage,
    pub current_run_id: Option<RunId>,
    pub last_ping_sent: Option<Instant>,
    pub last_activity: Instant,
    pub run_dir: Option<String>,
    pub kill_requested_at: Option<Instant>,
}

//==============================================================================
// Associate Functions
//==============================================================================

/// Associate functions for [WorkerSession].
impl WorkerSession {
    pub fn new(conn: Conn, remote_endpoint: SocketAddr) -> Self {
        Self {
            conn,
            remote_endpoint,
            state: WorkerState::Connected,
            handshake: HandshakeStage::AwaitingRunDir,
            current_run_id: None,
            last_ping_sent: None,
            last_activity: Instant::now(),
            run_dir: None,
            kill_requested_at: None,
        }
    }

    pub fn touch(&mut self) {
        self.last_activity = Instant::now();
    }
}
