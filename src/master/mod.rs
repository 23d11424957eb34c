// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Master run manager (spec §4.5): accepts worker connections, tracks
//! free/busy workers, accepts run batches from the driver, dispatches runs,
//! enforces per-run timeouts, handles retry and speculative duplication,
//! collects results, and reports per-run status back to the driver.
//!
//! The whole thing lives behind one single-threaded event loop (spec §5,
//! DESIGN NOTES: "do not fan out per-worker threads with locks on a shared
//! queue"). The public [Master] handle is just a mailbox: every mutation of
//! worker or run state happens on the loop's own thread.

mod conn;
mod mailbox;
pub mod run;
mod scheduler;
mod worker_session;

pub use mailbox::CompletedRun;
pub use run::{Run, RunState};
pub use worker_session::{HandshakeStage, WorkerSession, WorkerState};

use crate::config::RunManagerConfig;
use crate::error::{Fail, Result};
use crate::ids::{GroupId, RunId, WorkerId};
use crate::vector::NamedVector;
use mailbox::Command;
use crossbeam_channel::{bounded, Receiver, Sender};
use log::warn;
use mio::{Poll, PollOpt, Ready, Token};
use slab::Slab;
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

//==============================================================================
// Constants & Structures
//==============================================================================

/// Token reserved for the listening socket; worker slab key `k` always maps
/// to `Token(k + 1)`.
const LISTENER_TOKEN: Token = Token(0);

/// Upper bound on how long one `poll()` call blocks, so commands, deadline
/// checks and pings are serviced promptly even when no socket is ready.
const MAX_POLL_WAIT: Duration = Duration::from_millis(100);

/// The driver-facing handle. Cheap to clone; every clone shares the same
/// mailbox and background thread.
#[derive(Clone)]
pub struct Master {
    cmd_tx: Sender<Command>,
}

/// Owns everything the event loop touches. Never shared across threads.
struct EventLoop {
    config: RunManagerConfig,
    par_names: Arc<Vec<String>>,
    obs_names: Arc<Vec<String>>,
    listener: mio::net::TcpListener,
    poll: Poll,
    workers: Slab<WorkerSession>,
    ready_list: VecDeque<WorkerId>,
    queue: VecDeque<RunId>,
    runs: std::collections::HashMap<RunId, Run>,
    next_run_id: i32,
    newly_terminal: VecDeque<RunId>,
    cmd_rx: Receiver<Command>,
    shutting_down: bool,
    shutdown_reply: Option<Sender<()>>,
}

//==============================================================================
// Associate Functions
//==============================================================================

/// Associate functions for [Master].
impl Master {
    /// Binds the listening socket, negotiates nothing yet (schema is fixed
    /// up front from the already-loaded control file), and spawns the
    /// event-loop thread.
    pub fn spawn(addr: SocketAddr, par_names: Vec<String>, obs_names: Vec<String>, config: RunManagerConfig) -> Result<Self> {
        let listener = mio::net::TcpListener::bind(&addr).map_err(|e| Fail::Io { source: e })?;
        let poll = Poll::new().map_err(|e| Fail::Io { source: e })?;
        poll.register(&listener, LISTENER_TOKEN, Ready::readable(), PollOpt::level())
            .map_err(|e| Fail::Io { source: e })?;

        let (cmd_tx, cmd_rx) = crossbeam_channel::unbounded();
        let event_loop = EventLoop {
            config,
            par_names: Arc::new(par_names),
            obs_names: Arc::new(obs_names),
            listener,
            poll,
            workers: Slab::new(),
            ready_list: VecDeque::new(),
            queue: VecDeque::new(),
            runs: std::collections::HashMap::new(),
            next_run_id: 1,
            newly_terminal: VecDeque::new(),
            cmd_rx,
            shutting_down: false,
            shutdown_reply: None,
        };
        std::thread::Builder::new()
            .name("panther-master".into())
            .spawn(move || event_loop.run())
            .map_err(|e| Fail::Io { source: e })?;
        Ok(Self { cmd_tx })
    }

    pub fn submit(&self, parameters: NamedVector, group_id: GroupId) -> RunId {
        let (reply, rx) = bounded(1);
        self.send(Command::Submit { parameters, group_id, reply });
        rx.recv().expect("event loop dropped submit reply channel")
    }

    pub fn poll_complete(&self) -> Vec<CompletedRun> {
        let (reply, rx) = bounded(1);
        self.send(Command::PollComplete { reply });
        rx.recv().unwrap_or_default()
    }

    /// Blocks until every submitted run is terminal or `timeout` elapses.
    /// Returns `true` if every run reached a terminal state.
    pub fn wait_all(&self, timeout: Option<Duration>) -> bool {
        let start = Instant::now();
        loop {
            let (reply, rx) = bounded(1);
            self.send(Command::OutstandingCount { reply });
            let outstanding = rx.recv().unwrap_or(0);
            if outstanding == 0 {
                return true;
            }
            if let Some(t) = timeout {
                if start.elapsed() >= t {
                    return false;
                }
            }
            std::thread::sleep(Duration::from_millis(20));
        }
    }

    pub fn cancel(&self, run_id: RunId) {
        self.send(Command::Cancel { run_id });
    }

    pub fn num_failed(&self, run_id: RunId) -> u32 {
        let (reply, rx) = bounded(1);
        self.send(Command::NumFailed { run_id, reply });
        rx.recv().unwrap_or(0)
    }

    /// Sends `TERMINATE` to every worker, drains acknowledgements with a
    /// bounded wait, and closes all sockets (spec §4.5 "Shutdown").
    pub fn shutdown(&self) {
        let (reply, rx) = bounded(1);
        self.send(Command::Shutdown { reply });
        let _ = rx.recv();
    }

    fn send(&self, cmd: Command) {
        if self.cmd_tx.send(cmd).is_err() {
            warn!("master event loop is gone; command dropped");
        }
    }
}

//==============================================================================
// Trait Implementations
//==============================================================================

impl std::fmt::Debug for Master {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Master").finish()
    }
}
