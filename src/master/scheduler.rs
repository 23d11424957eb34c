// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

use super::conn::{Conn, PumpResult};
use super::mailbox::{Command, CompletedRun};
use super::run::{Run, RunState};
use super::worker_session::{HandshakeStage, WorkerSession, WorkerState};
use super::{EventLoop, LISTENER_TOKEN, MAX_POLL_WAIT};
use crate::codec::{encode_name_list, encode_vector, FrameType, NetPackage};
use crate::ids::{GroupId, RunId, WorkerId};
use crate::vector::NamedVector;
use log::{debug, info, warn};
use mio::{Events, PollOpt, Ready, Token};
use std::time::{Duration, Instant};

//==============================================================================
// Associate Functions
//==============================================================================

/// Associate functions for [EventLoop].
impl EventLoop {
    /// The event loop proper: one `poll()` per iteration, then command
    /// drain, deadline/ping sweeps, and dispatch, until shutdown completes.
    pub(super) fn run(mut self) {
        let mut events = Events::with_capacity(1024);
        loop {
            if let Err(e) = self.poll.poll(&mut events, Some(MAX_POLL_WAIT)) {
                warn!("poll() failed: {}", e);
                continue;
            }
            for event in events.iter() {
                if event.token() == LISTENER_TOKEN {
                    self.accept_new_connections();
                } else {
                    self.handle_worker_readiness(event.token(), event.readiness());
                }
            }
            self.drain_commands();
            self.check_pings();
            self.check_deadlines();
            self.dispatch();

            if self.shutting_down && self.workers.is_empty() {
                if let Some(reply) = self.shutdown_reply.take() {
                    let _ = reply.send(());
                }
                info!("master event loop exiting");
                return;
            }
        }
    }

    fn accept_new_connections(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((stream, remote)) => {
                    let conn = Conn::new(stream, self.config.max_payload_bytes);
                    let key = self.workers.insert(WorkerSession::new(conn, remote));
                    let token = Token(key + 1);
                    if let Err(e) = self.poll.register(&self.workers[key].conn.stream, token, Ready::readable() | Ready::writable(), PollOpt::level()) {
                        warn!("failed to register worker socket: {}", e);
                        self.workers.remove(key);
                        continue;
                    }
                    info!("worker connected from {}", remote);
                    self.send_to(WorkerId(key), NetPackage::new(FrameType::ReqRunDir, 0, 0));
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    warn!("accept() failed: {}", e);
                    break;
                }
            }
        }
    }

    fn handle_worker_readiness(&mut self, token: Token, readiness: Ready) {
        let key = token.0 - 1;
        if !self.workers.contains(key) {
            return;
        }
        if readiness.is_writable() {
            if let Err(e) = self.workers[key].conn.flush_write() {
                debug!("worker {} write failed: {}", key, e);
                self.worker_lost(WorkerId(key));
                return;
            }
        }
        if readiness.is_readable() {
            match self.workers[key].conn.pump_read() {
                Ok(PumpResult::Closed) => self.worker_lost(WorkerId(key)),
                Ok(PumpResult::Frames(frames)) => {
                    for frame in frames {
                        self.workers[key].touch();
                        self.handle_frame(WorkerId(key), frame);
                        if !self.workers.contains(key) {
                            break;
                        }
                    }
                }
                Err(e) => {
                    warn!("worker {} read failed: {}", key, e);
                    self.reply_corrupt_and_drop(WorkerId(key), &e.to_string());
                }
            }
        }
    }

    fn handle_frame(&mut self, worker_id: WorkerId, frame: NetPackage) {
        let stage = self.workers[worker_id.0].handshake;
        if stage != HandshakeStage::Done {
            self.handle_handshake_frame(worker_id, frame);
            return;
        }
        match frame.kind {
            FrameType::RunFinished => self.handle_run_finished(worker_id, frame),
            FrameType::RunFailed => self.handle_run_terminal(worker_id, frame.run_id, RunState::Failed),
            FrameType::RunKilled => self.handle_run_terminal(worker_id, frame.run_id, RunState::Killed),
            FrameType::Ping => { /* echoed pings outside a run are just liveness; nothing to do */ }
            FrameType::CorruptMesg => warn!("worker {} reported corrupt message: {}", worker_id.0, frame.desc),
            other => {
                warn!("worker {} sent unexpected frame {:?} outside handshake", worker_id.0, other);
            }
        }
    }

    fn handle_handshake_frame(&mut self, worker_id: WorkerId, frame: NetPackage) {
        let key = worker_id.0;
        match (self.workers[key].handshake, frame.kind) {
            (HandshakeStage::AwaitingRunDir, FrameType::RunDir) => {
                self.workers[key].run_dir = Some(frame.desc.clone());
                self.send_to(worker_id, NetPackage::with_payload(FrameType::ParNames, 0, 0, encode_name_list(&self.par_names).unwrap_or_default()));
                self.send_to(worker_id, NetPackage::with_payload(FrameType::ObsNames, 0, 0, encode_name_list(&self.obs_names).unwrap_or_default()));
                if self.config_req_linpack() {
                    self.workers[key].handshake = HandshakeStage::AwaitingLinpack;
                    self.send_to(worker_id, NetPackage::new(FrameType::ReqLinpack, 0, 0));
                } else {
                    self.workers[key].handshake = HandshakeStage::AwaitingReady;
                }
            }
            (HandshakeStage::AwaitingLinpack, FrameType::Linpack) => {
                // Informational only (spec §9 open question) — not placed on
                // the wire in a form the scheduler consumes.
                self.workers[key].handshake = HandshakeStage::AwaitingReady;
            }
            (HandshakeStage::AwaitingReady, FrameType::Ready) => {
                self.workers[key].handshake = HandshakeStage::Done;
                self.workers[key].state = WorkerState::Ready;
                self.ready_list.push_back(worker_id);
                info!("worker {} ready (run_dir={:?})", key, self.workers[key].run_dir);
            }
            (_, FrameType::CorruptMesg) => {
                warn!("worker {} rejected handshake frame: {}", key, frame.desc);
                self.worker_lost(worker_id);
            }
            (stage, kind) => {
                warn!("worker {} sent {:?} during handshake stage {:?}; protocol violation", key, kind, stage);
                self.reply_corrupt_and_drop(worker_id, "unexpected frame during handshake");
            }
        }
    }

    fn config_req_linpack(&self) -> bool {
        true
    }

    //--------------------------------------------------------------------
    // Dispatch
    //--------------------------------------------------------------------

    /// Pops a worker and a run off their FIFOs while both are non-empty and
    /// dispatches (spec §4.5 "Scheduling algorithm"). Also opportunistically
    /// speculates a dispatched-but-overdue run onto a free worker when the
    /// configuration allows it.
    pub(super) fn dispatch(&mut self) {
        while let (Some(&run_id), Some(_)) = (self.queue.front(), self.ready_list.front()) {
            let worker_id = self.ready_list.pop_front().unwrap();
            self.queue.pop_front();
            let run_id = run_id;
            self.dispatch_run_to(run_id, worker_id, false);
        }

        if self.config.speculative_dispatch {
            self.try_speculative_dispatch();
        }
    }

    fn try_speculative_dispatch(&mut self) {
        let Some(giveup_minutes) = self.config.overdue_giveup_minutes else { return };
        if self.ready_list.is_empty() {
            return;
        }
        let now = Instant::now();
        let overdue_run = self.runs.values().find(|r| {
            r.state == RunState::Dispatched
                && r.speculative_worker.is_none()
                && r.dispatch_time
                    .map(|start| now.saturating_duration_since(start).as_secs_f64() / 60.0 >= giveup_minutes)
                    .unwrap_or(false)
        });
        let Some(run) = overdue_run else { return };
        let run_id = run.run_id;
        let worker_id = self.ready_list.pop_front().unwrap();
        self.dispatch_run_to(run_id, worker_id, true);
    }

    fn dispatch_run_to(&mut self, run_id: RunId, worker_id: WorkerId, speculative: bool) {
        let Some(run) = self.runs.get(&run_id) else { return };
        let parameters = run.parameters.clone();
        let payload = encode_vector(parameters.values());
        self.send_to(worker_id, NetPackage::with_payload(FrameType::StartRun, run.group_id.0, run_id.0, payload));

        let key = worker_id.0;
        self.workers[key].state = WorkerState::Busy;
        self.workers[key].current_run_id = Some(run_id);

        let run = self.runs.get_mut(&run_id).unwrap();
        let now = Instant::now();
        if speculative {
            run.speculative_worker = Some(worker_id);
            info!("speculatively dispatched run {} to worker {}", run_id, key);
        } else {
            run.state = RunState::Dispatched;
            run.assigned_worker = Some(worker_id);
            run.dispatch_time = Some(now);
            run.deadline = self.config.per_run_timeout.map(|t| now + t);
            info!("dispatched run {} to worker {}", run_id, key);
        }
    }

    //--------------------------------------------------------------------
    // Run-terminal handling
    //--------------------------------------------------------------------

    fn handle_run_finished(&mut self, worker_id: WorkerId, frame: NetPackage) {
        let run_id = RunId(frame.run_id);
        let key = worker_id.0;
        if self.workers[key].current_run_id != Some(run_id) {
            warn!("worker {} sent RUN_FINISHED for run {} it wasn't assigned; discarding", key, run_id);
            return;
        }
        let par_count = self.par_names.len();
        let obs_count = self.obs_names.len();
        let (_params, offset) = match crate::codec::decode_vector(&frame.payload, 0, par_count) {
            Ok(v) => v,
            Err(e) => {
                warn!("worker {}: malformed RUN_FINISHED payload: {}", key, e);
                self.worker_free(worker_id);
                return;
            }
        };
        let (obs_values, offset) = match crate::codec::decode_vector(&frame.payload, offset, obs_count) {
            Ok(v) => v,
            Err(e) => {
                warn!("worker {}: malformed RUN_FINISHED observations: {}", key, e);
                self.worker_free(worker_id);
                return;
            }
        };
        let (duration_vec, _) = match crate::codec::decode_vector(&frame.payload, offset, 1) {
            Ok(v) => v,
            Err(e) => {
                warn!("worker {}: malformed RUN_FINISHED duration: {}", key, e);
                self.worker_free(worker_id);
                return;
            }
        };
        let observations = NamedVector::new(self.obs_names.clone(), obs_values).ok();

        if let Some(run) = self.runs.get_mut(&run_id) {
            if run.state == RunState::Dispatched {
                run.state = RunState::Finished;
                run.observations = observations;
                run.duration_seconds = duration_vec.first().copied();
                self.newly_terminal.push_back(run_id);
            }
        }
        self.clear_speculative_duplicate(run_id, worker_id);
        self.worker_free(worker_id);
    }

    fn handle_run_terminal(&mut self, worker_id: WorkerId, raw_run_id: i32, new_state: RunState) {
        let run_id = RunId(raw_run_id);
        let key = worker_id.0;
        if self.workers[key].current_run_id != Some(run_id) {
            warn!("worker {} sent terminal frame for run {} it wasn't assigned; discarding", key, run_id);
            return;
        }
        if let Some(run) = self.runs.get_mut(&run_id) {
            if run.state == RunState::Dispatched {
                match new_state {
                    RunState::Failed => self.fail_or_retry(run_id),
                    RunState::Killed => {
                        let run = self.runs.get_mut(&run_id).unwrap();
                        run.state = RunState::Killed;
                        run.assigned_worker = None;
                        self.newly_terminal.push_back(run_id);
                    }
                    _ => unreachable!("handle_run_terminal only called with Failed/Killed"),
                }
            }
        }
        self.clear_speculative_duplicate(run_id, worker_id);
        self.worker_free(worker_id);
    }

    /// Applies the retry rule shared by `RUN_FAILED` and a deadline-exceeded
    /// kill confirmation (spec §4.5).
    fn fail_or_retry(&mut self, run_id: RunId) {
        let Some(run) = self.runs.get_mut(&run_id) else { return };
        run.attempts += 1;
        run.assigned_worker = None;
        run.dispatch_time = None;
        run.deadline = None;
        if run.cancel_requested {
            run.state = RunState::Cancelled;
            self.newly_terminal.push_back(run_id);
        } else if run.attempts < self.config.max_run_fail {
            run.state = RunState::Queued;
            self.queue.push_back(run_id);
        } else {
            run.state = RunState::Failed;
            self.newly_terminal.push_back(run_id);
        }
    }

    fn clear_speculative_duplicate(&mut self, run_id: RunId, winner: WorkerId) {
        let Some(run) = self.runs.get_mut(&run_id) else { return };
        let speculative = run.speculative_worker.take();
        let assigned = run.assigned_worker;
        for loser in [assigned, speculative].into_iter().flatten() {
            if loser != winner && self.workers.contains(loser.0) {
                self.send_to(loser, NetPackage::new(FrameType::ReqKill, 0, run_id.0));
            }
        }
    }

    fn worker_free(&mut self, worker_id: WorkerId) {
        let key = worker_id.0;
        if !self.workers.contains(key) {
            return;
        }
        self.workers[key].current_run_id = None;
        if self.workers[key].state == WorkerState::Draining {
            self.send_to(worker_id, NetPackage::new(FrameType::Terminate, 0, 0));
            return;
        }
        self.workers[key].state = WorkerState::Ready;
        self.ready_list.push_back(worker_id);
    }

    fn worker_lost(&mut self, worker_id: WorkerId) {
        let key = worker_id.0;
        if !self.workers.contains(key) {
            return;
        }
        warn!("worker {} lost", key);
        if let Some(run_id) = self.workers[key].current_run_id {
            self.fail_or_retry(run_id);
        }
        self.ready_list.retain(|&w| w != worker_id);
        let _ = self.poll.deregister(&self.workers[key].conn.stream);
        self.workers.remove(key);
    }

    fn reply_corrupt_and_drop(&mut self, worker_id: WorkerId, detail: &str) {
        if let Ok(frame) = NetPackage::new(FrameType::CorruptMesg, 0, 0).with_desc(truncate_ascii(detail, 200)) {
            self.send_to(worker_id, frame);
        }
        self.worker_lost(worker_id);
    }

    fn send_to(&mut self, worker_id: WorkerId, frame: NetPackage) {
        let key = worker_id.0;
        if !self.workers.contains(key) {
            return;
        }
        if let Err(e) = self.workers[key].conn.queue_send(&frame) {
            warn!("send to worker {} failed: {}", key, e);
            self.worker_lost(worker_id);
        }
    }

    //--------------------------------------------------------------------
    // Heartbeats & deadlines
    //--------------------------------------------------------------------

    fn check_pings(&mut self) {
        let now = Instant::now();
        let keys: Vec<usize> = self.workers.iter().map(|(k, _)| k).collect();
        for key in keys {
            let worker_id = WorkerId(key);
            let is_busy = self.workers[key].state == WorkerState::Busy;
            if !is_busy {
                continue;
            }
            let due_for_ping = self.workers[key]
                .last_ping_sent
                .map(|t| now.saturating_duration_since(t) >= self.config.ping_interval)
                .unwrap_or(true)
                && now.saturating_duration_since(self.workers[key].last_activity) >= self.config.ping_interval;
            if due_for_ping {
                self.workers[key].last_ping_sent = Some(now);
                self.send_to(worker_id, NetPackage::new(FrameType::Ping, 0, 0));
            } else if let Some(sent_at) = self.workers[key].last_ping_sent {
                if now.saturating_duration_since(sent_at) > self.config.ping_grace {
                    warn!("worker {} missed ping grace window", key);
                    self.worker_lost(worker_id);
                }
            }
        }
    }

    fn check_deadlines(&mut self) {
        let now = Instant::now();
        let overdue: Vec<RunId> = self
            .runs
            .values()
            .filter(|r| r.state == RunState::Dispatched)
            .filter(|r| r.deadline.map(|d| now >= d).unwrap_or(false))
            .map(|r| r.run_id)
            .collect();
        for run_id in overdue {
            let Some(worker_id) = self.runs.get(&run_id).and_then(|r| r.assigned_worker) else { continue };
            let key = worker_id.0;
            if !self.workers.contains(key) {
                continue;
            }
            if self.workers[key].kill_requested_at.is_none() {
                info!("run {} exceeded deadline; requesting kill from worker {}", run_id, key);
                self.workers[key].kill_requested_at = Some(now);
                self.send_to(worker_id, NetPackage::new(FrameType::ReqKill, 0, run_id.0));
            } else if let Some(requested_at) = self.workers[key].kill_requested_at {
                if now.saturating_duration_since(requested_at) > self.config.kill_grace {
                    warn!("worker {} missed kill grace window after REQ_KILL; declaring lost", key);
                    self.worker_lost(worker_id);
                }
            }
        }
    }

    //--------------------------------------------------------------------
    // Driver mailbox
    //--------------------------------------------------------------------

    fn drain_commands(&mut self) {
        loop {
            match self.cmd_rx.try_recv() {
                Ok(cmd) => self.handle_command(cmd),
                Err(crossbeam_channel::TryRecvError::Empty) => break,
                Err(crossbeam_channel::TryRecvError::Disconnected) => {
                    self.shutting_down = true;
                    break;
                }
            }
        }
    }

    fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::Submit { parameters, group_id, reply } => {
                let run_id = RunId(self.next_run_id);
                self.next_run_id += 1;
                self.runs.insert(run_id, Run::new(run_id, group_id, parameters));
                self.queue.push_back(run_id);
                let _ = reply.send(run_id);
            }
            Command::PollComplete { reply } => {
                let mut completed = Vec::with_capacity(self.newly_terminal.len());
                while let Some(run_id) = self.newly_terminal.pop_front() {
                    if let Some(run) = self.runs.get(&run_id) {
                        completed.push(CompletedRun {
                            run_id,
                            state: run.state,
                            observations: run.observations.clone(),
                            duration_seconds: run.duration_seconds,
                        });
                    }
                }
                let _ = reply.send(completed);
            }
            Command::Cancel { run_id } => self.cancel_run(run_id),
            Command::NumFailed { run_id, reply } => {
                let attempts = self.runs.get(&run_id).map(|r| r.attempts).unwrap_or(0);
                let _ = reply.send(attempts);
            }
            Command::OutstandingCount { reply } => {
                let n = self.runs.values().filter(|r| !r.state.is_terminal()).count();
                let _ = reply.send(n);
            }
            Command::Shutdown { reply } => self.begin_shutdown(reply),
        }
    }

    /// Cancellation is idempotent by construction: a queued run moves to
    /// `Cancelled` in O(1); a dispatched run is kill-requested and only
    /// actually becomes `Cancelled` once the worker confirms the kill
    /// (`fail_or_retry` checks `cancel_requested`); calling this twice on
    /// an already-cancelled or already-kill-requested run is a no-op.
    fn cancel_run(&mut self, run_id: RunId) {
        let Some(run) = self.runs.get_mut(&run_id) else { return };
        if run.state.is_terminal() {
            return;
        }
        run.cancel_requested = true;
        match run.state {
            RunState::Queued => {
                run.state = RunState::Cancelled;
                self.queue.retain(|&r| r != run_id);
                self.newly_terminal.push_back(run_id);
            }
            RunState::Dispatched => {
                if let Some(worker_id) = run.assigned_worker {
                    self.send_to(worker_id, NetPackage::new(FrameType::ReqKill, 0, run_id.0));
                }
            }
            _ => {}
        }
    }

    fn begin_shutdown(&mut self, reply: crossbeam_channel::Sender<()>) {
        info!("shutdown requested; draining {} workers", self.workers.len());
        self.shutting_down = true;
        self.shutdown_reply = Some(reply);
        let keys: Vec<usize> = self.workers.iter().map(|(k, _)| k).collect();
        for key in keys {
            let worker_id = WorkerId(key);
            if self.workers[key].state == WorkerState::Busy {
                self.workers[key].state = WorkerState::Draining;
            } else {
                self.send_to(worker_id, NetPackage::new(FrameType::Terminate, 0, 0));
                self.workers[key].state = WorkerState::Draining;
            }
        }
        if self.workers.is_empty() {
            if let Some(reply) = self.shutdown_reply.take() {
                let _ = reply.send(());
            }
        }
    }
}

fn truncate_ascii(s: &str, max: usize) -> String {
    let ascii_only: String = s.chars().filter(|c| c.is_ascii()).collect();
    if ascii_only.len() <= max {
        ascii_only
    } else {
        ascii_only[..max].to_string()
    }
}
