// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Worker agent (spec §4.4): connects to the master, negotiates the
//! parameter/observation name schema, then alternates between `READY` and
//! `RUNNING` until told to terminate.
//!
//! State machine: `DISCONNECTED → CONNECTING → SCHEMA_WAIT → READY ↔
//! RUNNING → (READY | TERMINATING)`. A run executes on its own thread so the
//! message loop stays responsive to `PING`/`REQ_KILL`/`TERMINATE` while the
//! model is running (spec §5 "two concurrent activities"); the two threads
//! share nothing but an atomic cancellation flag, a finished flag, and the
//! channel the run thread uses to hand back its one [`RunOutcome`].

use crate::codec::{decode_name_list, decode_vector, encode_vector, FrameType, NetPackage};
use crate::error::{Fail, Result};
use crate::model::{ModelInterface, RunOutcome};
use crate::transport::{ReceiveOutcome, Session};
use crate::vector::NamedVector;
use crossbeam_channel::bounded;
use log::{debug, info, warn};
use std::net::{SocketAddr, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

//==============================================================================
// Constants & Structures
//==============================================================================

/// How often the agent's main loop polls the socket while a run is active
/// (spec §4.4 step 5).
const RUN_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Tunables for the connect/reconnect and transport layers (spec §4.4 step 1,
/// §5).
#[derive(Clone, Debug)]
pub struct AgentConfig {
    pub master_addr: SocketAddr,
    pub initial_poll_interval: Duration,
    pub max_poll_interval: Duration,
    pub max_recv_fails: u32,
    pub max_send_fails: u32,
    pub max_payload_bytes: usize,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            master_addr: "127.0.0.1:4004".parse().expect("static address"),
            initial_poll_interval: Duration::from_millis(500),
            max_poll_interval: Duration::from_secs(30),
            max_recv_fails: 3,
            max_send_fails: 3,
            max_payload_bytes: 64 * 1024 * 1024,
        }
    }
}

/// Why a session with the master ended.
enum SessionEnd {
    /// `TERMINATE` was received; the agent process should exit.
    Terminated,
    /// The connection dropped (or a protocol violation forced it closed);
    /// reconnect and renegotiate.
    Disconnected,
}

/// Outcome of one `run_one` call: either the run reported a terminal status
/// and the agent should loop back to `READY`-wait on the same session (spec
/// §4.4 step 7), or the session itself ended.
enum RunEnd {
    Continue,
    Terminated,
    Disconnected,
}

//==============================================================================
// Associate Functions
//==============================================================================

/// Runs the worker agent until the master tells it to terminate. Never
/// returns `Ok` except on a clean `TERMINATE`.
pub fn run(config: &AgentConfig, model: &ModelInterface) -> Result<()> {
    loop {
        let session = connect_with_backoff(config)?;
        match serve_session(session, config, model) {
            Ok(SessionEnd::Terminated) => {
                info!("received TERMINATE; agent exiting");
                return Ok(());
            }
            Ok(SessionEnd::Disconnected) => {
                warn!("lost connection to master; will reconnect");
            }
            Err(e) => {
                warn!("session ended in error: {}; will reconnect", e);
            }
        }
    }
}

/// Connects to the master, retrying with exponential-bounded backoff
/// (spec §4.4 step 1).
fn connect_with_backoff(config: &AgentConfig) -> Result<Session> {
    let mut wait = config.initial_poll_interval;
    loop {
        match TcpStream::connect(config.master_addr) {
            Ok(stream) => {
                info!("connected to master at {}", config.master_addr);
                return Session::new(stream, config.max_recv_fails, config.max_send_fails, config.max_payload_bytes);
            }
            Err(e) => {
                debug!("connect to {} failed: {}; retrying in {:?}", config.master_addr, e, wait);
                thread::sleep(wait);
                wait = std::cmp::min(wait * 2, config.max_poll_interval);
            }
        }
    }
}

/// Runs the handshake, then the `READY ↔ RUNNING` loop, until the
/// connection ends or the master terminates the agent.
fn serve_session(mut session: Session, _config: &AgentConfig, model: &ModelInterface) -> Result<SessionEnd> {
    let (par_names, obs_names) = match negotiate_schema(&mut session)? {
        Some(names) => names,
        None => return Ok(SessionEnd::Disconnected),
    };

    session.send(&NetPackage::new(FrameType::Ready, 0, 0))?;
    info!("handshake complete; {} parameters, {} observations", par_names.len(), obs_names.len());

    loop {
        match session.receive(Some(RUN_POLL_INTERVAL)) {
            ReceiveOutcome::Timeout => continue,
            ReceiveOutcome::Message(frame) => match frame.kind {
                FrameType::StartRun => {
                    let params = decode_parameters(&frame.payload, &par_names)?;
                    match run_one(&mut session, model, &obs_names, frame.group_id, frame.run_id, params)? {
                        RunEnd::Continue => continue,
                        RunEnd::Terminated => return Ok(SessionEnd::Terminated),
                        RunEnd::Disconnected => return Ok(SessionEnd::Disconnected),
                    }
                }
                FrameType::Ping => session.send(&NetPackage::new(FrameType::Ping, 0, 0))?,
                FrameType::Terminate => {
                    let _ = session.send(&NetPackage::new(FrameType::Terminate, 0, 0));
                    return Ok(SessionEnd::Terminated);
                }
                other => {
                    warn!("protocol violation: {:?} received while READY", other);
                    return Err(Fail::ProtocolViolation {
                        detail: format!("unexpected frame {:?} outside a run", other),
                    });
                }
            },
            ReceiveOutcome::Corrupt(e) => {
                warn!("corrupt frame from master: {}", e);
                let _ = session.send(&NetPackage::new(FrameType::CorruptMesg, 0, 0));
                return Ok(SessionEnd::Disconnected);
            }
            ReceiveOutcome::Lost => return Ok(SessionEnd::Disconnected),
        }
    }
}

/// Walks the handshake (spec §4.4 steps 2-4): `REQ_RUNDIR` →reply `RUNDIR`,
/// then `PAR_NAMES`/`OBS_NAMES` in either order, plus a `REQ_LINPACK` the
/// master always sends before it will accept `READY` (the master's
/// `AwaitingLinpack` handshake stage gates on it; see `scheduler.rs`'s
/// `config_req_linpack`). The loop only returns once all three have been
/// seen and answered — stopping the instant both name lists are known would
/// strand an already-queued `REQ_LINPACK` unread, which the `READY ↔
/// RUNNING` loop would then choke on as a protocol violation. Returns `None`
/// if the connection drops mid-handshake.
fn negotiate_schema(session: &mut Session) -> Result<Option<(Arc<Vec<String>>, Arc<Vec<String>>)>> {
    let mut par_names: Option<Arc<Vec<String>>> = None;
    let mut obs_names: Option<Arc<Vec<String>>> = None;
    let mut linpack_done = false;

    loop {
        if par_names.is_some() && obs_names.is_some() && linpack_done {
            return Ok(Some((par_names.unwrap(), obs_names.unwrap())));
        }
        match session.receive(None) {
            ReceiveOutcome::Message(frame) => match frame.kind {
                FrameType::ReqRunDir => {
                    let cwd = std::env::current_dir().map_err(|e| Fail::Io { source: e })?;
                    let desc = cwd.to_string_lossy().into_owned();
                    session.send(&NetPackage::new(FrameType::RunDir, 0, 0).with_desc(desc)?)?;
                }
                FrameType::ParNames => {
                    par_names = Some(Arc::new(decode_name_list(&frame.payload)?));
                }
                FrameType::ObsNames => {
                    obs_names = Some(Arc::new(decode_name_list(&frame.payload)?));
                }
                FrameType::ReqLinpack => {
                    run_linpack_benchmark();
                    session.send(&NetPackage::new(FrameType::Linpack, 0, 0))?;
                    linpack_done = true;
                }
                other => {
                    warn!("unexpected frame {:?} during handshake", other);
                    let _ = session.send(&NetPackage::new(FrameType::CorruptMesg, 0, 0));
                    return Ok(None);
                }
            },
            ReceiveOutcome::Corrupt(e) => {
                warn!("corrupt frame during handshake: {}", e);
                let _ = session.send(&NetPackage::new(FrameType::CorruptMesg, 0, 0));
                return Ok(None);
            }
            ReceiveOutcome::Lost => return Ok(None),
            ReceiveOutcome::Timeout => unreachable!("negotiate_schema blocks without a timeout"),
        }
    }
}

/// A small fixed-size matrix factorization, run purely to exercise the CPU
/// the way the original LINPACK-derived benchmark did. Its result is
/// logged, never placed on the wire (spec §9 open question; SPEC_FULL §E).
fn run_linpack_benchmark() {
    const N: usize = 32;
    let mut a = [[0.0_f64; N]; N];
    for (i, row) in a.iter_mut().enumerate() {
        for (j, cell) in row.iter_mut().enumerate() {
            *cell = ((i * N + j) % 97) as f64 / 97.0 + if i == j { 10.0 } else { 0.0 };
        }
    }
    let start = Instant::now();
    for k in 0..N - 1 {
        for i in k + 1..N {
            let factor = a[i][k] / a[k][k];
            for j in k..N {
                a[i][j] -= factor * a[k][j];
            }
        }
    }
    let trace: f64 = (0..N).map(|i| a[i][i]).sum();
    debug!("linpack benchmark: trace={:.6}, elapsed={:?}", trace, start.elapsed());
}

fn decode_parameters(payload: &[u8], par_names: &Arc<Vec<String>>) -> Result<NamedVector> {
    let (values, _) = decode_vector(payload, 0, par_names.len())?;
    NamedVector::new(par_names.clone(), values)
}

/// Runs one model evaluation on its own thread while the message loop keeps
/// polling the socket (spec §4.4 step 5, §5). Returns once the run has
/// reported a terminal status and (if not terminating) sent `READY`.
fn run_one(
    session: &mut Session,
    model: &ModelInterface,
    obs_names: &Arc<Vec<String>>,
    group_id: i32,
    run_id: i32,
    parameters: NamedVector,
) -> Result<RunEnd> {
    let cancel = Arc::new(AtomicBool::new(false));
    let (result_tx, result_rx) = bounded(1);
    let started_at = Instant::now();

    let thread_model = model.clone();
    let thread_obs_names = obs_names.clone();
    let thread_params = parameters.clone();
    let thread_cancel = cancel.clone();
    let handle = thread::Builder::new()
        .name(format!("panther-run-{}", run_id))
        .spawn(move || {
            let outcome = thread_model.run(&thread_obs_names, &thread_params, &thread_cancel);
            let _ = result_tx.send(outcome);
        })
        .map_err(|e| Fail::Io { source: e })?;

    let outcome = loop {
        match session.receive(Some(RUN_POLL_INTERVAL)) {
            ReceiveOutcome::Timeout => {
                if let Ok(outcome) = result_rx.try_recv() {
                    break outcome;
                }
            }
            ReceiveOutcome::Message(frame) => match frame.kind {
                FrameType::Ping => session.send(&NetPackage::new(FrameType::Ping, 0, 0))?,
                FrameType::ReqKill => {
                    cancel.store(true, Ordering::SeqCst);
                    let _ = handle.join();
                    let _ = result_rx.try_recv();
                    session.send(&NetPackage::new(FrameType::RunKilled, group_id, run_id))?;
                    session.send(&NetPackage::new(FrameType::Ready, 0, 0))?;
                    return Ok(RunEnd::Continue);
                }
                FrameType::Terminate => {
                    cancel.store(true, Ordering::SeqCst);
                    let _ = handle.join();
                    let _ = session.send(&NetPackage::new(FrameType::Terminate, 0, 0));
                    return Ok(RunEnd::Terminated);
                }
                other => {
                    warn!("protocol violation during run: {:?}", other);
                    cancel.store(true, Ordering::SeqCst);
                    let _ = handle.join();
                    return Err(Fail::ProtocolViolation {
                        detail: format!("unexpected frame {:?} during a run", other),
                    });
                }
            },
            ReceiveOutcome::Corrupt(e) => {
                warn!("corrupt frame during run: {}", e);
                cancel.store(true, Ordering::SeqCst);
                let _ = handle.join();
                return Ok(RunEnd::Disconnected);
            }
            ReceiveOutcome::Lost => {
                cancel.store(true, Ordering::SeqCst);
                let _ = handle.join();
                return Ok(RunEnd::Disconnected);
            }
        }
    };

    let _ = handle.join();
    let duration_seconds = started_at.elapsed().as_secs_f64();
    report_outcome(session, group_id, run_id, outcome, &parameters, duration_seconds)?;
    session.send(&NetPackage::new(FrameType::Ready, 0, 0))?;
    Ok(RunEnd::Continue)
}

fn report_outcome(
    session: &mut Session,
    group_id: i32,
    run_id: i32,
    outcome: RunOutcome,
    parameters: &NamedVector,
    duration_seconds: f64,
) -> Result<()> {
    match outcome {
        RunOutcome::Finished(observations) => {
            let mut payload = encode_vector(parameters.values());
            payload.extend(encode_vector(observations.values()));
            payload.extend(encode_vector(&[duration_seconds]));
            session.send(&NetPackage::with_payload(FrameType::RunFinished, group_id, run_id, payload))
        }
        RunOutcome::Failed(e) => {
            warn!("run {} failed: {}", run_id, e);
            session.send(&NetPackage::new(FrameType::RunFailed, group_id, run_id))
        }
        RunOutcome::Killed => session.send(&NetPackage::new(FrameType::RunKilled, group_id, run_id)),
    }
}
