// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! End-to-end tests against a live [`Master`] over loopback TCP, driven by
//! hand-written stub workers speaking the wire protocol directly (no mock
//! framework, no fake transport). Each test plays the role of the driver on
//! one side and one or more agent stand-ins on the other.

use panther::codec::{decode_name_list, decode_vector, encode_name_list, encode_vector, FrameType, NetPackage};
use panther::config::RunManagerConfig;
use panther::ids::GroupId;
use panther::master::{Master, RunState};
use panther::transport::{ReceiveOutcome, Session};
use panther::vector::NamedVector;
use std::net::{SocketAddr, TcpStream};
use std::sync::Arc;
use std::time::Duration;

const PAR_NAMES: &[&str] = &["k1", "k2"];
const OBS_NAMES: &[&str] = &["h1"];

fn free_port() -> SocketAddr {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap()
}

fn spawn_master(config: RunManagerConfig) -> (Master, SocketAddr) {
    let addr = free_port();
    let par_names: Vec<String> = PAR_NAMES.iter().map(|s| s.to_string()).collect();
    let obs_names: Vec<String> = OBS_NAMES.iter().map(|s| s.to_string()).collect();
    let master = Master::spawn(addr, par_names, obs_names, config).expect("master failed to bind");
    (master, addr)
}

fn connect(addr: SocketAddr) -> Session {
    let mut last_err = None;
    for _ in 0..50 {
        match TcpStream::connect(addr) {
            Ok(stream) => return Session::new(stream, 3, 3, 1 << 20).unwrap(),
            Err(e) => {
                last_err = Some(e);
                std::thread::sleep(Duration::from_millis(20));
            }
        }
    }
    panic!("could not connect to {}: {:?}", addr, last_err);
}

/// Drives a stub worker through the `REQ_RUNDIR`/`PAR_NAMES`/`OBS_NAMES`
/// handshake (with the optional `REQ_LINPACK` round) and returns once it has
/// sent `READY`, mirroring `agent::negotiate_schema` + the initial `READY`.
fn handshake(session: &mut Session) -> (Vec<String>, Vec<String>) {
    let mut par_names = None;
    let mut obs_names = None;
    let mut linpack_done = false;
    loop {
        if par_names.is_some() && obs_names.is_some() && linpack_done {
            break;
        }
        match session.receive(Some(Duration::from_secs(5))) {
            ReceiveOutcome::Message(frame) => match frame.kind {
                FrameType::ReqRunDir => {
                    session.send(&NetPackage::new(FrameType::RunDir, 0, 0).with_desc("/tmp/stub").unwrap()).unwrap();
                }
                FrameType::ParNames => par_names = Some(decode_name_list(&frame.payload).unwrap()),
                FrameType::ObsNames => obs_names = Some(decode_name_list(&frame.payload).unwrap()),
                FrameType::ReqLinpack => {
                    session.send(&NetPackage::new(FrameType::Linpack, 0, 0)).unwrap();
                    linpack_done = true;
                }
                other => panic!("unexpected frame during handshake: {:?}", other),
            },
            other => panic!("handshake receive failed: {:?}", other),
        }
    }
    session.send(&NetPackage::new(FrameType::Ready, 0, 0)).unwrap();
    (par_names.unwrap(), obs_names.unwrap())
}

fn submit_run(master: &Master, values: &[f64]) -> panther::ids::RunId {
    let names = Arc::new(PAR_NAMES.iter().map(|s| s.to_string()).collect::<Vec<_>>());
    let parameters = NamedVector::new(names, values.to_vec()).unwrap();
    master.submit(parameters, GroupId(1))
}

fn poll_until<F>(master: &Master, timeout: Duration, mut done: F) -> Vec<panther::master::CompletedRun>
where
    F: FnMut(&[panther::master::CompletedRun]) -> bool,
{
    let start = std::time::Instant::now();
    let mut all = Vec::new();
    loop {
        let batch = master.poll_complete();
        all.extend(batch);
        if done(&all) || start.elapsed() >= timeout {
            return all;
        }
        std::thread::sleep(Duration::from_millis(20));
    }
}

/// S1: happy path. One worker connects, completes the handshake, receives a
/// run, reports `RUN_FINISHED`, and the driver observes it complete with the
/// expected observation values.
#[test]
fn happy_path_run_completes_with_reported_observations() {
    let (master, addr) = spawn_master(RunManagerConfig::default());
    let run_id = submit_run(&master, &[1.0, 2.0]);

    let mut worker = connect(addr);
    let (par_names, obs_names) = handshake(&mut worker);
    assert_eq!(par_names, PAR_NAMES);
    assert_eq!(obs_names, OBS_NAMES);

    let frame = match worker.receive(Some(Duration::from_secs(5))) {
        ReceiveOutcome::Message(f) => f,
        other => panic!("expected START_RUN, got {:?}", other),
    };
    assert_eq!(frame.kind, FrameType::StartRun);
    assert_eq!(frame.run_id, run_id.0);
    let (params, _) = decode_vector(&frame.payload, 0, par_names.len()).unwrap();
    assert_eq!(params, vec![1.0, 2.0]);

    let mut payload = encode_vector(&params);
    payload.extend(encode_vector(&[42.0]));
    payload.extend(encode_vector(&[0.25]));
    worker
        .send(&NetPackage::with_payload(FrameType::RunFinished, frame.group_id, frame.run_id, payload))
        .unwrap();

    let completed = poll_until(&master, Duration::from_secs(5), |c| !c.is_empty());
    assert_eq!(completed.len(), 1);
    assert_eq!(completed[0].state, RunState::Finished);
    let obs = completed[0].observations.as_ref().unwrap();
    assert_eq!(obs.get("h1"), Some(42.0));
    assert_eq!(completed[0].duration_seconds, Some(0.25));
}

/// S2: a run that exceeds its deadline gets `REQ_KILL`'d; once the worker
/// confirms with `RUN_KILLED` the run is terminal and is not retried.
#[test]
fn run_exceeding_deadline_is_killed_and_not_retried() {
    let mut config = RunManagerConfig::default();
    config.per_run_timeout = Some(Duration::from_millis(150));
    let (master, addr) = spawn_master(config);
    let run_id = submit_run(&master, &[0.0, 0.0]);

    let mut worker = connect(addr);
    handshake(&mut worker);

    let frame = match worker.receive(Some(Duration::from_secs(5))) {
        ReceiveOutcome::Message(f) => f,
        other => panic!("expected START_RUN, got {:?}", other),
    };
    assert_eq!(frame.kind, FrameType::StartRun);

    // Don't answer; wait for REQ_KILL once the deadline has passed.
    let kill = match worker.receive(Some(Duration::from_secs(5))) {
        ReceiveOutcome::Message(f) => f,
        other => panic!("expected REQ_KILL, got {:?}", other),
    };
    assert_eq!(kill.kind, FrameType::ReqKill);
    assert_eq!(kill.run_id, run_id.0);

    worker.send(&NetPackage::new(FrameType::RunKilled, kill.group_id, kill.run_id)).unwrap();

    let completed = poll_until(&master, Duration::from_secs(5), |c| !c.is_empty());
    assert_eq!(completed.len(), 1);
    assert_eq!(completed[0].state, RunState::Killed);
}

/// S3: a run that keeps failing is retried up to `max_run_fail` attempts,
/// then reported as terminally `Failed`.
#[test]
fn run_failing_repeatedly_is_retried_then_marked_failed() {
    let mut config = RunManagerConfig::default();
    config.max_run_fail = 2;
    let (master, addr) = spawn_master(config);
    let run_id = submit_run(&master, &[1.0, 1.0]);

    let mut worker = connect(addr);
    handshake(&mut worker);

    for attempt in 0..2 {
        let frame = match worker.receive(Some(Duration::from_secs(5))) {
            ReceiveOutcome::Message(f) => f,
            other => panic!("attempt {}: expected START_RUN, got {:?}", attempt, other),
        };
        assert_eq!(frame.kind, FrameType::StartRun);
        assert_eq!(frame.run_id, run_id.0);
        worker.send(&NetPackage::new(FrameType::RunFailed, frame.group_id, frame.run_id)).unwrap();
    }

    let completed = poll_until(&master, Duration::from_secs(5), |c| !c.is_empty());
    assert_eq!(completed.len(), 1);
    assert_eq!(completed[0].state, RunState::Failed);
    assert_eq!(master.num_failed(run_id), 2);
}

/// S4: a worker that disconnects mid-run does not lose the run — it goes
/// back on the queue and a second worker picks it up.
#[test]
fn run_survives_worker_loss_and_completes_on_a_second_worker() {
    let mut config = RunManagerConfig::default();
    config.max_run_fail = 3;
    let (master, addr) = spawn_master(config);
    let run_id = submit_run(&master, &[3.0, 4.0]);

    {
        let mut worker_a = connect(addr);
        handshake(&mut worker_a);
        let frame = match worker_a.receive(Some(Duration::from_secs(5))) {
            ReceiveOutcome::Message(f) => f,
            other => panic!("expected START_RUN, got {:?}", other),
        };
        assert_eq!(frame.kind, FrameType::StartRun);
        worker_a.shutdown();
        // worker_a drops here, closing the socket without ever answering.
    }

    let mut worker_b = connect(addr);
    let (par_names, _) = handshake(&mut worker_b);
    let frame = match worker_b.receive(Some(Duration::from_secs(5))) {
        ReceiveOutcome::Message(f) => f,
        other => panic!("expected START_RUN redispatch, got {:?}", other),
    };
    assert_eq!(frame.kind, FrameType::StartRun);
    assert_eq!(frame.run_id, run_id.0);
    let (params, _) = decode_vector(&frame.payload, 0, par_names.len()).unwrap();

    let mut payload = encode_vector(&params);
    payload.extend(encode_vector(&[7.0]));
    payload.extend(encode_vector(&[0.1]));
    worker_b
        .send(&NetPackage::with_payload(FrameType::RunFinished, frame.group_id, frame.run_id, payload))
        .unwrap();

    let completed = poll_until(&master, Duration::from_secs(5), |c| !c.is_empty());
    assert_eq!(completed.len(), 1);
    assert_eq!(completed[0].state, RunState::Finished);
    assert_eq!(master.num_failed(run_id), 1);
}

/// S5: a frame sent out of turn during the handshake is a protocol
/// violation — the master replies `CORRUPT_MESG` and drops the connection
/// rather than crashing the event loop or wedging other workers.
#[test]
fn protocol_violation_during_handshake_drops_the_connection() {
    let (master, addr) = spawn_master(RunManagerConfig::default());
    let mut worker = connect(addr);

    // REQ_RUNDIR has not been answered yet; a PING here is not one of the
    // frames `HandshakeStage::AwaitingRunDir` accepts.
    match worker.receive(Some(Duration::from_secs(5))) {
        ReceiveOutcome::Message(frame) => assert_eq!(frame.kind, FrameType::ReqRunDir),
        other => panic!("expected REQ_RUNDIR, got {:?}", other),
    }
    worker.send(&NetPackage::new(FrameType::Ping, 0, 0)).unwrap();

    match worker.receive(Some(Duration::from_secs(5))) {
        ReceiveOutcome::Message(frame) => assert_eq!(frame.kind, FrameType::CorruptMesg),
        other => panic!("expected CORRUPT_MESG, got {:?}", other),
    }
    match worker.receive(Some(Duration::from_secs(5))) {
        ReceiveOutcome::Lost => {}
        other => panic!("expected the master to close the connection, got {:?}", other),
    }

    // The master itself keeps running and can still serve a fresh worker.
    let mut other = connect(addr);
    handshake(&mut other);
    let run_id = submit_run(&master, &[0.0, 0.0]);
    let frame = match other.receive(Some(Duration::from_secs(5))) {
        ReceiveOutcome::Message(f) => f,
        other => panic!("expected START_RUN, got {:?}", other),
    };
    assert_eq!(frame.run_id, run_id.0);
}

/// S6: shutdown sends `TERMINATE` to every idle worker and waits for every
/// connection to close before returning.
#[test]
fn shutdown_terminates_idle_workers_and_drains() {
    let (master, addr) = spawn_master(RunManagerConfig::default());
    let mut worker = connect(addr);
    handshake(&mut worker);

    let shutdown_handle = std::thread::spawn(move || master.shutdown());

    match worker.receive(Some(Duration::from_secs(5))) {
        ReceiveOutcome::Message(frame) => assert_eq!(frame.kind, FrameType::Terminate),
        other => panic!("expected TERMINATE, got {:?}", other),
    }
    worker.shutdown();
    drop(worker);

    shutdown_handle.join().expect("shutdown() call panicked");
}
