// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Reference master entry point: `panther_master <bind_host> <bind_port>
//! <control_file>`. Loads the control file for its parameter/observation
//! schema, starts the event loop, and logs every run's terminal status as
//! workers report them. A real driver embeds [`panther::master::Master`]
//! directly rather than shelling out to this binary; it exists so the
//! protocol can be exercised end-to-end against real `agent` processes.

use panther::config::RunManagerConfig;
use panther::error::Fail;
use panther::master::Master;
use panther::schema::control_file;
use std::net::ToSocketAddrs;
use std::path::PathBuf;
use std::time::Duration;

fn main() {
    flexi_logger::Logger::try_with_env_or_str("info")
        .expect("invalid RUST_LOG filter")
        .start()
        .expect("failed to start logger");

    if let Err(e) = run() {
        log::error!("master exiting with error: {}", e);
        std::process::exit(1);
    }
}

fn run() -> Result<(), Fail> {
    let mut args = std::env::args().skip(1);
    let bind_host = args.next().ok_or_else(usage)?;
    let bind_port: u16 = args.next().and_then(|s| s.parse().ok()).ok_or_else(usage)?;
    let control_file_path = PathBuf::from(args.next().ok_or_else(usage)?);

    let bind_addr = (bind_host.as_str(), bind_port)
        .to_socket_addrs()
        .map_err(|e| Fail::Io { source: e })?
        .next()
        .ok_or_else(|| Fail::SchemaError {
            detail: format!("could not resolve {}:{}", bind_host, bind_port),
        })?;

    let base_dir = control_file_path.parent().map(PathBuf::from).unwrap_or_else(|| PathBuf::from("."));
    let schema = control_file::load(&control_file_path, &base_dir)?;
    for warning in &schema.warnings {
        log::warn!("{}", warning);
    }

    let config = RunManagerConfig {
        max_run_fail: schema.max_run_fail,
        ..RunManagerConfig::default()
    };

    let par_names = schema.par_names().as_ref().clone();
    let obs_names = schema.obs_names().as_ref().clone();
    let master = Master::spawn(bind_addr, par_names, obs_names, config)?;

    log::info!("master listening on {}; {} adjustable parameters", bind_addr, schema.adjustable_names().len());

    loop {
        std::thread::sleep(Duration::from_secs(5));
        let completed = master.poll_complete();
        for run in completed {
            log::info!("run {} -> {:?}", run.run_id, run.state);
        }
    }
}

fn usage() -> Fail {
    Fail::SchemaError {
        detail: "usage: panther_master <bind_host> <bind_port> <control_file>".into(),
    }
}
