// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Worker agent entry point: `agent <master_host> <master_port>
//! [<control_file>]`. Loads the local control file (default `./panther.pst`
//! in the current directory) to build the model interface, then connects to
//! the master and serves runs until `TERMINATE`.

use panther::agent::{self, AgentConfig};
use panther::error::Fail;
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
        log::error!("agent exiting with error: {}", e);
        std::process::exit(1);
    }
}

fn run() -> Result<(), Fail> {
    let mut args = std::env::args().skip(1);
    let master_host = args.next().ok_or_else(|| Fail::SchemaError {
        detail: "usage: agent <master_host> <master_port> [<control_file>]".into(),
    })?;
    let master_port: u16 = args.next().and_then(|s| s.parse().ok()).ok_or_else(|| Fail::SchemaError {
        detail: "usage: agent <master_host> <master_port> [<control_file>]".into(),
    })?;
    let control_file_path = args.next().map(PathBuf::from).unwrap_or_else(|| PathBuf::from("panther.pst"));

    let master_addr = (master_host.as_str(), master_port)
        .to_socket_addrs()
        .map_err(|e| Fail::Io { source: e })?
        .next()
        .ok_or_else(|| Fail::SchemaError {
            detail: format!("could not resolve {}:{}", master_host, master_port),
        })?;

    let base_dir = control_file_path.parent().map(PathBuf::from).unwrap_or_else(|| PathBuf::from("."));
    let schema = control_file::load(&control_file_path, &base_dir)?;
    for warning in &schema.warnings {
        log::warn!("{}", warning);
    }

    let working_dir = std::env::current_dir().map_err(|e| Fail::Io { source: e })?;
    let model = schema.model_interface(working_dir);
    model.check_io_access()?;

    let config = AgentConfig {
        master_addr,
        initial_poll_interval: Duration::from_millis(500),
        max_poll_interval: Duration::from_secs(30),
        max_recv_fails: 3,
        max_send_fails: 3,
        max_payload_bytes: 64 * 1024 * 1024,
    };

    agent::run(&config, &model)
}
