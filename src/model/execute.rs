// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

use crate::error::{Fail, Result};
use log::{debug, info, warn};
use std::path::Path;
use std::process::Command;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

//==============================================================================
// Constants & Structures
//==============================================================================

/// How often [execute] polls the cancel flag and the child's exit status.
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Outcome of running the model's command line(s).
#[derive(Debug)]
pub enum ExecuteOutcome {
    /// Every command line exited zero.
    Success,
    /// A command line exited nonzero; contains its exit code.
    NonZeroExit(i32),
    /// The cancel flag was observed set; the child was killed.
    Cancelled,
}

//==============================================================================
// Associate Functions
//==============================================================================

/// Spawns one child process per command line, sequentially, in `working_dir`.
/// Between polls of the child's exit status, checks `cancel`; if set, kills
/// the child (and, on unix, its whole process group, to catch any
/// grandchildren the model command spawned) and returns immediately with
/// [`ExecuteOutcome::Cancelled`].
pub fn execute(command_lines: &[String], working_dir: &Path, cancel: &Arc<AtomicBool>) -> Result<ExecuteOutcome> {
    for line in command_lines {
        match run_one(line, working_dir, cancel)? {
            ExecuteOutcome::Success => continue,
            other => return Ok(other),
        }
    }
    Ok(ExecuteOutcome::Success)
}

fn run_one(command_line: &str, working_dir: &Path, cancel: &Arc<AtomicBool>) -> Result<ExecuteOutcome> {
    let mut parts = command_line.split_whitespace();
    let program = parts.next().ok_or_else(|| Fail::RenderError {
        detail: "empty model command line".into(),
    })?;
    let mut cmd = Command::new(program);
    cmd.args(parts).current_dir(working_dir);
    set_new_process_group(&mut cmd);

    debug!("spawning model command: {}", command_line);
    let mut child = cmd.spawn().map_err(|e| Fail::Io { source: e })?;
    let pid = child.id();

    loop {
        if cancel.load(Ordering::SeqCst) {
            warn!("cancel observed, killing pid {}", pid);
            if !kill_process_group(pid) {
                let _ = child.kill();
            }
            let _ = child.wait();
            return Ok(ExecuteOutcome::Cancelled);
        }
        match child.try_wait() {
            Ok(Some(status)) => {
                return Ok(match status.code() {
                    Some(0) => ExecuteOutcome::Success,
                    Some(code) => {
                        info!("model command exited with code {}", code);
                        ExecuteOutcome::NonZeroExit(code)
                    }
                    None => ExecuteOutcome::NonZeroExit(-1),
                });
            }
            Ok(None) => std::thread::sleep(POLL_INTERVAL),
            Err(e) => return Err(Fail::Io { source: e }),
        }
    }
}

#[cfg(unix)]
fn set_new_process_group(cmd: &mut Command) {
    use std::os::unix::process::CommandExt;
    cmd.process_group(0);
}

#[cfg(not(unix))]
fn set_new_process_group(_cmd: &mut Command) {}

/// Kills the whole process group rooted at `pid`. Returns `true` if it
/// handled the kill itself; callers fall back to killing just the direct
/// child when this returns `false` (non-unix targets have no process-group
/// signal to send).
#[cfg(unix)]
fn kill_process_group(pid: u32) -> bool {
    unsafe {
        libc::kill(-(pid as i32), libc::SIGKILL);
    }
    true
}

#[cfg(not(unix))]
fn kill_process_group(_pid: u32) -> bool {
    false
}

//==============================================================================
// Unit Tests
//==============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn success_exit_reports_success() {
        let cancel = Arc::new(AtomicBool::new(false));
        let dir = std::env::temp_dir();
        let outcome = execute(&["true".to_string()], &dir, &cancel).unwrap();
        assert!(matches!(outcome, ExecuteOutcome::Success));
    }

    #[test]
    fn nonzero_exit_is_reported() {
        let cancel = Arc::new(AtomicBool::new(false));
        let dir = std::env::temp_dir();
        let outcome = execute(&["false".to_string()], &dir, &cancel).unwrap();
        assert!(matches!(outcome, ExecuteOutcome::NonZeroExit(_)));
    }

    #[test]
    fn cancel_flag_kills_long_running_command() {
        let cancel = Arc::new(AtomicBool::new(false));
        let dir = std::env::temp_dir();
        let cancel_clone = cancel.clone();
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(100));
            cancel_clone.store(true, Ordering::SeqCst);
        });
        let start = std::time::Instant::now();
        let outcome = execute(&["sleep 10".to_string()], &dir, &cancel).unwrap();
        assert!(matches!(outcome, ExecuteOutcome::Cancelled));
        assert!(start.elapsed() < Duration::from_secs(2));
    }
}
