// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

use std::time::Duration;

//==============================================================================
// Constants & Structures
//==============================================================================

/// Every tunable timeout and limit named in spec §5, plus the frame-size
/// ceiling from §4.1/§9. Constructed once at master startup from the
/// control file's numerical control settings and process-level overrides
/// (SPEC_FULL §D); never mutated once the master is running.
#[derive(Clone, Debug)]
pub struct RunManagerConfig {
    /// How long a worker waits between reconnect attempts, growing up to a
    /// bound (spec §4.4 step 1).
    pub worker_poll_interval: Duration,
    /// `None` disables the per-run timeout (spec §5 "may be disabled").
    pub per_run_timeout: Option<Duration>,
    pub ping_interval: Duration,
    pub ping_grace: Duration,
    /// `None` disables speculative dispatch outright.
    pub overdue_giveup_minutes: Option<f64>,
    pub max_recv_fails: u32,
    pub max_send_fails: u32,
    pub max_payload_bytes: usize,
    pub max_run_fail: u32,
    pub speculative_dispatch: bool,
    /// How long the master waits for `REQ_KILL`/`TERMINATE` acknowledgements
    /// before giving up on a worker (deadline grace, shutdown drain).
    pub kill_grace: Duration,
}

//==============================================================================
// Trait Implementations
//==============================================================================

impl Default for RunManagerConfig {
    /// Defaults mirror PEST++'s historical PANTHER tunables where the
    /// original source gives one (SPEC_FULL §D).
    fn default() -> Self {
        Self {
            worker_poll_interval: Duration::from_secs(1),
            per_run_timeout: None,
            ping_interval: Duration::from_secs(30),
            ping_grace: Duration::from_secs(60),
            overdue_giveup_minutes: None,
            max_recv_fails: 3,
            max_send_fails: 3,
            max_payload_bytes: 64 * 1024 * 1024,
            max_run_fail: 3,
            speculative_dispatch: false,
            kill_grace: Duration::from_secs(10),
        }
    }
}
