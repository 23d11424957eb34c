// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Model interface (spec §4.3): renders parameters through template files,
//! invokes the external model command(s), and parses observations back out
//! through instruction files. Composes [render], [execute] and [parse] in
//! that order.

mod execute;
mod parse;
mod render;

pub use execute::{execute, ExecuteOutcome};
pub use parse::{parse_all, InstructionPair};
pub use render::{render_all, TemplatePair};

use crate::error::Fail;
use crate::vector::NamedVector;
use log::{info, warn};
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

//==============================================================================
// Constants & Structures
//==============================================================================

/// Everything the worker needs to run one model evaluation: where to render
/// inputs, what to run, and where to parse outputs from.
#[derive(Clone, Debug)]
pub struct ModelInterface {
    pub templates: Vec<TemplatePair>,
    pub instructions: Vec<InstructionPair>,
    pub command_lines: Vec<String>,
    pub working_dir: PathBuf,
}

/// The outcome of one full model run, matching the three non-finished
/// terminal wire states plus success.
#[derive(Debug)]
pub enum RunOutcome {
    Finished(NamedVector),
    Failed(Fail),
    Killed,
}

//==============================================================================
// Associate Functions
//==============================================================================

/// Associate functions for [ModelInterface].
impl ModelInterface {
    /// Verifies every referenced file is openable in the mode the pipeline
    /// will use it in. Called once at agent startup so a misconfigured
    /// sandbox fails fast rather than mid-run (spec §4.3).
    pub fn check_io_access(&self) -> Result<(), Fail> {
        for t in &self.templates {
            OpenOptions::new().read(true).open(&t.template_path).map_err(|e| Fail::RenderError {
                detail: format!("cannot open template {}: {}", t.template_path.display(), e),
            })?;
            ensure_writable_parent(&t.input_path)?;
        }
        for i in &self.instructions {
            OpenOptions::new().read(true).open(&i.instruction_path).map_err(|e| Fail::ParseError {
                detail: format!("cannot open instruction file {}: {}", i.instruction_path.display(), e),
            })?;
        }
        Ok(())
    }

    /// Runs the full render → execute → parse pipeline once.
    ///
    /// The result starts life as [`RunOutcome::Failed`] (spec §9: the
    /// original `run_model`'s `catch` blocks construct but never return a
    /// `RUN_FAILED` status, so any exception silently falls through to the
    /// default already sitting at the top of the function — that default is
    /// reproduced here explicitly as the initial binding, rather than left
    /// implicit in an unreachable catch arm) and is only overwritten by a
    /// successful pipeline stage or an explicit cancellation.
    pub fn run(&self, obs_names: &Arc<Vec<String>>, parameters: &NamedVector, cancel: &Arc<AtomicBool>) -> RunOutcome {
        let mut outcome = RunOutcome::Failed(Fail::RenderError {
            detail: "model run did not complete".into(),
        });

        if let Err(e) = render_all(&self.templates, parameters) {
            warn!("render failed: {}", e);
            return RunOutcome::Failed(e);
        }

        match execute(&self.command_lines, &self.working_dir, cancel) {
            Ok(ExecuteOutcome::Success) => {}
            Ok(ExecuteOutcome::NonZeroExit(code)) => {
                return RunOutcome::Failed(Fail::RenderError {
                    detail: format!("model command exited with code {}", code),
                });
            }
            Ok(ExecuteOutcome::Cancelled) => return RunOutcome::Killed,
            Err(e) => return RunOutcome::Failed(e),
        }

        match parse_all(&self.instructions, obs_names) {
            Ok(observations) => {
                info!("model run produced {} observations", observations.len());
                outcome = RunOutcome::Finished(observations);
            }
            Err(e) => {
                warn!("parse failed: {}", e);
                outcome = RunOutcome::Failed(e);
            }
        }
        outcome
    }
}

fn ensure_writable_parent(path: &Path) -> Result<(), Fail> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    OpenOptions::new().read(true).open(dir).map_err(|e| Fail::RenderError {
        detail: format!("cannot access directory {}: {}", dir.display(), e),
    })?;
    Ok(())
}
