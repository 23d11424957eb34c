// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Control-file schema loader (spec §4.6). Reads the ordered parameter and
//! observation lists, prior-information records, template/instruction file
//! lists and the model command line once at startup, ahead of any network
//! activity — a [`Fail::SchemaError`](crate::error::Fail::SchemaError) here
//! is always fatal before the master or agent opens a socket.

pub mod control_file;

use crate::model::{InstructionPair, ModelInterface, TemplatePair};
use std::collections::HashMap;
use std::sync::Arc;

//==============================================================================
// Constants & Structures
//==============================================================================

/// How a parameter's value is transformed before being handed to the model
/// (spec §4.6; REDESIGN FLAGS: tagged variant in place of a raw pointer to a
/// regularization/transform record).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TransformType {
    None,
    Log,
    Fixed,
    Tied,
}

/// How a parameter's per-iteration change is bounded. `Factor` is
/// multiplicative and cannot cross zero; `Relative` is additive-as-fraction
/// and requires `relparmax > 1.0` when bounds straddle zero
/// (`Pest.cpp:161-162`).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ChangeLimit {
    Factor,
    Relative,
}

/// One parameter record (spec §4.6 field list).
#[derive(Clone, Debug)]
pub struct ParameterRecord {
    pub name: String,
    pub transform: TransformType,
    pub chglim: ChangeLimit,
    pub initial: f64,
    pub lower: f64,
    pub upper: f64,
    pub group: String,
    pub scale: f64,
    pub offset: f64,
    pub dercom: u32,
    /// Set for `Tied` parameters: the lead parameter's name and the fixed
    /// initial-value ratio this parameter tracks it by (`Pest.cpp:723-729`,
    /// `Pest.cpp:1052-1104`).
    pub tied_to: Option<(String, f64)>,
}

/// One observation record (spec §4.6).
#[derive(Clone, Debug)]
pub struct ObservationRecord {
    pub name: String,
    pub value: f64,
    pub weight: f64,
    pub group: String,
}

/// One prior-information equation (spec §4.6, `Pest.cpp:764-786`). The
/// expression is kept as the original right-hand-side text rather than
/// parsed into an AST — this crate only needs the record for schema
/// purposes, not to evaluate it.
#[derive(Clone, Debug)]
pub struct PriorInfoRecord {
    pub name: String,
    pub group: String,
    pub weight: f64,
    pub expression: String,
}

/// The numerical control settings this crate actually consumes (spec §4.6
/// "numerical control settings"; most of the classic PEST control-data
/// block governs optimization behavior this system has no part in, so only
/// the fields that shape run-manager or validation behavior are kept).
#[derive(Clone, Debug)]
pub struct NumericalControls {
    pub noptmax: i32,
    pub facparmax: f64,
    pub relparmax: f64,
    pub numcom: u32,
    pub tie_by_group: bool,
}

/// Everything the run manager needs, loaded once from a control file.
#[derive(Clone, Debug)]
pub struct Schema {
    pub parameters: Vec<ParameterRecord>,
    pub observations: Vec<ObservationRecord>,
    pub prior_information: Vec<PriorInfoRecord>,
    pub templates: Vec<TemplatePair>,
    pub instructions: Vec<InstructionPair>,
    pub command_lines: Vec<String>,
    pub controls: NumericalControls,
    /// Effective `max_run_fail`, after the `noptmax == 0` override
    /// (`Pest.cpp:64-67`).
    pub max_run_fail: u32,
    /// Non-fatal notices collected during load (relaxed bound checks in
    /// `noptmax == 0` mode, `dercom > 1` downgrades, ...).
    pub warnings: Vec<String>,
}

//==============================================================================
// Associate Functions
//==============================================================================

/// Associate functions for [Schema].
impl Schema {
    pub fn par_names(&self) -> Arc<Vec<String>> {
        Arc::new(self.parameters.iter().map(|p| p.name.clone()).collect())
    }

    pub fn obs_names(&self) -> Arc<Vec<String>> {
        Arc::new(self.observations.iter().map(|o| o.name.clone()).collect())
    }

    /// Names of parameters the driver may actually adjust: everything that
    /// isn't `Fixed` or `Tied`.
    pub fn adjustable_names(&self) -> Vec<&str> {
        self.parameters
            .iter()
            .filter(|p| !matches!(p.transform, TransformType::Fixed | TransformType::Tied))
            .map(|p| p.name.as_str())
            .collect()
    }

    /// Builds the worker-side [`ModelInterface`] this schema describes.
    pub fn model_interface(&self, working_dir: std::path::PathBuf) -> ModelInterface {
        ModelInterface {
            templates: self.templates.clone(),
            instructions: self.instructions.clone(),
            command_lines: self.command_lines.clone(),
            working_dir,
        }
    }

    pub(crate) fn parameter_index(&self) -> HashMap<&str, &ParameterRecord> {
        self.parameters.iter().map(|p| (p.name.as_str(), p)).collect()
    }
}
