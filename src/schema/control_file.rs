// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Line-oriented reader for the classic PEST-style control file (spec §4.6).
//! Only the sections this crate actually consumes are parsed: `CONTROL
//! DATA`'s counts and a handful of numerical settings, `PARAMETER DATA`,
//! `OBSERVATION DATA`, `PRIOR INFORMATION`, `MODEL COMMAND LINE`, and
//! `MODEL INPUT/OUTPUT`. Every other section (`PARAMETER GROUPS`,
//! `OBSERVATION GROUPS`, `SINGULAR VALUE DECOMPOSITION`, regularization, ...)
//! is skipped line-for-line rather than interpreted, matching spec §1's
//! scope line: "control-file ingestion necessary only to seed
//! parameter/observation schemas".

use super::{ChangeLimit, NumericalControls, ObservationRecord, ParameterRecord, PriorInfoRecord, Schema, TransformType};
use crate::error::{Fail, Result};
use crate::model::{InstructionPair, TemplatePair};
use std::path::{Path, PathBuf};

//==============================================================================
// Constants & Structures
//==============================================================================

#[derive(Default)]
struct Counts {
    npar: usize,
    nobs: usize,
    npargp: usize,
    nprior: usize,
    nobsgp: usize,
    ntplfle: usize,
    ninsfle: usize,
}

enum Section {
    ControlData,
    ParameterGroups,
    ParameterData,
    ObservationGroups,
    ObservationData,
    ModelCommandLine,
    ModelInputOutput,
    PriorInformation,
    Other,
}

//==============================================================================
// Associate Functions
//==============================================================================

/// Loads and validates a control file from `path`, relative to
/// `base_dir` for every file path the control file itself names (template,
/// instruction, input, output files).
pub fn load(path: &Path, base_dir: &Path) -> Result<Schema> {
    let text = std::fs::read_to_string(path).map_err(|e| Fail::SchemaError {
        detail: format!("reading control file {}: {}", path.display(), e),
    })?;
    parse(&text, base_dir)
}

fn parse(text: &str, base_dir: &Path) -> Result<Schema> {
    let mut counts = Counts::default();
    let mut controls = NumericalControls {
        noptmax: 0,
        facparmax: 0.0,
        relparmax: 0.0,
        numcom: 1,
        tie_by_group: false,
    };

    let mut parameters = Vec::new();
    let mut observations = Vec::new();
    let mut prior_information = Vec::new();
    let mut templates = Vec::new();
    let mut instructions = Vec::new();
    let mut command_lines = Vec::new();
    let mut tplfle_names = Vec::new();
    let mut insfle_names = Vec::new();

    let mut section = Section::Other;
    let mut sec_lnum: usize = 0;
    let mut pi_buffer = String::new();

    for raw_line in text.lines() {
        let line = raw_line.trim();
        if line.is_empty() || line == "pcf" {
            continue;
        }
        if let Some(name) = line.strip_prefix('*') {
            flush_prior_info(&mut pi_buffer, &mut prior_information)?;
            section = section_for(name.trim());
            sec_lnum = 0;
            continue;
        }
        if let Some(opt) = line.strip_prefix("++") {
            apply_pestpp_option(opt.trim(), &mut controls);
            continue;
        }
        sec_lnum += 1;
        let tokens: Vec<&str> = line.split_whitespace().collect();

        match section {
            Section::ControlData => parse_control_data_line(sec_lnum, &tokens, &mut counts, &mut controls)?,
            Section::ParameterGroups => { /* not consumed by this loader */ }
            Section::ParameterData => {
                if sec_lnum <= counts.npar {
                    parameters.push(parse_parameter_line(&tokens, controls.numcom)?);
                } else {
                    apply_tied_ratio(&mut parameters, &tokens)?;
                }
            }
            Section::ObservationGroups => {}
            Section::ObservationData => {
                if sec_lnum <= counts.nobs {
                    observations.push(parse_observation_line(&tokens)?);
                }
            }
            Section::ModelCommandLine => command_lines.push(line.to_string()),
            Section::ModelInputOutput => {
                if sec_lnum <= counts.ntplfle {
                    let (tpl, inp) = parse_two_paths(&tokens, "model input")?;
                    tplfle_names.push((tpl, inp));
                } else if sec_lnum <= counts.ntplfle + counts.ninsfle {
                    let (ins, out) = parse_two_paths(&tokens, "model output")?;
                    insfle_names.push((ins, out));
                }
            }
            Section::PriorInformation => {
                if tokens.first() == Some(&"&") {
                    pi_buffer.push(' ');
                    pi_buffer.push_str(&line[1..].trim_start());
                } else {
                    flush_prior_info(&mut pi_buffer, &mut prior_information)?;
                    pi_buffer.push_str(line);
                }
            }
            Section::Other => {}
        }
    }
    flush_prior_info(&mut pi_buffer, &mut prior_information)?;

    if parameters.len() != counts.npar {
        return Err(Fail::SchemaError {
            detail: format!("control data declared {} parameters, found {}", counts.npar, parameters.len()),
        });
    }
    if observations.len() != counts.nobs {
        return Err(Fail::SchemaError {
            detail: format!("control data declared {} observations, found {}", counts.nobs, observations.len()),
        });
    }
    let _ = (counts.npargp, counts.nobsgp, counts.nprior);

    for (marker_path, input_path) in tplfle_names {
        templates.push(TemplatePair {
            marker: '~',
            template_path: resolve(base_dir, &marker_path),
            input_path: resolve(base_dir, &input_path),
        });
    }
    for (instruction_path, output_path) in insfle_names {
        instructions.push(InstructionPair {
            instruction_path: resolve(base_dir, &instruction_path),
            output_path: resolve(base_dir, &output_path),
        });
    }

    let mut warnings = Vec::new();
    validate_and_tie(&mut parameters, &controls, &mut warnings)?;

    if controls.noptmax == 0 {
        warnings.push("noptmax = 0, resetting max_run_fail = 1".into());
    }
    let max_run_fail = if controls.noptmax == 0 { 1 } else { 3 };

    Ok(Schema {
        parameters,
        observations,
        prior_information,
        templates,
        instructions,
        command_lines,
        controls,
        max_run_fail,
        warnings,
    })
}

/// Parses a `++name(value)` pestpp-control-option line. Only
/// `tie_by_group` is consumed by this loader; every other option is
/// outside this crate's narrowed scope and is silently ignored, matching
/// spec §1's "control-file ingestion necessary only to seed ... schemas".
fn apply_pestpp_option(opt: &str, controls: &mut NumericalControls) {
    let Some(open) = opt.find('(') else { return };
    let Some(close) = opt.rfind(')') else { return };
    if close <= open {
        return;
    }
    let name = opt[..open].trim();
    let value = opt[open + 1..close].trim();
    if name.eq_ignore_ascii_case("tie_by_group") {
        controls.tie_by_group = value.eq_ignore_ascii_case("true");
    }
}

fn section_for(name: &str) -> Section {
    match name.to_ascii_uppercase().as_str() {
        "CONTROL DATA" => Section::ControlData,
        "PARAMETER GROUPS" => Section::ParameterGroups,
        "PARAMETER DATA" => Section::ParameterData,
        "OBSERVATION GROUPS" => Section::ObservationGroups,
        "OBSERVATION DATA" => Section::ObservationData,
        "MODEL COMMAND LINE" => Section::ModelCommandLine,
        "MODEL INPUT/OUTPUT" => Section::ModelInputOutput,
        "PRIOR INFORMATION" => Section::PriorInformation,
        _ => Section::Other,
    }
}

fn parse_control_data_line(sec_lnum: usize, tokens: &[&str], counts: &mut Counts, controls: &mut NumericalControls) -> Result<()> {
    match sec_lnum {
        1 => {}
        2 => {
            counts.npar = field(tokens, 0, "NPAR")?;
            counts.nobs = field(tokens, 1, "NOBS")?;
            counts.npargp = field(tokens, 2, "NPARGP")?;
            counts.nprior = field(tokens, 3, "NPRIOR")?;
            counts.nobsgp = field(tokens, 4, "NOBSGP")?;
        }
        3 => {
            counts.ntplfle = field(tokens, 0, "NTPLFLE")?;
            counts.ninsfle = field(tokens, 1, "NINSFLE")?;
            if tokens.len() > 4 {
                controls.numcom = field(tokens, 4, "NUMCOM")?;
            }
        }
        5 => {
            controls.relparmax = field(tokens, 0, "RELPARMAX")?;
            controls.facparmax = field(tokens, 1, "FACPARMAX")?;
        }
        7 => controls.noptmax = field(tokens, 0, "NOPTMAX")?,
        _ => {}
    }
    Ok(())
}

fn field<T: std::str::FromStr>(tokens: &[&str], ix: usize, name: &'static str) -> Result<T> {
    tokens
        .get(ix)
        .ok_or_else(|| Fail::SchemaError {
            detail: format!("missing field {}", name),
        })
        .and_then(|tok| {
            tok.parse::<T>().map_err(|_| Fail::SchemaError {
                detail: format!("{} is not a valid number: {:?}", name, tok),
            })
        })
}

fn parse_parameter_line(tokens: &[&str], numcom: u32) -> Result<ParameterRecord> {
    if tokens.len() < 9 {
        return Err(Fail::SchemaError {
            detail: format!("parameter data line has {} fields, need at least 9", tokens.len()),
        });
    }
    let transform = match tokens[1].to_ascii_uppercase().as_str() {
        "NONE" => TransformType::None,
        "LOG" => TransformType::Log,
        "FIXED" => TransformType::Fixed,
        "TIED" => TransformType::Tied,
        other => {
            return Err(Fail::SchemaError {
                detail: format!("unrecognized partrans {:?}", other),
            })
        }
    };
    let chglim = match tokens[2].to_ascii_uppercase().as_str() {
        "FACTOR" => ChangeLimit::Factor,
        "RELATIVE" => ChangeLimit::Relative,
        other => {
            return Err(Fail::SchemaError {
                detail: format!("unrecognized parchglim {:?}", other),
            })
        }
    };
    let dercom = if numcom > 1 {
        field::<u32>(tokens, 9, "DERCOM")?
    } else {
        1
    };
    Ok(ParameterRecord {
        name: tokens[0].to_string(),
        transform,
        chglim,
        initial: field(tokens, 3, "PARVAL1")?,
        lower: field(tokens, 4, "PARLBND")?,
        upper: field(tokens, 5, "PARUBND")?,
        group: tokens[6].to_string(),
        scale: field(tokens, 7, "SCALE")?,
        offset: field(tokens, 8, "OFFSET")?,
        dercom,
        tied_to: None,
    })
}

/// Handles the classic PEST trailer lines that follow the `num_par` main
/// parameter records: `tied_name host_name`, ratio computed from the two
/// parameters' already-parsed initial values (`Pest.cpp:723-729`).
fn apply_tied_ratio(parameters: &mut [ParameterRecord], tokens: &[&str]) -> Result<()> {
    if tokens.len() < 2 {
        return Ok(());
    }
    let name = tokens[0];
    let host = tokens[1];
    let host_value = parameters
        .iter()
        .find(|p| p.name == host)
        .map(|p| p.initial)
        .ok_or_else(|| Fail::SchemaError {
            detail: format!("tied parameter {:?} references unknown host {:?}", name, host),
        })?;
    let target = parameters.iter_mut().find(|p| p.name == name).ok_or_else(|| Fail::SchemaError {
        detail: format!("tied-ratio line for unknown parameter {:?}", name),
    })?;
    let ratio = target.initial / host_value;
    target.tied_to = Some((host.to_string(), ratio));
    Ok(())
}

fn parse_observation_line(tokens: &[&str]) -> Result<ObservationRecord> {
    if tokens.len() < 4 {
        return Err(Fail::SchemaError {
            detail: format!("observation data line has {} fields, need 4", tokens.len()),
        });
    }
    Ok(ObservationRecord {
        name: tokens[0].to_string(),
        value: field(tokens, 1, "OBSVAL")?,
        weight: field(tokens, 2, "WEIGHT")?,
        group: tokens[3].to_string(),
    })
}

fn parse_two_paths(tokens: &[&str], context: &'static str) -> Result<(PathBuf, PathBuf)> {
    if tokens.len() < 2 {
        return Err(Fail::SchemaError {
            detail: format!("{} line needs two file names, got {:?}", context, tokens),
        });
    }
    Ok((PathBuf::from(tokens[0]), PathBuf::from(tokens[1])))
}

fn resolve(base_dir: &Path, p: &Path) -> PathBuf {
    if p.is_absolute() {
        p.to_path_buf()
    } else {
        base_dir.join(p)
    }
}

/// Parses one accumulated prior-information record: `pilbl coef * parnme
/// [+ coef * ...] = pival weight obgnme` (`Pest.cpp:764-786`). Only the
/// first matching branch in the original is reachable (spec §9 open
/// question); this is the single parse path that survives.
fn flush_prior_info(buffer: &mut String, out: &mut Vec<PriorInfoRecord>) -> Result<()> {
    if buffer.trim().is_empty() {
        buffer.clear();
        return Ok(());
    }
    let line = std::mem::take(buffer);
    let tokens: Vec<&str> = line.split_whitespace().collect();
    let name = tokens.first().copied().ok_or_else(|| Fail::SchemaError {
        detail: "empty prior information record".into(),
    })?;
    let eq_pos = tokens.iter().position(|&t| t == "=").ok_or_else(|| Fail::SchemaError {
        detail: format!("prior information record {:?} has no '=' sign", name),
    })?;
    let expression = tokens[1..eq_pos].join(" ");
    let tail = &tokens[eq_pos + 1..];
    if tail.len() < 3 {
        return Err(Fail::SchemaError {
            detail: format!("prior information record {:?} is missing value/weight/group", name),
        });
    }
    let value: f64 = tail[0].parse().map_err(|_| Fail::SchemaError {
        detail: format!("prior information record {:?}: {:?} is not a number", name, tail[0]),
    })?;
    let weight: f64 = tail[1].parse().map_err(|_| Fail::SchemaError {
        detail: format!("prior information record {:?}: {:?} is not a number", name, tail[1]),
    })?;
    let _ = value;
    out.push(PriorInfoRecord {
        name: name.to_string(),
        group: tail[2].to_string(),
        weight,
        expression,
    });
    Ok(())
}

//--------------------------------------------------------------------
// Validation (Pest.cpp:60-167, 1052-1104)
//--------------------------------------------------------------------

/// Applies the `Pest.cpp::check_inputs`/tie-by-group rules in place, after
/// every parameter record is known: bound checks, `facparmax`/`relparmax`
/// gates, `dercom` downgrade, and group-tying.
fn validate_and_tie(parameters: &mut [ParameterRecord], controls: &NumericalControls, warnings: &mut Vec<String>) -> Result<()> {
    if !parameters.iter().any(|p| !matches!(p.transform, TransformType::Fixed | TransformType::Tied)) {
        return Err(Fail::SchemaError {
            detail: "no adjustable parameters (all are FIXED or TIED)".into(),
        });
    }
    if controls.facparmax <= 1.0 {
        return Err(Fail::SchemaError {
            detail: "'facparmax' must be greater than 1.0".into(),
        });
    }

    let forgive_bound = controls.noptmax == 0;
    for p in parameters.iter() {
        if p.initial < p.lower {
            if forgive_bound {
                warnings.push(format!("{} is less than lower bound, but noptmax=0, continuing...", p.name));
            } else {
                return Err(Fail::SchemaError {
                    detail: format!("{} is less than lower bound", p.name),
                });
            }
        }
        if p.initial > p.upper {
            if forgive_bound {
                warnings.push(format!("{} is greater than upper bound, but noptmax=0, continuing...", p.name));
            } else {
                return Err(Fail::SchemaError {
                    detail: format!("{} is greater than upper bound", p.name),
                });
            }
        }
        if p.dercom > 1 {
            warnings.push(format!("{} has 'dercom' > 1, this crate doesn't support 'dercom' > 1, ignoring", p.name));
        }
        let straddles_zero = p.upper > 0.0 && p.lower < 0.0;
        if straddles_zero {
            match p.chglim {
                ChangeLimit::Factor => {
                    return Err(Fail::SchemaError {
                        detail: format!("{} 'factor' parchglim not compatible with bounds that cross zero", p.name),
                    });
                }
                ChangeLimit::Relative if controls.relparmax <= 1.0 => {
                    return Err(Fail::SchemaError {
                        detail: format!("{} bounds cross zero, requires 'relparmax' > 1.0", p.name),
                    });
                }
                ChangeLimit::Relative => {}
            }
        }
    }

    if controls.tie_by_group {
        tie_by_group(parameters, warnings);
    }
    Ok(())
}

/// Ties every non-lead adjustable parameter within a group to that group's
/// first-seen parameter, by initial-value ratio (`Pest.cpp:1052-1104`).
/// Parameters already explicitly `Tied` are left as-is — the original's
/// "existing ties are maintained" guarantee.
fn tie_by_group(parameters: &mut [ParameterRecord], warnings: &mut Vec<String>) {
    let mut lead_by_group: Vec<(String, String, f64)> = Vec::new();
    let before = parameters.iter().filter(|p| matches!(p.transform, TransformType::None | TransformType::Log)).count();

    for ix in 0..parameters.len() {
        if !matches!(parameters[ix].transform, TransformType::None | TransformType::Log) {
            continue;
        }
        let group = parameters[ix].group.clone();
        if let Some((_, lead_name, lead_value)) = lead_by_group.iter().find(|(g, _, _)| *g == group) {
            let ratio = parameters[ix].initial / lead_value;
            parameters[ix].transform = TransformType::Tied;
            parameters[ix].tied_to = Some((lead_name.clone(), ratio));
        } else {
            lead_by_group.push((group, parameters[ix].name.clone(), parameters[ix].initial));
        }
    }

    let after = parameters.iter().filter(|p| matches!(p.transform, TransformType::None | TransformType::Log)).count();
    warnings.push(format!("number of adjustable parameters reduced from {} to {} by tie_by_group", before, after));
}

//==============================================================================
// Unit Tests
//==============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const MINIMAL: &str = "\
pcf
* control data
restart estimation
2 1 1 0 1
1 1 single point
5 2 4.0 0.003 10
10.0 2.0 0.3
0.1
30 0.005 4 4 0.005 4
* parameter groups
pargp1 relative 0.01 0.0 switch 2.0 parabolic
* parameter data
k1   log   factor   1.0   0.1   10.0   pargp1  1.0   0.0   1
rech none relative 0.005 0.001 0.01   pargp1  1.0   0.0   1
* observation groups
obsgp1
* observation data
h1  12.5  1.0  obsgp1
* model command line
run_model.sh
* model input/output
in.tpl in.dat
out.ins out.dat
* prior information
pi1 1.0 * log(k1) = 0.0  1.0  regul
";

    #[test]
    fn loads_parameters_observations_and_prior_info() {
        let dir = TempDir::new().unwrap();
        let ctl_path = dir.path().join("test.pst");
        std::fs::write(&ctl_path, MINIMAL).unwrap();
        let schema = load(&ctl_path, dir.path()).unwrap();

        assert_eq!(schema.parameters.len(), 2);
        assert_eq!(schema.parameters[0].name, "k1");
        assert_eq!(schema.parameters[0].transform, TransformType::Log);
        assert_eq!(schema.observations.len(), 1);
        assert_eq!(schema.observations[0].name, "h1");
        assert_eq!(schema.prior_information.len(), 1);
        assert_eq!(schema.prior_information[0].group, "regul");
        assert_eq!(schema.command_lines, vec!["run_model.sh".to_string()]);
        assert_eq!(schema.templates.len(), 1);
        assert_eq!(schema.instructions.len(), 1);
        assert_eq!(schema.controls.noptmax, 30);
        assert!(schema.warnings.is_empty());
    }

    #[test]
    fn facparmax_at_or_below_one_is_schema_error() {
        let bad = MINIMAL.replace("5 2 4.0 0.003 10\n10.0 2.0 0.3", "5 2 4.0 0.003 10\n10.0 1.0 0.3");
        let dir = TempDir::new().unwrap();
        let ctl_path = dir.path().join("test.pst");
        std::fs::write(&ctl_path, bad).unwrap();
        let err = load(&ctl_path, dir.path()).unwrap_err();
        assert!(matches!(err, Fail::SchemaError { .. }));
    }

    #[test]
    fn noptmax_zero_downgrades_out_of_bounds_init_to_a_warning() {
        let text = MINIMAL
            .replace("30 0.005 4 4 0.005 4", "0 0.005 4 4 0.005 4")
            .replace("k1   log   factor   1.0   0.1   10.0", "k1   log   factor   20.0   0.1   10.0");
        let dir = TempDir::new().unwrap();
        let ctl_path = dir.path().join("test.pst");
        std::fs::write(&ctl_path, text).unwrap();
        let schema = load(&ctl_path, dir.path()).unwrap();
        assert!(schema.warnings.iter().any(|w| w.contains("greater than upper bound")));
        assert_eq!(schema.max_run_fail, 1);
    }

    #[test]
    fn factor_chglim_incompatible_with_bounds_crossing_zero() {
        let text = MINIMAL.replace(
            "rech none relative 0.005 0.001 0.01   pargp1  1.0   0.0   1",
            "rech none factor -1.0 -2.0 2.0   pargp1  1.0   0.0   1",
        );
        let dir = TempDir::new().unwrap();
        let ctl_path = dir.path().join("test.pst");
        std::fs::write(&ctl_path, text).unwrap();
        let err = load(&ctl_path, dir.path()).unwrap_err();
        assert!(matches!(err, Fail::SchemaError { .. }));
    }

    #[test]
    fn tie_by_group_ties_non_lead_parameters_in_a_group() {
        let mut text = MINIMAL.replace(
            "rech none relative 0.005 0.001 0.01   pargp1  1.0   0.0   1",
            "rech none relative 0.005 0.001 0.01   pargp1  1.0   0.0   1\nk2   log   factor   2.0   0.1   10.0   pargp1  1.0   0.0   1",
        );
        text = text.replace("2 1 1 0 1", "3 1 1 0 1");
        text.push_str("++tie_by_group(true)\n");
        let dir = TempDir::new().unwrap();
        let ctl_path = dir.path().join("test.pst");
        std::fs::write(&ctl_path, text).unwrap();
        let schema = load(&ctl_path, dir.path()).unwrap();
        let k2 = schema.parameters.iter().find(|p| p.name == "k2").unwrap();
        assert_eq!(k2.transform, TransformType::Tied);
        assert_eq!(k2.tied_to.as_ref().unwrap().0, "k1");
        assert!((k2.tied_to.as_ref().unwrap().1 - 2.0).abs() < 1e-9);
    }
}
