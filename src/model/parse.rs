// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

use crate::error::{Fail, Result};
use crate::vector::NamedVector;
use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

//==============================================================================
// Constants & Structures
//==============================================================================

/// One (instruction, output) pair (spec §4.3).
#[derive(Clone, Debug)]
pub struct InstructionPair {
    pub instruction_path: PathBuf,
    pub output_path: PathBuf,
}

/// A single instruction-file directive, applied in sequence against the
/// output file's lines. This is a representative subset of the original
/// instruction mini-language, not a full grammar (spec §1 scopes the
/// grammar itself out): `lN` advances N lines, `w` skips to the next
/// whitespace-delimited token, and `!name!` reads the current token as the
/// value for observation `name`.
#[derive(Clone, Debug)]
enum Directive {
    AdvanceLines(usize),
    SkipToken,
    ReadObservation(String),
}

//==============================================================================
// Associate Functions
//==============================================================================

/// Parses every (instruction, output) pair, returning the observation
/// vector in `obs_names` order. Fails with [`Fail::ParseError`] if an
/// instruction cannot be satisfied or a required observation is never
/// produced.
pub fn parse_all(pairs: &[InstructionPair], obs_names: &Arc<Vec<String>>) -> Result<NamedVector> {
    let mut collected: HashMap<String, f64> = HashMap::new();
    for pair in pairs {
        parse_one(pair, &mut collected)?;
    }
    for name in obs_names.iter() {
        if !collected.contains_key(name) {
            return Err(Fail::ParseError {
                detail: format!("observation {:?} was never produced", name),
            });
        }
    }
    Ok(NamedVector::from_map(obs_names.clone(), &collected))
}

fn parse_one(pair: &InstructionPair, collected: &mut HashMap<String, f64>) -> Result<()> {
    let instructions = fs::read_to_string(&pair.instruction_path).map_err(|e| Fail::ParseError {
        detail: format!("reading {}: {}", pair.instruction_path.display(), e),
    })?;
    let output = fs::read_to_string(&pair.output_path).map_err(|e| Fail::ParseError {
        detail: format!("reading {}: {}", pair.output_path.display(), e),
    })?;
    let lines: Vec<&str> = output.lines().collect();
    let mut line_ix: usize = 0;
    let mut tokens: std::iter::Peekable<std::str::SplitWhitespace> = "".split_whitespace().peekable();

    for directive in parse_directives(&instructions)? {
        match directive {
            Directive::AdvanceLines(n) => {
                line_ix = line_ix
                    .checked_add(n)
                    .filter(|&ix| ix <= lines.len())
                    .ok_or_else(|| Fail::ParseError {
                        detail: format!("{}: advanced past end of output", pair.output_path.display()),
                    })?;
                let current_line = lines.get(line_ix.saturating_sub(1)).copied().unwrap_or("");
                tokens = current_line.split_whitespace().peekable();
            }
            Directive::SkipToken => {
                tokens.next();
            }
            Directive::ReadObservation(name) => {
                let token = next_token(&mut tokens, &lines, &mut line_ix, &pair.output_path)?;
                let value: f64 = token.parse().map_err(|_| Fail::ParseError {
                    detail: format!("observation {:?}: {:?} is not a number", name, token),
                })?;
                collected.insert(name, value);
            }
        }
    }
    Ok(())
}

/// Advances to the next whitespace token, pulling a new line in if the
/// current one is exhausted. Mirrors a `w`-then-value read across a line
/// break, which real instruction files rely on.
fn next_token<'a>(
    tokens: &mut std::iter::Peekable<std::str::SplitWhitespace<'a>>,
    lines: &[&'a str],
    line_ix: &mut usize,
    output_path: &std::path::Path,
) -> Result<&'a str> {
    loop {
        if let Some(tok) = tokens.next() {
            return Ok(tok);
        }
        if *line_ix >= lines.len() {
            return Err(Fail::ParseError {
                detail: format!("{}: ran out of output while reading a value", output_path.display()),
            });
        }
        *tokens = lines[*line_ix].split_whitespace().peekable();
        *line_ix += 1;
    }
}

fn parse_directives(text: &str) -> Result<Vec<Directive>> {
    let mut directives = Vec::new();
    for raw_line in text.lines() {
        let line = raw_line.trim();
        if line.is_empty() {
            continue;
        }
        for tok in line.split_whitespace() {
            if let Some(rest) = tok.strip_prefix('l') {
                let n: usize = rest.parse().map_err(|_| Fail::ParseError {
                    detail: format!("bad line-advance directive {:?}", tok),
                })?;
                directives.push(Directive::AdvanceLines(n));
            } else if tok == "w" {
                directives.push(Directive::SkipToken);
            } else if tok.starts_with('!') && tok.ends_with('!') && tok.len() > 2 {
                let name = tok[1..tok.len() - 1].to_string();
                directives.push(Directive::ReadObservation(name));
            } else {
                return Err(Fail::ParseError {
                    detail: format!("unrecognized instruction token {:?}", tok),
                });
            }
        }
    }
    Ok(directives)
}

//==============================================================================
// Unit Tests
//==============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn write_temp(contents: &str) -> NamedTempFile {
        let mut f = NamedTempFile::new().unwrap();
        f.write_all(contents.as_bytes()).unwrap();
        f
    }

    #[test]
    fn reads_a_single_observation_from_a_known_column() {
        let output = write_temp("head junk\nhk1 = 12.5 m/d\n");
        let instr = write_temp("l2 w w !hk1!\n");
        let pairs = vec![InstructionPair {
            instruction_path: instr.path().to_path_buf(),
            output_path: output.path().to_path_buf(),
        }];
        let names = Arc::new(vec!["hk1".to_string()]);
        let obs = parse_all(&pairs, &names).unwrap();
        assert_eq!(obs.get("hk1"), Some(12.5));
    }

    #[test]
    fn missing_observation_is_parse_error() {
        let output = write_temp("nothing here\n");
        let instr = write_temp("l1 w !hk1!\n");
        let pairs = vec![InstructionPair {
            instruction_path: instr.path().to_path_buf(),
            output_path: output.path().to_path_buf(),
        }];
        let names = Arc::new(vec!["hk1".to_string(), "hk2".to_string()]);
        let err = parse_all(&pairs, &names).unwrap_err();
        assert!(matches!(err, Fail::ParseError { .. }));
    }
}
