// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

use crate::error::{Fail, Result};
use crate::vector::NamedVector;
use std::fs;
use std::path::PathBuf;

//==============================================================================
// Constants & Structures
//==============================================================================

/// One (template, input) pair. The marker character delimits a parameter
/// placeholder: `~parname~` in the template is replaced by the parameter's
/// current value, formatted to exactly fill the span between (and
/// including) the two markers.
#[derive(Clone, Debug)]
pub struct TemplatePair {
    pub marker: char,
    pub template_path: PathBuf,
    pub input_path: PathBuf,
}

//==============================================================================
// Associate Functions
//==============================================================================

/// Substitutes `parameters` into every template in `pairs`, writing each
/// input file. Fails with [`Fail::RenderError`] if a referenced parameter is
/// absent or a value cannot be formatted within its declared field width.
pub fn render_all(pairs: &[TemplatePair], parameters: &NamedVector) -> Result<()> {
    for pair in pairs {
        render_one(pair, parameters)?;
    }
    Ok(())
}

fn render_one(pair: &TemplatePair, parameters: &NamedVector) -> Result<()> {
    let text = fs::read_to_string(&pair.template_path).map_err(|e| Fail::RenderError {
        detail: format!("reading {}: {}", pair.template_path.display(), e),
    })?;
    let rendered = substitute(&text, pair.marker, parameters)?;
    fs::write(&pair.input_path, rendered).map_err(|e| Fail::RenderError {
        detail: format!("writing {}: {}", pair.input_path.display(), e),
    })?;
    Ok(())
}

fn substitute(text: &str, marker: char, parameters: &NamedVector) -> Result<String> {
    let mut out = String::with_capacity(text.len());
    let mut chars = text.char_indices().peekable();
    let bytes = text.as_bytes();
    while let Some((start, c)) = chars.next() {
        if c != marker {
            out.push(c);
            continue;
        }
        let close = text[start + c.len_utf8()..]
            .find(marker)
            .map(|rel| start + c.len_utf8() + rel)
            .ok_or_else(|| Fail::RenderError {
                detail: format!("unterminated placeholder at byte {}", start),
            })?;
        let name = text[start + c.len_utf8()..close].trim().to_string();
        let width = close + marker.len_utf8() - start;
        let value = parameters.get(&name).ok_or_else(|| Fail::RenderError {
            detail: format!("template references unknown parameter {:?}", name),
        })?;
        let field = format_field(value, width)?;
        out.push_str(&field);
        // advance the char iterator past the closing marker.
        while let Some(&(ix, _)) = chars.peek() {
            if ix >= close + marker.len_utf8() {
                break;
            }
            chars.next();
        }
        let _ = bytes;
    }
    Ok(out)
}

/// Formats `value` to fit exactly within `width` characters, trying
/// successively shorter precisions before giving up. Mirrors the original
/// template writer's practice of shrinking precision rather than truncating
/// digits off the front of a number.
fn format_field(value: f64, width: usize) -> Result<String> {
    if width == 0 {
        return Err(Fail::RenderError {
            detail: "zero-width placeholder".into(),
        });
    }
    for precision in (0..=12).rev() {
        let candidate = format!("{:.*}", precision, value);
        if candidate.len() <= width {
            let pad = width - candidate.len();
            return Ok(format!("{}{}", " ".repeat(pad), candidate));
        }
    }
    let exp = format!("{:e}", value);
    if exp.len() <= width {
        return Ok(format!("{}{}", " ".repeat(width - exp.len()), exp));
    }
    Err(Fail::RenderError {
        detail: format!("value {} cannot be formatted within {} columns", value, width),
    })
}

//==============================================================================
// Unit Tests
//==============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn params(pairs: &[(&str, f64)]) -> NamedVector {
        let names = Arc::new(pairs.iter().map(|(n, _)| n.to_string()).collect());
        let values = pairs.iter().map(|(_, v)| *v).collect();
        NamedVector::new(names, values).unwrap()
    }

    #[test]
    fn substitutes_single_placeholder() {
        let p = params(&[("k1", 3.5)]);
        let out = substitute("row1 ~k1       ~ end", '~', &p).unwrap();
        assert_eq!(out, "row1 3.500000000 end");
    }

    #[test]
    fn unknown_parameter_is_render_error() {
        let p = params(&[("k1", 1.0)]);
        let err = substitute("~missing~", '~', &p).unwrap_err();
        assert!(matches!(err, Fail::RenderError { .. }));
    }

    #[test]
    fn value_too_wide_is_render_error() {
        let p = params(&[("k1", 123456789.123456)]);
        let err = substitute("~k1~", '~', &p).unwrap_err();
        assert!(matches!(err, Fail::RenderError { .. }));
    }
}
