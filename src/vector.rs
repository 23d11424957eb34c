// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

use crate::error::{Fail, Result};
use std::collections::HashMap;

//==============================================================================
// Constants & Structures
//==============================================================================

/// An ordered, named vector of 64-bit values. Used both for parameter
/// vectors and observation vectors: the two have identical shape and differ
/// only in which name list they are built against (spec §3).
///
/// The name list is fixed once a [`NamedVector`] is constructed and is
/// always supplied from outside (the schema negotiated at handshake time);
/// this type never invents or reorders names.
#[derive(Clone, Debug, PartialEq)]
pub struct NamedVector {
    names: std::sync::Arc<Vec<String>>,
    values: Vec<f64>,
}

//==============================================================================
// Associate Functions
//==============================================================================

/// Associate functions for [NamedVector].
impl NamedVector {
    /// Builds a vector from a frozen name list and matching values, in
    /// declared order.
    pub fn new(names: std::sync::Arc<Vec<String>>, values: Vec<f64>) -> Result<Self> {
        if names.len() != values.len() {
            return Err(Fail::Corrupt {
                detail: format!(
                    "name/value length mismatch: {} names, {} values",
                    names.len(),
                    values.len()
                ),
            });
        }
        Ok(Self { names, values })
    }

    /// Builds a vector from a `name -> value` map, filling any name absent
    /// from `map` with `0.0`. Used by the model interface after parsing, and
    /// by tests that only care about a subset of observations.
    pub fn from_map(names: std::sync::Arc<Vec<String>>, map: &HashMap<String, f64>) -> Self {
        let values = names.iter().map(|n| map.get(n).copied().unwrap_or(0.0)).collect();
        Self { names, values }
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn values(&self) -> &[f64] {
        &self.values
    }

    pub fn get(&self, name: &str) -> Option<f64> {
        self.names.iter().position(|n| n == name).map(|ix| self.values[ix])
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}
