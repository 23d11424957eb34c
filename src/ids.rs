// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

use derive_more::{Display, From};

//==============================================================================
// Constants & Structures
//==============================================================================

/// Identifier for a [`crate::master::run::Run`], monotonically assigned by
/// the master and unique within a session.
#[derive(Clone, Copy, Debug, Display, From, Eq, PartialEq, Hash, PartialOrd, Ord)]
pub struct RunId(pub i32);

/// Opaque batch tag attached to a run by the driver. The run manager never
/// interprets it.
#[derive(Clone, Copy, Debug, Display, From, Eq, PartialEq, Hash)]
pub struct GroupId(pub i32);

/// Index into the master's worker slab. Not part of the wire protocol.
#[derive(Clone, Copy, Debug, Display, From, Eq, PartialEq, Hash)]
pub struct WorkerId(pub usize);
