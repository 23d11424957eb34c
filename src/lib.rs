// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Distributed model-evaluation run manager and worker agent (codename
//! Panther). A master accepts worker connections over TCP, dispatches
//! parameter sets to them, and collects observation vectors back; workers
//! run an external model once per dispatched run through a
//! template-render/execute/instruction-parse pipeline.
//!
//! Module map:
//! - [error]: the crate-wide error type.
//! - [ids]: newtype identifiers used across the wire protocol and run tables.
//! - [vector]: named parameter/observation vectors.
//! - [config]: run manager tunables.
//! - [codec]: the wire frame format.
//! - [transport]: blocking per-socket session used by the worker agent.
//! - [model]: render/execute/parse pipeline run by the worker agent.
//! - [master]: the event-loop-driven run manager.
//! - [agent]: the worker-side state machine.
//! - [schema]: control-file loading and validation.

pub mod agent;
pub mod codec;
pub mod config;
pub mod error;
pub mod ids;
pub mod master;
pub mod model;
pub mod schema;
pub mod transport;
pub mod vector;
