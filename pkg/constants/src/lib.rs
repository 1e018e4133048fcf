//! Centralized constants for the fleetvm node agent.
//!
//! All project-wide constant values live here.
//! Change a value in one place and it applies everywhere.

pub mod network;
pub mod paths;
pub mod runtime;
pub mod state;
pub mod vm;
