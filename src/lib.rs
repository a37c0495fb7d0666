#![allow(unused_assignments)] // thiserror/miette proc macros trigger false positives

pub mod cli;
pub mod cloudinit;
pub mod config;
pub mod deps;
pub mod error;
pub mod image;
pub mod invocation;
pub mod launch;
pub mod liveness;
pub mod logging;
pub mod orchestrator;
pub mod paths;
pub mod util;
