//! Library surface behind the `cu` binary. Kept thin; almost everything
//! lives in `cu-core` and `cu-git`. This crate wires the CLI, config
//! resolution, and telemetry together.

pub mod cli;
pub mod paths;
pub mod telemetry;
