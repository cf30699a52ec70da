//! CLI command implementations for the `tether` binary.

pub mod check_config;
pub mod run;
