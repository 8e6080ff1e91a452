//! CLI command implementations.
//!
//! Each submodule implements a sandboxd CLI command with pure core logic
//! separated from IO for testability.

pub mod clean;
pub mod init;
pub mod run;
pub mod status;
