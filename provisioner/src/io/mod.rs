//! Side-effecting operations: processes, capability tools, files on disk.

pub mod config;
pub mod host;
pub mod plan;
pub mod process;
pub mod run_log;
pub mod runner;
pub mod tools;
