//! Sequential provisioner for binary-analysis environments.
//!
//! A plan is an ordered list of steps (package installs, downloads, clones,
//! builds, account and environment changes). Steps run strictly in order
//! against an explicitly threaded [`Environment`](core::environment::Environment);
//! the first failure stops the run. The crate is layered:
//!
//! - **[`core`]**: Pure, deterministic logic (step model, environment,
//!   privilege wrapping, templates, invariants, lifecycle). No I/O.
//! - **[`io`]**: Side-effecting operations (process execution, capability
//!   tools, plan/config files, run records).
//!
//! Orchestration modules ([`provisioner`], [`run`], [`exec`]) coordinate core
//! logic with I/O to implement CLI commands.

pub mod core;
pub mod exec;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod provisioner;
pub mod run;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
