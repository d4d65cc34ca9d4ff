//! Deterministic, pure logic for provisioning.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! values (steps, the threaded environment) and return deterministic outputs
//! suitable for tests.

pub mod environment;
pub mod failure;
pub mod invariants;
pub mod lifecycle;
pub mod privilege;
pub mod step;
pub mod template;
