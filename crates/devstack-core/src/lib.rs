//! # devstack-core
//!
//! Host-facing primitives for ceph-devstack:
//! - **Command runner**: spawning external programs, draining their output,
//!   and turning nonzero exits into typed errors.
//! - **Host**: a capability interface over the runner with local and
//!   tunnelled (engine VM) variants, plus memoized kernel and engine queries.
//! - **Requirements**: the ordered chain of host checks gating every
//!   topology operation, with optional auto-remediation.

#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used))]

pub mod exec;
pub mod host;
pub mod requirements;
pub mod version;
