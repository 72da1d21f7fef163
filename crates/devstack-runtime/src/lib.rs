//! Resource lifecycle and topology orchestration for ceph-devstack.

#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used))]

pub mod container;
pub mod logs;
pub mod loop_device;
pub mod misc;
pub mod resource;
pub mod services;
pub mod ssh_key;
pub mod topology;
pub mod watch;
