//! Integration tests for the host requirement chain.
//!
//! The chain runs against a tunnelled host backed by a recording runner so
//! every probe is scripted, including path checks.

#![allow(clippy::expect_used, clippy::unwrap_used)]

use std::path::Path;
use std::sync::Arc;

use devstack_common::config::RequirementsConfig;
use devstack_core::exec::{ProcessRunner, RecordingRunner};
use devstack_core::host::{LocalHost, RemoteHost};
use devstack_core::requirements::{Outcome, check_requirements};

const HEALTHY_INFO: &str = r#"{
    "host": {
        "os": "linux",
        "kernel": "6.8.5-301.fc40.x86_64",
        "cgroupVersion": "v2",
        "ociRuntime": {"name": "crun"}
    },
    "store": {"configFile": "/var/home/core/.config/containers/storage.conf", "graphDriverName": "overlay"},
    "version": {"Version": "5.0.2"}
}"#;

fn tunnel() -> Vec<String> {
    ["podman", "machine", "ssh", "--"]
        .iter()
        .map(ToString::to_string)
        .collect()
}

fn vm(args: &[&str]) -> Vec<String> {
    tunnel()
        .into_iter()
        .chain(args.iter().map(ToString::to_string))
        .collect()
}

/// A VM whose every probe succeeds.
fn healthy_runner() -> Arc<RecordingRunner> {
    let runner = Arc::new(RecordingRunner::new());
    runner.respond(["podman", "info"], 0, HEALTHY_INFO);
    runner.respond(vm(&["cat", "/sys/fs/selinux/enforce"]), 0, "0");
    runner.respond(vm(&["sysctl", "-b", "fs.aio-max-nr"]), 0, "1048576");
    runner.respond(vm(&["sysctl", "-b", "kernel.pid_max"]), 0, "4194304");
    runner
}

fn names(report: &devstack_core::requirements::Report) -> Vec<&'static str> {
    report.results.iter().map(|r| r.name).collect()
}

// ── Aggregate ────────────────────────────────────────────────────────

#[tokio::test]
async fn healthy_host_passes_every_check() {
    let runner = healthy_runner();
    let host = RemoteHost::new(runner, "podman", tunnel());
    let report = check_requirements(&host, &RequirementsConfig::default(), Path::new("."), false).await;
    assert!(report.passed(), "{report:?}");
    assert!(report.native_overlay);
    assert_eq!(
        names(&report),
        [
            "platform",
            "storage-driver",
            "fuse-overlayfs",
            "cgroup-v2",
            "oci-runtime",
            "dns-plugin",
            "fs.aio-max-nr",
            "kernel.pid_max",
            "sudo",
            "loop-control",
            "loop-control-writable",
        ]
    );
}

#[tokio::test]
async fn one_failure_fails_the_report() {
    let runner = healthy_runner();
    runner.respond(vm(&["sudo", "true"]), 1, "");
    let host = RemoteHost::new(runner, "podman", tunnel());
    let report = check_requirements(&host, &RequirementsConfig::default(), Path::new("."), false).await;
    assert!(!report.passed());
    let sudo = report.results.iter().find(|r| r.name == "sudo").unwrap();
    assert_eq!(sudo.outcome, Outcome::Unsatisfied);
}

// ── Short circuits ───────────────────────────────────────────────────

#[tokio::test]
async fn missing_engine_ends_the_chain() {
    let host = LocalHost::new(Arc::new(ProcessRunner), "no-such-container-engine");
    let report = check_requirements(&host, &RequirementsConfig::default(), Path::new("."), false).await;
    assert!(!report.passed());
    assert_eq!(names(&report), ["engine"]);
}

#[tokio::test]
async fn non_linux_engine_without_bridge_ends_the_chain() {
    let runner = Arc::new(RecordingRunner::new());
    runner.respond(
        ["podman", "info"],
        0,
        HEALTHY_INFO.replace("\"linux\"", "\"darwin\""),
    );
    let host = LocalHost::new(runner, "podman");
    let report = check_requirements(&host, &RequirementsConfig::default(), Path::new("."), false).await;
    assert!(!report.passed());
    assert_eq!(names(&report), ["platform"]);
}

#[tokio::test]
async fn missing_loop_control_skips_write_check() {
    let runner = healthy_runner();
    runner.respond(vm(&["test", "-e", "/dev/loop-control"]), 1, "");
    let host = RemoteHost::new(runner, "podman", tunnel());
    let report = check_requirements(&host, &RequirementsConfig::default(), Path::new("."), false).await;
    assert!(!report.passed());
    assert!(names(&report).contains(&"loop-control"));
    assert!(!names(&report).contains(&"loop-control-writable"));
}

// ── Remediation ──────────────────────────────────────────────────────

#[tokio::test]
async fn fix_mode_remediates_low_sysctl() {
    let runner = healthy_runner();
    runner.respond(vm(&["sysctl", "-b", "kernel.pid_max"]), 0, "32768");
    let host = RemoteHost::new(runner.clone(), "podman", tunnel());
    let report = check_requirements(&host, &RequirementsConfig::default(), Path::new("."), true).await;
    assert!(report.passed(), "{report:?}");
    let pid_max = report
        .results
        .iter()
        .find(|r| r.name == "kernel.pid_max")
        .unwrap();
    assert_eq!(pid_max.outcome, Outcome::Fixed);
    assert_eq!(
        runner.count(&[
            "podman",
            "machine",
            "ssh",
            "--",
            "sudo",
            "sysctl",
            "kernel.pid_max=4194304"
        ]),
        1
    );
}

#[tokio::test]
async fn failed_fix_fails_the_report() {
    let runner = healthy_runner();
    runner.respond(vm(&["sysctl", "-b", "kernel.pid_max"]), 0, "32768");
    runner.respond(vm(&["sudo", "sysctl"]), 1, "");
    let host = RemoteHost::new(runner, "podman", tunnel());
    let report = check_requirements(&host, &RequirementsConfig::default(), Path::new("."), true).await;
    assert!(!report.passed());
}

// ── SELinux ──────────────────────────────────────────────────────────

#[tokio::test]
async fn enforcing_selinux_adds_boolean_and_module_checks() {
    let runner = healthy_runner();
    runner.respond(vm(&["cat", "/sys/fs/selinux/enforce"]), 0, "1");
    runner.respond(
        vm(&["getsebool", "container_manage_cgroup"]),
        0,
        "container_manage_cgroup --> on\n",
    );
    runner.respond(
        vm(&["getsebool", "container_use_devices"]),
        0,
        "container_use_devices --> on\n",
    );
    runner.respond(vm(&["sudo", "semodule", "-l"]), 0, "ceph_devstack\n");
    let host = RemoteHost::new(runner, "podman", tunnel());
    let report = check_requirements(&host, &RequirementsConfig::default(), Path::new("."), false).await;
    assert!(report.passed(), "{report:?}");
    let names = names(&report);
    assert!(names.contains(&"container_manage_cgroup"));
    assert!(names.contains(&"container_use_devices"));
    assert_eq!(names.last(), Some(&"selinux-module"));
}

#[tokio::test]
async fn selinux_module_check_can_be_disabled() {
    let runner = healthy_runner();
    runner.respond(vm(&["cat", "/sys/fs/selinux/enforce"]), 0, "1");
    runner.respond(
        vm(&["getsebool"]),
        0,
        "x --> on\n",
    );
    let host = RemoteHost::new(runner, "podman", tunnel());
    let config = RequirementsConfig {
        selinux_module: false,
    };
    let report = check_requirements(&host, &config, Path::new("."), false).await;
    assert!(report.passed(), "{report:?}");
    assert!(!names(&report).contains(&"selinux-module"));
}
