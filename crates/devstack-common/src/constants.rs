//! System-wide constants and default paths.

use std::path::PathBuf;

/// Application name used in config paths.
pub const APP_NAME: &str = "ceph-devstack";

/// Default container engine binary.
pub const DEFAULT_ENGINE: &str = "podman";

/// Default root for disk images and the test archive.
pub const DEFAULT_DATA_DIR: &str = "/tmp/ceph-devstack";

/// Command prefix that tunnels into the engine's managed VM.
pub const DEFAULT_TUNNEL_PREFIX: [&str; 4] = ["podman", "machine", "ssh", "--"];

/// Name of the engine network every container joins.
pub const NETWORK_NAME: &str = "ceph-devstack";

/// Name of the private half of the SSH key secret pair.
pub const SSH_KEY_SECRET: &str = "id_rsa";

/// Log file written by the test orchestrator for every job.
pub const JOB_LOG_FILE: &str = "teuthology.log";

/// Container label carrying the resolved test-node count.
pub const TESTNODE_COUNT_LABEL: &str = "testnode_count";

/// Port the web UI listens on.
pub const WEB_UI_PORT: u16 = 8081;

/// Loopback block device major number.
pub const LOOP_MAJOR: u32 = 7;

/// Loopback block device control node.
pub const LOOP_CONTROL: &str = "/dev/loop-control";

/// Engine DNS helper plugin.
pub const DNS_PLUGIN_PATH: &str = "/usr/libexec/cni/dnsname";

/// SELinux policy module required for nested rootless containers.
pub const SELINUX_MODULE: &str = "ceph_devstack";

/// Default location of the user configuration file, if a home is known.
pub fn default_config_path() -> Option<PathBuf> {
    std::env::var_os("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .or_else(|| std::env::var_os("HOME").map(|home| PathBuf::from(home).join(".config")))
        .map(|base| base.join(APP_NAME).join("config.yml"))
}
