//! Per-kind container definitions.
//!
//! Each service contributes the flags of its `container create` command,
//! its default environment, and how its image is built from a local
//! checkout. The rest of the create command line is shared.

use std::path::Path;

use devstack_common::constants::{NETWORK_NAME, SSH_KEY_SECRET};
use devstack_common::types::{Action, EnvMap, ServiceKind};

use crate::resource::TemplateSet;

/// Postgres credentials the results API connects with.
pub const APP_DB_USER: &str = "admin";
/// Password for [`APP_DB_USER`].
pub const APP_DB_PASS: &str = "password";
/// Database holding results.
pub const APP_DB_NAME: &str = "paddles";
/// Port the results API listens on.
pub const PADDLES_PORT: u16 = 8080;

const TESTNODE_CAPABILITIES: [&str; 11] = [
    "SYS_ADMIN",
    "NET_ADMIN",
    "SYS_TIME",
    "SYS_RAWIO",
    "MKNOD",
    "NET_RAW",
    "SETUID",
    "SETGID",
    "CHOWN",
    "SYS_PTRACE",
    "SYS_TTY_CONFIG",
];

/// How to create one kind of container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceDefinition {
    /// The service this describes.
    pub kind: ServiceKind,
    /// Flags between `container create` and `--name`.
    pub flags: Vec<String>,
    /// Default environment before wiring and host overrides.
    pub env: EnvMap,
    /// Build arguments after `build -t {image}`; the last is the context.
    pub build_args: Vec<String>,
    /// Build context shipped with ceph-devstack, used when no checkout is
    /// configured.
    pub bundled_context: Option<String>,
    /// Whether the archive directory must exist before creation.
    pub needs_archive_dir: bool,
}

fn strings(args: &[&str]) -> Vec<String> {
    args.iter().map(ToString::to_string).collect()
}

fn source_path(source_dir: &Path, relative: &str) -> String {
    source_dir.join(relative).display().to_string()
}

fn health(cmd: &str, interval: &str, retries: &str) -> Vec<String> {
    strings(&[
        "--health-cmd",
        cmd,
        "--health-interval",
        interval,
        "--health-retries",
        retries,
        "--health-timeout",
        "5s",
    ])
}

impl ServiceDefinition {
    /// Definition of `kind`. Bind mounts of bundled files resolve against
    /// `source_dir`.
    pub fn of(kind: ServiceKind, source_dir: &Path) -> Self {
        let mut flags = strings(&["-i", "--network", NETWORK_NAME]);
        let mut build_args = strings(&["{repo}"]);
        let mut bundled_context = None;
        let mut needs_archive_dir = false;
        let env: EnvMap = match kind {
            ServiceKind::Postgres => {
                flags.extend([
                    "-v".to_string(),
                    format!(
                        "{}:/docker-entrypoint-initdb.d/",
                        source_path(source_dir, "containers/postgres/db")
                    ),
                ]);
                flags.extend(strings(&["-p", "5432:5432"]));
                flags.extend(health(
                    &format!("CMD pg_isready -q -d {APP_DB_NAME} -U {APP_DB_USER}"),
                    "10s",
                    "2",
                ));
                [
                    ("POSTGRES_USER", "root"),
                    ("POSTGRES_PASSWORD", "password"),
                    ("APP_DB_USER", APP_DB_USER),
                    ("APP_DB_PASS", APP_DB_PASS),
                    ("APP_DB_NAME", APP_DB_NAME),
                ]
                .into_iter()
                .collect()
            }
            ServiceKind::Paddles => {
                flags.extend(strings(&["-p", "8080:8080"]));
                flags.extend(health("CMD curl -f http://0.0.0.0:8080", "1s", "30"));
                [
                    ("PADDLES_SERVER_HOST", "0.0.0.0".to_string()),
                    ("PADDLES_SQLALCHEMY_URL", postgres_url("postgres")),
                ]
                .into_iter()
                .collect()
            }
            ServiceKind::Beanstalk => {
                flags.extend(strings(&["-p", "11300:11300"]));
                bundled_context = Some(source_path(source_dir, "containers/beanstalk/alpine"));
                EnvMap::new()
            }
            ServiceKind::Pulpito => {
                flags.extend(strings(&["-p", "8081:8081"]));
                flags.extend(health("CMD curl -f http://0.0.0.0:8081", "10s", "2"));
                [("PULPITO_PADDLES_ADDRESS", paddles_url("paddles"))]
                    .into_iter()
                    .collect()
            }
            ServiceKind::Teuthology => {
                needs_archive_dir = true;
                flags.extend(["--secret".to_string(), SSH_KEY_SECRET.to_string()]);
                flags.extend([
                    "-v".to_string(),
                    format!(
                        "{}:/teuthology.sh",
                        source_path(source_dir, "containers/teuthology-dev/teuthology.sh")
                    ),
                ]);
                flags.extend(strings(&["-v", "{archive_dir}:/archive_dir"]));
                build_args = vec![
                    "-f".into(),
                    source_path(source_dir, "containers/teuthology-dev/Containerfile"),
                    "{repo}".into(),
                ];
                bundled_context = Some(source_dir.display().to_string());
                [
                    "SSH_PRIVKEY",
                    "SSH_PRIVKEY_FILE",
                    "MACHINE_TYPE",
                    "TESTNODES",
                    "TEUTHOLOGY_WAIT",
                    "TEUTHOLOGY_SUITE",
                    "TEUTH_BRANCH",
                    "PADDLES_URL",
                ]
                .into_iter()
                .map(|k| (k, String::new()))
                .collect()
            }
            ServiceKind::TestNode => {
                flags.insert(0, "--rm".into());
                flags.extend(strings(&[
                    "--cgroupns=host",
                    "--secret",
                    &format!("{SSH_KEY_SECRET}.pub"),
                    "-p",
                    "22",
                    "--cap-add",
                    &TESTNODE_CAPABILITIES.join(","),
                    "--security-opt",
                    "unmask=/sys/dev/block",
                    "-v",
                    "/sys/dev/block:/sys/dev/block",
                    "-v",
                    "/sys/fs/cgroup:/sys/fs/cgroup",
                    "-v",
                    "/dev/fuse:/dev/fuse",
                    "-v",
                    "/dev/disk:/dev/disk",
                    // cephadm reads these; empty files are enough
                    "-v",
                    "/dev/null:/sys/class/dmi/id/board_serial",
                    "-v",
                    "/dev/null:/sys/class/dmi/id/chassis_serial",
                    "-v",
                    "/dev/null:/sys/class/dmi/id/product_serial",
                    "--device",
                    "/dev/net/tun",
                ]));
                bundled_context = Some(source_path(source_dir, "containers/testnode"));
                [("SSH_PUBKEY", ""), ("CEPH_VOLUME_ALLOW_LOOP_DEVICES", "true")]
                    .into_iter()
                    .collect()
            }
            ServiceKind::Archive => {
                needs_archive_dir = true;
                flags.extend(strings(&[
                    "-p",
                    "8000:80",
                    "-v",
                    "{archive_dir}:/usr/local/apache2/htdocs/",
                ]));
                EnvMap::new()
            }
        };
        Self {
            kind,
            flags,
            env,
            build_args,
            bundled_context,
            needs_archive_dir,
        }
    }

    /// Command templates for one replica. `extra` lands after the kind's
    /// own flags, before `--name`.
    pub fn templates(&self, engine: &str, extra: &[String]) -> TemplateSet {
        let mut create = strings(&[engine, "container", "create"]);
        create.extend(self.flags.iter().cloned());
        create.extend(extra.iter().cloned());
        create.extend(strings(&["--name", "{name}", "{image}"]));

        let mut build = strings(&[engine, "build", "-t", "{image}"]);
        build.extend(self.build_args.iter().cloned());

        TemplateSet::new()
            .with_inspect([engine, "container", "inspect", "{name}"])
            .with(Action::Pull, [engine, "pull", "{image}"])
            .with(Action::Build, build)
            .with(Action::Create, create)
            .with(Action::Start, [engine, "container", "start", "{name}"])
            .with(Action::Stop, [engine, "container", "stop", "{name}"])
            .with(Action::Remove, [engine, "container", "rm", "-f", "{name}"])
    }
}

/// Connection string for the results database on container `postgres`.
pub fn postgres_url(postgres: &str) -> String {
    format!("postgresql+psycopg2://{APP_DB_USER}:{APP_DB_PASS}@{postgres}:5432/{APP_DB_NAME}")
}

/// Base URL of the results API on container `paddles`.
pub fn paddles_url(paddles: &str) -> String {
    format!("http://{paddles}:{PADDLES_PORT}")
}
