//! Loopback block devices backing test-node disks.

use std::path::{Path, PathBuf};

use devstack_common::constants::{LOOP_CONTROL, LOOP_MAJOR};
use devstack_common::error::{DevstackError, Result};
use devstack_core::exec::{Command, CommandOutput};
use devstack_core::host::Host;

/// One loop device node and its sparse backing file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopDevice {
    minor: u32,
    device: PathBuf,
    image: PathBuf,
    size_gb: u64,
}

impl LoopDevice {
    /// Device `slot` of replica `ordinal`, where every replica owns
    /// `per_replica` consecutive minors.
    pub fn for_replica(
        replica: &str,
        ordinal: u32,
        per_replica: u32,
        slot: u32,
        image_dir: &Path,
        size_gb: u64,
    ) -> Self {
        let minor = ordinal * per_replica + slot;
        Self {
            minor,
            device: PathBuf::from(format!("/dev/loop{minor}")),
            image: image_dir.join(format!("{replica}-{slot}")),
            size_gb,
        }
    }

    /// Device node path.
    pub fn device(&self) -> &Path {
        &self.device
    }

    /// Backing file path.
    pub fn image(&self) -> &Path {
        &self.image
    }

    fn device_arg(&self) -> String {
        self.device.display().to_string()
    }

    fn image_arg(&self) -> String {
        self.image.display().to_string()
    }

    async fn mknod(&self, host: &dyn Host) -> Result<bool> {
        let output = host
            .run(Command::new([
                "sudo".to_string(),
                "mknod".into(),
                "-m700".into(),
                self.device_arg(),
                "b".into(),
                LOOP_MAJOR.to_string(),
                self.minor.to_string(),
            ]))
            .await?;
        Ok(output.success())
    }

    fn mknod_failed(&self) -> DevstackError {
        DevstackError::ProcessFailed {
            command: format!(
                "sudo mknod -m700 {} b {LOOP_MAJOR} {}",
                self.device_arg(),
                self.minor
            ),
            code: 1,
            stderr: String::new(),
        }
    }

    /// Creates the node, attaches a fresh sparse backing file, and hands
    /// the node to the invoking user. Stale state is removed first.
    ///
    /// # Errors
    ///
    /// Returns `ProcessFailed` for the first privileged step that fails.
    pub async fn create(&self, host: &dyn Host) -> Result<()> {
        self.remove(host).await;
        if let Some(dir) = self.image.parent() {
            let dir = dir.display().to_string();
            let _ = host
                .run(Command::new(["mkdir", "-p", dir.as_str()]))
                .await?
                .check()?;
        }
        if !self.mknod(host).await? {
            if host.path_exists(Path::new(LOOP_CONTROL)).await {
                return Err(self.mknod_failed());
            }
            tracing::info!("loop module not loaded; loading it");
            let _ = host
                .run(Command::new(["sudo", "modprobe", "loop"]))
                .await?
                .check()?;
            if !self.mknod(host).await? {
                return Err(self.mknod_failed());
            }
        }
        let owner = format!(
            "{}:{}",
            nix::unistd::getuid().as_raw(),
            nix::unistd::getgid().as_raw()
        );
        let steps = [
            vec!["sudo".to_string(), "chown".into(), owner, self.device_arg()],
            vec![
                "sudo".into(),
                "dd".into(),
                "if=/dev/null".into(),
                format!("of={}", self.image_arg()),
                "bs=1".into(),
                "count=0".into(),
                format!("seek={}G", self.size_gb),
            ],
            vec![
                "sudo".into(),
                "losetup".into(),
                self.device_arg(),
                self.image_arg(),
            ],
        ];
        for step in steps {
            let _ = host.run(Command::new(step)).await?.check()?;
        }
        tracing::debug!(
            device = %self.device.display(),
            image = %self.image.display(),
            "loop device ready"
        );
        Ok(())
    }

    /// Detaches and deletes the node and its backing file, unmounting
    /// first when needed. Every step tolerates already-removed state.
    pub async fn remove(&self, host: &dyn Host) {
        let device = self.device_arg();
        if self.is_mounted(host).await {
            run_logged(host, &["sudo", "umount", device.as_str()]).await;
        }
        if host.path_exists(&self.device).await {
            run_logged(host, &["sudo", "losetup", "-d", device.as_str()]).await;
            run_logged(host, &["sudo", "rm", "-f", device.as_str()]).await;
        }
        let image = self.image_arg();
        run_logged(host, &["sudo", "rm", "-f", image.as_str()]).await;
    }

    async fn is_mounted(&self, host: &dyn Host) -> bool {
        let device = self.device_arg();
        match host.run(Command::new(["mount"])).await {
            Ok(output) => output
                .stdout
                .lines()
                .any(|line| line.split_whitespace().next() == Some(device.as_str())),
            Err(_) => false,
        }
    }
}

async fn run_logged(host: &dyn Host, args: &[&str]) {
    let command = Command::new(args.iter().copied());
    if let Err(e) = host.run(command).await.and_then(CommandOutput::check) {
        tracing::debug!(error = %e, "loop device cleanup step failed");
    }
}
