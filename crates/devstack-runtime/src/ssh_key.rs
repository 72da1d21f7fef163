//! The SSH key pair shared by the orchestrator and the test nodes.
//!
//! Stored as two engine secrets: the private half for the orchestrator and
//! the `.pub` half for test nodes. `secret create` reads key files on the
//! engine client's side, so key files are generated and checked there even
//! when other host commands are tunnelled into a VM.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use devstack_common::constants::SSH_KEY_SECRET;
use devstack_common::error::{DevstackError, Result};
use devstack_common::types::Action;
use devstack_core::exec::{Command, CommandOutput};
use devstack_core::host::Host;
use tempfile::TempDir;

use crate::misc::secret;
use crate::resource::{Attr, Lifecycle, Resource, RunContext};

/// Key files on disk. Generated keys live in a temporary directory that is
/// deleted once the secrets are registered.
struct KeyFiles {
    private: PathBuf,
    public: PathBuf,
    _scratch: Option<TempDir>,
}

/// Private and public SSH key secrets.
#[derive(Debug)]
pub struct SshKeyPair {
    name: String,
    privkey: Option<PathBuf>,
    host: Arc<dyn Host>,
}

impl SshKeyPair {
    /// `privkey` is an existing private key to register; without one a
    /// fresh pair is generated.
    pub fn new(privkey: Option<PathBuf>, host: Arc<dyn Host>) -> Self {
        Self {
            name: SSH_KEY_SECRET.to_string(),
            privkey,
            host,
        }
    }

    fn public_name(&self) -> String {
        format!("{}.pub", self.name)
    }

    fn halves(&self, keys: Option<&KeyFiles>) -> [Resource; 2] {
        let (private, public) = keys.map_or_else(
            || (Path::new(""), Path::new("")),
            |k| (k.private.as_path(), k.public.as_path()),
        );
        [
            secret(&self.name, Attr::PrivkeyPath, private, Arc::clone(&self.host)),
            secret(
                &self.public_name(),
                Attr::PubkeyPath,
                public,
                Arc::clone(&self.host),
            ),
        ]
    }

    async fn key_files(&self) -> Result<KeyFiles> {
        let supplied = self
            .privkey
            .clone()
            .or_else(|| std::env::var_os("SSH_PRIVKEY_PATH").map(PathBuf::from));
        match supplied {
            Some(private) => self.existing_key(private).await,
            None => self.generate().await,
        }
    }

    async fn existing_key(&self, private: PathBuf) -> Result<KeyFiles> {
        let mut public = private.clone().into_os_string();
        public.push(".pub");
        let public = PathBuf::from(public);
        if tokio::fs::try_exists(&public).await.unwrap_or(false) {
            return Ok(KeyFiles {
                private,
                public,
                _scratch: None,
            });
        }
        tracing::debug!(key = %private.display(), "deriving public key");
        let derived = self
            .local(Command::new([
                "ssh-keygen",
                "-y",
                "-f",
                private.to_string_lossy().as_ref(),
            ]))
            .await?;
        let scratch = scratch_dir()?;
        let public = scratch.path().join("id_rsa.pub");
        tokio::fs::write(&public, derived.stdout)
            .await
            .map_err(|e| DevstackError::io(&public, e))?;
        Ok(KeyFiles {
            private,
            public,
            _scratch: Some(scratch),
        })
    }

    /// Runs `command` beside the engine client, never tunnelled.
    async fn local(&self, command: Command) -> Result<CommandOutput> {
        self.host.runner().run(&command).await?.check()
    }

    async fn generate(&self) -> Result<KeyFiles> {
        let scratch = scratch_dir()?;
        let private = scratch.path().join("id_rsa");
        let private_arg = private.to_string_lossy().into_owned();
        tracing::info!("generating SSH key pair");
        let _ = self
            .local(Command::new([
                "ssh-keygen",
                "-q",
                "-t",
                "rsa",
                "-N",
                "",
                "-f",
                private_arg.as_str(),
            ]))
            .await?;
        Ok(KeyFiles {
            public: scratch.path().join("id_rsa.pub"),
            private,
            _scratch: Some(scratch),
        })
    }
}

fn scratch_dir() -> Result<TempDir> {
    tempfile::Builder::new()
        .prefix("teuthology-ssh-key-")
        .tempdir()
        .map_err(|e| DevstackError::io(std::env::temp_dir(), e))
}

#[async_trait]
impl Lifecycle for SshKeyPair {
    fn name(&self) -> &str {
        &self.name
    }

    async fn create(&self, _ctx: &RunContext) -> Result<()> {
        if Lifecycle::exists(self).await? {
            tracing::debug!(name = %self.name, "key pair already registered");
            return Ok(());
        }
        let keys = self.key_files().await?;
        for half in self.halves(Some(&keys)) {
            if half.exists().await? {
                tracing::debug!(name = %half.name(), "replacing stale half of key pair");
                half.remove().await;
            }
            half.run_action(Action::Create).await?;
        }
        Ok(())
    }

    async fn start(&self, _ctx: &RunContext) -> Result<()> {
        Ok(())
    }

    async fn stop(&self, _ctx: &RunContext) -> Result<()> {
        Ok(())
    }

    async fn remove(&self, _ctx: &RunContext) -> Result<()> {
        for half in self.halves(None) {
            half.remove().await;
        }
        Ok(())
    }

    async fn exists(&self) -> Result<bool> {
        for half in self.halves(None) {
            if !half.exists().await? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    async fn is_running(&self) -> Result<bool> {
        Lifecycle::exists(self).await
    }
}

#[cfg(test)]
mod tests {
    use devstack_core::exec::RecordingRunner;
    use devstack_core::host::{LocalHost, RemoteHost};
    use tokio_util::sync::CancellationToken;

    use super::*;

    fn ctx() -> RunContext {
        let config = devstack_common::config::DevstackConfig::default();
        RunContext::new(&config, CancellationToken::new())
    }

    #[tokio::test]
    async fn existing_pair_is_left_alone() {
        let runner = Arc::new(RecordingRunner::new());
        let host: Arc<dyn Host> = Arc::new(LocalHost::new(runner.clone(), "podman"));
        let pair = SshKeyPair::new(None, host);
        pair.create(&ctx()).await.unwrap();
        assert_eq!(runner.count(&["podman", "secret", "inspect"]), 2);
        assert_eq!(runner.count(&["podman", "secret", "create"]), 0);
        assert_eq!(runner.count(&["ssh-keygen"]), 0);
    }

    #[tokio::test]
    async fn missing_pair_is_generated_and_registered() {
        let runner = Arc::new(RecordingRunner::new());
        runner.respond(["podman", "secret", "inspect", "id_rsa.pub"], 1, "");
        let host: Arc<dyn Host> = Arc::new(LocalHost::new(runner.clone(), "podman"));
        let pair = SshKeyPair::new(None, host);
        pair.create(&ctx()).await.unwrap();
        assert_eq!(runner.count(&["ssh-keygen"]), 1);
        let calls = runner.calls();
        let creates: Vec<_> = calls
            .iter()
            .filter(|c| c.starts_with(&["podman".to_string(), "secret".into(), "create".into()]))
            .collect();
        assert_eq!(creates.len(), 2);
        assert_eq!(creates[0][3], "id_rsa");
        assert!(creates[0][4].ends_with("/id_rsa"));
        assert_eq!(creates[1][3], "id_rsa.pub");
        assert!(creates[1][4].ends_with("/id_rsa.pub"));
    }

    #[tokio::test]
    async fn supplied_key_with_public_half_is_used_directly() {
        let dir = tempfile::tempdir().unwrap();
        let private = dir.path().join("mykey");
        std::fs::write(&private, "private").unwrap();
        std::fs::write(dir.path().join("mykey.pub"), "public").unwrap();
        let runner = Arc::new(RecordingRunner::new().with_default_code(1));
        runner.respond(["podman", "secret", "create"], 0, "");
        let host: Arc<dyn Host> = Arc::new(LocalHost::new(runner.clone(), "podman"));
        let pair = SshKeyPair::new(Some(private.clone()), host);
        pair.create(&ctx()).await.unwrap();
        assert_eq!(runner.count(&["ssh-keygen"]), 0);
        let calls = runner.calls();
        let last = calls.last().unwrap();
        assert_eq!(last[4], format!("{}.pub", private.display()));
    }

    #[tokio::test]
    async fn keys_are_generated_beside_the_engine_client() {
        let runner = Arc::new(RecordingRunner::new());
        runner.respond(["podman", "secret", "inspect", "id_rsa"], 1, "");
        let prefix = ["podman", "machine", "ssh", "--"].map(String::from).to_vec();
        let host: Arc<dyn Host> = Arc::new(RemoteHost::new(runner.clone(), "podman", prefix));
        SshKeyPair::new(None, host).create(&ctx()).await.unwrap();
        assert_eq!(runner.count(&["ssh-keygen", "-q", "-t", "rsa"]), 1);
        assert_eq!(runner.count(&["podman", "machine", "ssh"]), 0);
        assert_eq!(runner.count(&["podman", "secret", "create"]), 2);
    }

    #[tokio::test]
    async fn remove_deletes_both_halves() {
        let runner = Arc::new(RecordingRunner::new().with_default_code(1));
        let host: Arc<dyn Host> = Arc::new(LocalHost::new(runner.clone(), "podman"));
        SshKeyPair::new(None, host).remove(&ctx()).await.unwrap();
        assert_eq!(
            runner.calls(),
            vec![
                vec!["podman", "secret", "rm", "id_rsa"],
                vec!["podman", "secret", "rm", "id_rsa.pub"],
            ]
        );
    }
}
