//! Channels over the system OpenSSH client.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tempfile::NamedTempFile;
use tracing::{debug, instrument};

use crate::error::{ControlError, ControlResult};
use crate::process::{CommandOutput, CommandRunner, CommandSpec};
use crate::types::{Credential, RelayHost, TargetHost};

use super::{Channel, ChannelBroker};

const SSH_FAILURE_EXIT: i32 = 255;

const PERMANENT_SSH_MARKERS: &[&str] = &[
    "permission denied",
    "host key verification failed",
    "could not resolve hostname",
    "no such identity",
    "invalid format",
    "bad permissions",
];

/// Classify an `ssh` failure (exit 255) from its error output.
#[must_use]
pub fn classify_ssh_failure(target: &str, stderr: &str) -> ControlError {
    let message = crate::process::tail(stderr, 800).to_owned();
    let lowered = stderr.to_ascii_lowercase();
    if PERMANENT_SSH_MARKERS.iter().any(|m| lowered.contains(m)) {
        ControlError::permanent("ssh connect", target, message)
    } else {
        ControlError::transient("ssh connect", target, message)
    }
}

/// Private key as a path `ssh -i` can read.
///
/// Inline material is written to an owner-only temp file that is removed
/// on drop.
enum KeyFile {
    Existing(PathBuf),
    Materialised(NamedTempFile),
}

impl KeyFile {
    fn prepare(credential: &Credential) -> ControlResult<Self> {
        match credential {
            Credential::KeyFile(path) => {
                if path.is_file() {
                    Ok(Self::Existing(path.clone()))
                } else {
                    Err(ControlError::permanent(
                        "load credential",
                        path.display().to_string(),
                        "key file not found",
                    ))
                }
            }
            Credential::KeyMaterial(material) => {
                let mut file = tempfile::Builder::new()
                    .prefix("tideway-key-")
                    .tempfile()
                    .map_err(|e| ControlError::internal(format!("key file: {e}")))?;
                let mut contents = material.trim().to_owned();
                contents.push('\n');
                file.write_all(contents.as_bytes())
                    .and_then(|()| file.flush())
                    .map_err(|e| ControlError::internal(format!("key file: {e}")))?;
                Ok(Self::Materialised(file))
            }
        }
    }

    fn path(&self) -> &Path {
        match self {
            Self::Existing(path) => path,
            Self::Materialised(file) => file.path(),
        }
    }
}

/// Options shared by the target and relay hops.
fn common_options(key: &Path, known_hosts: &Path, connect_timeout: Duration) -> Vec<String> {
    vec![
        "-o".into(),
        "StrictHostKeyChecking=no".into(),
        "-o".into(),
        format!("UserKnownHostsFile={}", known_hosts.display()),
        "-o".into(),
        format!("ConnectTimeout={}", connect_timeout.as_secs()),
        "-o".into(),
        "BatchMode=yes".into(),
        "-o".into(),
        "IdentitiesOnly=yes".into(),
        "-i".into(),
        key.display().to_string(),
    ]
}

/// Build the `ssh` argument list up to (not including) the remote command.
#[must_use]
pub fn ssh_args(
    user: &str,
    address: &str,
    key: &Path,
    known_hosts: &Path,
    connect_timeout: Duration,
    relay: Option<&RelayHost>,
) -> Vec<String> {
    let mut args = common_options(key, known_hosts, connect_timeout);
    if let Some(relay) = relay {
        let hop = common_options(key, known_hosts, connect_timeout).join(" ");
        args.push("-o".into());
        args.push(format!(
            "ProxyCommand=ssh {hop} -W %h:%p -p {} {}@{}",
            relay.port, relay.user, relay.address
        ));
    }
    args.push(format!("{user}@{address}"));
    args
}

/// Opens channels by invoking the `ssh` client.
#[derive(Clone)]
pub struct OpenSshBroker {
    runner: Arc<dyn CommandRunner>,
    user: String,
    connect_timeout: Duration,
    command_timeout: Duration,
}

impl OpenSshBroker {
    /// Create a broker logging in as `user`.
    #[must_use]
    pub fn new(
        runner: Arc<dyn CommandRunner>,
        user: impl Into<String>,
        connect_timeout: Duration,
        command_timeout: Duration,
    ) -> Self {
        Self {
            runner,
            user: user.into(),
            connect_timeout,
            command_timeout,
        }
    }
}

impl std::fmt::Debug for OpenSshBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenSshBroker")
            .field("user", &self.user)
            .field("connect_timeout", &self.connect_timeout)
            .field("command_timeout", &self.command_timeout)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl ChannelBroker for OpenSshBroker {
    #[instrument(skip_all, fields(host = %host.address, relay = relay.map(|r| r.address.as_str())))]
    async fn connect(
        &self,
        host: &TargetHost,
        credential: &Credential,
        relay: Option<&RelayHost>,
    ) -> ControlResult<Box<dyn Channel>> {
        let key = KeyFile::prepare(credential)?;
        let known_hosts = NamedTempFile::new()
            .map_err(|e| ControlError::internal(format!("known hosts file: {e}")))?;

        let args = ssh_args(
            &self.user,
            &host.address,
            key.path(),
            known_hosts.path(),
            self.connect_timeout,
            relay,
        );

        let channel = OpenSshChannel {
            runner: Arc::clone(&self.runner),
            target: host.address.clone(),
            args,
            command_timeout: self.command_timeout,
            _key: key,
            _known_hosts: known_hosts,
        };

        // Probe so authentication problems surface before any real work.
        let probe = channel
            .invoke("true", self.connect_timeout + Duration::from_secs(5))
            .await?;
        if !probe.success() {
            return Err(ControlError::transient(
                "ssh connect",
                &host.address,
                format!("probe exited {}", probe.exit_code),
            ));
        }

        debug!("channel open");
        Ok(Box::new(channel))
    }
}

struct OpenSshChannel {
    runner: Arc<dyn CommandRunner>,
    target: String,
    args: Vec<String>,
    command_timeout: Duration,
    _key: KeyFile,
    _known_hosts: NamedTempFile,
}

impl OpenSshChannel {
    async fn invoke(&self, command: &str, limit: Duration) -> ControlResult<CommandOutput> {
        let spec = CommandSpec::new("ssh")
            .args(self.args.iter().cloned())
            .arg(command)
            .timeout(limit);

        let output = self.runner.run(&spec).await.map_err(|e| match e {
            ControlError::Timeout { limit, .. } => ControlError::Timeout {
                operation: format!("ssh to {}", self.target),
                limit,
            },
            other => other,
        })?;

        if output.exit_code == SSH_FAILURE_EXIT {
            return Err(classify_ssh_failure(&self.target, &output.stderr));
        }
        Ok(output)
    }
}

#[async_trait]
impl Channel for OpenSshChannel {
    fn target(&self) -> &str {
        &self.target
    }

    async fn run(&self, command: &str) -> ControlResult<CommandOutput> {
        self.invoke(command, self.command_timeout).await
    }
}
