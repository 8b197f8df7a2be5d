//! Brokered shell channels to target hosts.
//!
//! A [`ChannelBroker`] opens a [`Channel`] to one host, optionally through
//! a relay. Key material written to disk for a channel lives exactly as
//! long as the channel.

mod openssh;

pub use openssh::OpenSshBroker;

use async_trait::async_trait;

use crate::error::ControlResult;
use crate::process::CommandOutput;
use crate::types::{Credential, RelayHost, TargetHost};

/// An open command channel to one host.
#[async_trait]
pub trait Channel: Send + Sync {
    /// Address the channel reaches.
    fn target(&self) -> &str;

    /// Run a shell command on the host.
    ///
    /// A non-zero exit from the command is returned as output. Errors mean
    /// the channel itself failed.
    async fn run(&self, command: &str) -> ControlResult<CommandOutput>;
}

/// Opens channels to hosts.
#[async_trait]
pub trait ChannelBroker: Send + Sync {
    /// Connect to `host`, through `relay` when given.
    ///
    /// Authentication failures are permanent; connection timeouts and
    /// resets are transient.
    async fn connect(
        &self,
        host: &TargetHost,
        credential: &Credential,
        relay: Option<&RelayHost>,
    ) -> ControlResult<Box<dyn Channel>>;
}
