//! Discovery of compute hosts belonging to an environment.

mod ec2;

pub use ec2::Ec2Locator;

use async_trait::async_trait;

use crate::error::ControlResult;
use crate::types::{HostRole, TargetHost};

/// Finds running hosts tagged with an environment.
#[async_trait]
pub trait InstanceLocator: Send + Sync {
    /// List running hosts for `environment`.
    ///
    /// Relay hosts are returned with [`HostRole::RelayExcluded`]. When
    /// `via_relay` is set, addresses are private; otherwise the public
    /// address is preferred. An empty list is not an error here.
    async fn list(&self, environment: &str, via_relay: bool) -> ControlResult<Vec<TargetHost>>;
}

/// Classify a host by its name tag.
#[must_use]
pub fn classify_role(name: Option<&str>, relay_pattern: &str) -> HostRole {
    let pattern = relay_pattern.to_ascii_lowercase();
    match name {
        Some(name) if !pattern.is_empty() && name.to_ascii_lowercase().contains(&pattern) => {
            HostRole::RelayExcluded
        }
        _ => HostRole::Normal,
    }
}

/// Pick the address used to reach a host.
#[must_use]
pub fn select_address(
    public: Option<&str>,
    private: Option<&str>,
    via_relay: bool,
) -> Option<String> {
    fn non_empty(s: Option<&str>) -> Option<&str> {
        s.map(str::trim).filter(|s| !s.is_empty())
    }

    if via_relay {
        non_empty(private).map(ToOwned::to_owned)
    } else {
        non_empty(public)
            .or_else(|| non_empty(private))
            .map(ToOwned::to_owned)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relay_hosts_are_excluded_case_insensitively() {
        assert_eq!(classify_role(Some("prod-Bastion-1"), "bastion"), HostRole::RelayExcluded);
        assert_eq!(classify_role(Some("prod-web-1"), "bastion"), HostRole::Normal);
        assert_eq!(classify_role(None, "bastion"), HostRole::Normal);
        assert_eq!(classify_role(Some("anything"), ""), HostRole::Normal);
    }

    #[test]
    fn blank_addresses_are_skipped() {
        assert_eq!(
            select_address(Some("  "), Some(" 10.0.1.5 "), false).as_deref(),
            Some("10.0.1.5")
        );
        assert_eq!(select_address(Some("54.1.2.3"), Some(""), true), None);
        assert_eq!(select_address(None, None, false), None);
    }

    #[test]
    fn address_selection() {
        assert_eq!(
            select_address(Some("54.1.2.3"), Some("10.0.1.5"), true).as_deref(),
            Some("10.0.1.5")
        );
        assert_eq!(
            select_address(Some("54.1.2.3"), Some("10.0.1.5"), false).as_deref(),
            Some("54.1.2.3")
        );
        assert_eq!(
            select_address(None, Some("10.0.1.5"), false).as_deref(),
            Some("10.0.1.5")
        );
        assert_eq!(select_address(Some("54.1.2.3"), None, true), None);
    }
}
