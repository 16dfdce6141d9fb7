//! Policy routes and the `route_localnet` sysctl.
//!
//! Two `ip rule` entries per family steer traffic around the VPN default
//! route: LAN destinations stay on the main table, and forwarded-and-marked
//! packets divert to the forwarded table.

use super::{Firewall, Logs, ShellOps};
use crate::fwmark;
use crate::routing::{self, priorities};

const ROUTE_LOCALNET_SYSCTL: &str = "net.ipv4.conf.all.route_localnet";

impl<S: ShellOps> Firewall<S> {
    pub(super) async fn install_policy_routes(&self) {
        // LAN destinations must keep using the main table: split tunnel
        // would otherwise send LAN traffic to the default gateway, and
        // wireguard would send it into the tunnel. suppress_prefixlength 1
        // (not the typical 0) also suppresses OpenVPN's /1 gateway override
        // routes.
        for ip in ["ip", "ip -6"] {
            self.shell
                .bash(
                    &format!(
                        "{ip} rule add lookup main suppress_prefixlength 1 prio {}",
                        priorities::SUPPRESSED_MAIN
                    ),
                    Logs::Print,
                )
                .await;
        }

        // Forwarded-and-marked packets resolve via the forwarded table.
        for ip in ["ip", "ip -6"] {
            self.shell
                .bash(
                    &format!(
                        "{ip} rule add from all fwmark {} lookup {} prio {}",
                        fwmark::FORWARDED_PACKET_TAG,
                        routing::FORWARDED_TABLE,
                        priorities::FORWARDED
                    ),
                    Logs::Print,
                )
                .await;
        }
    }

    pub(super) async fn remove_policy_routes(&self) {
        for ip in ["ip", "ip -6"] {
            self.shell
                .bash(
                    &format!(
                        "{ip} rule del lookup main suppress_prefixlength 1 prio {}",
                        priorities::SUPPRESSED_MAIN
                    ),
                    Logs::Print,
                )
                .await;
        }
        for ip in ["ip", "ip -6"] {
            self.shell
                .bash(
                    &format!(
                        "{ip} rule del from all fwmark {} lookup {} prio {}",
                        fwmark::FORWARDED_PACKET_TAG,
                        routing::FORWARDED_TABLE,
                        priorities::FORWARDED
                    ),
                    Logs::Print,
                )
                .await;
        }
    }

    /// Allow routing of 127.0.0.0/8 sources so loopback-sourced DNS packets
    /// survive until POSTROUTING rewrites them; the routing decision happens
    /// before SNAT. Stashes the prior sysctl value on the first transition.
    pub(super) async fn enable_route_local_net(&mut self) {
        if !self.previous_route_localnet.is_empty() {
            return; // already enabled and stored the prior value
        }

        let previous = self
            .shell
            .bash_output(&format!("sysctl -n '{ROUTE_LOCALNET_SYSCTL}'"))
            .await
            .unwrap_or_default();
        if previous.is_empty() {
            tracing::warn!("unable to store old {ROUTE_LOCALNET_SYSCTL} value");
            return;
        }

        if previous != "1" {
            tracing::info!(previous = %previous, "setting {ROUTE_LOCALNET_SYSCTL} to 1");
            self.shell
                .bash(&format!("sysctl -w '{ROUTE_LOCALNET_SYSCTL}=1'"), Logs::Print)
                .await;
        } else {
            tracing::info!("{ROUTE_LOCALNET_SYSCTL} already 1; nothing to do");
        }
        self.previous_route_localnet = previous;
    }

    /// Restore the sysctl to its stashed value; no-op when it was already 1.
    pub(super) async fn disable_route_local_net(&mut self) {
        if self.previous_route_localnet == "1" {
            tracing::info!(
                previous = %self.previous_route_localnet,
                "previous {ROUTE_LOCALNET_SYSCTL} was already 1 - nothing to restore"
            );
        } else if !self.previous_route_localnet.is_empty() {
            tracing::info!(
                previous = %self.previous_route_localnet,
                "restoring {ROUTE_LOCALNET_SYSCTL}"
            );
            self.shell
                .bash(
                    &format!("sysctl -w '{ROUTE_LOCALNET_SYSCTL}={}'", self.previous_route_localnet),
                    Logs::Print,
                )
                .await;
        }
        self.previous_route_localnet.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::super::mocks::MockShellOps;
    use super::*;

    fn firewall() -> (Firewall<MockShellOps>, MockShellOps) {
        let shell = MockShellOps::new();
        (Firewall::new(shell.clone()), shell)
    }

    #[tokio::test]
    async fn install_adds_two_rules_per_family() {
        let (fw, shell) = firewall();

        fw.install_policy_routes().await;

        assert_eq!(
            shell.commands(),
            vec![
                "ip rule add lookup main suppress_prefixlength 1 prio 100".to_string(),
                "ip -6 rule add lookup main suppress_prefixlength 1 prio 100".to_string(),
                format!(
                    "ip rule add from all fwmark {} lookup aegisvpnFwdrt prio 110",
                    crate::fwmark::FORWARDED_PACKET_TAG
                ),
                format!(
                    "ip -6 rule add from all fwmark {} lookup aegisvpnFwdrt prio 110",
                    crate::fwmark::FORWARDED_PACKET_TAG
                ),
            ]
        );
    }

    #[tokio::test]
    async fn remove_deletes_with_matching_priorities() {
        let (fw, shell) = firewall();

        fw.remove_policy_routes().await;

        let commands = shell.commands();
        assert_eq!(commands.len(), 4);
        assert!(commands.iter().all(|c| c.contains(" rule del ")));
        assert!(commands[0].contains("prio 100"));
        assert!(commands[2].contains("prio 110"));
    }

    #[tokio::test]
    async fn enable_stashes_previous_value_and_writes_one() {
        let (mut fw, shell) = firewall();
        shell.set_output("sysctl -n 'net.ipv4.conf.all.route_localnet'", "0");

        fw.enable_route_local_net().await;

        assert_eq!(
            shell.commands(),
            vec!["sysctl -w 'net.ipv4.conf.all.route_localnet=1'".to_string()]
        );

        // A second enable without an intervening disable is a no-op.
        shell.clear();
        fw.enable_route_local_net().await;
        assert!(shell.commands().is_empty());
    }

    #[tokio::test]
    async fn enable_skips_write_when_already_one() {
        let (mut fw, shell) = firewall();
        shell.set_output("sysctl -n 'net.ipv4.conf.all.route_localnet'", "1");

        fw.enable_route_local_net().await;

        assert!(shell.commands().is_empty());
    }

    #[tokio::test]
    async fn disable_restores_previous_value() {
        let (mut fw, shell) = firewall();
        shell.set_output("sysctl -n 'net.ipv4.conf.all.route_localnet'", "0");
        fw.enable_route_local_net().await;
        shell.clear();

        fw.disable_route_local_net().await;

        assert_eq!(
            shell.commands(),
            vec!["sysctl -w 'net.ipv4.conf.all.route_localnet=0'".to_string()]
        );
    }

    #[tokio::test]
    async fn disable_does_not_restore_when_previous_was_one() {
        let (mut fw, shell) = firewall();
        shell.set_output("sysctl -n 'net.ipv4.conf.all.route_localnet'", "1");
        fw.enable_route_local_net().await;
        shell.clear();

        fw.disable_route_local_net().await;

        assert!(shell.commands().is_empty());
    }

    #[tokio::test]
    async fn disable_without_prior_enable_is_a_no_op() {
        let (mut fw, shell) = firewall();

        fw.disable_route_local_net().await;

        assert!(shell.commands().is_empty());
    }
}
