//! Static ruleset: the complete, priority-ordered anchor skeleton.
//!
//! `install` creates every root chain and anchor the daemon will ever need;
//! the reconciler afterwards only replaces anchor contents, never their
//! positions. Placeholder order inside a root chain is exactly the
//! `install_anchor` call order below, so the order of the calls is load
//! bearing.

use super::{
    FORWARD_CHAIN, Firewall, HNSD_GROUP_NAME, INPUT_CHAIN, IpVersion, Logs, OUTPUT_CHAIN,
    POSTROUTING_CHAIN, PREROUTING_CHAIN, ShellOps, Table, VPN_GROUP_NAME, root_chain_for,
};
use crate::{cgroup, fwmark};

// Anchor labels shared with the reconciler. The numeric prefix documents the
// intended precedence; the actual ordering is fixed by install order.
pub(super) const ALLOW_DNS_ANCHOR: &str = "320.allowDNS";
pub(super) const ALLOW_VPN_ANCHOR: &str = "200.allowVPN";
pub(super) const ALLOW_HNSD_ANCHOR: &str = "350.allowHnsd";
pub(super) const ALLOW_IPV6_PREFIX_ANCHOR: &str = "299.allowIPv6Prefix";
pub(super) const BLOCK_FWD_IPV6_PREFIX_ANCHOR: &str = "299.blockFwdIPv6Prefix";
pub(super) const ALLOW_SUBNETS_ANCHOR: &str = "305.allowSubnets";
pub(super) const TAG_SUBNETS_ANCHOR: &str = "90.tagSubnets";
pub(super) const TAG_FWD_SUBNETS_ANCHOR: &str = "200.tagFwdSubnets";
pub(super) const SNAT_DNS_ANCHOR: &str = "90.snatDNS";
pub(super) const SPLIT_DNS_ANCHOR: &str = "80.splitDNS";
pub(super) const FWD_SNAT_DNS_ANCHOR: &str = "90.fwdSnatDNS";
pub(super) const FWD_SPLIT_DNS_ANCHOR: &str = "80.fwdSplitDNS";

fn rules<const N: usize>(rules: [&str; N]) -> Vec<String> {
    rules.into_iter().map(str::to_string).collect()
}

impl<S: ShellOps> Firewall<S> {
    /// Build the complete anchor skeleton across the filter, nat, mangle and
    /// raw tables, then link the root chains and install the policy routes.
    ///
    /// Tears down any residue first, so it is safe to call on a dirty
    /// system (e.g. after a daemon crash).
    pub async fn install(&self) {
        // Clean up any existing rules if they exist.
        self.uninstall().await;

        let out_root = root_chain_for(OUTPUT_CHAIN);
        let fwd_root = root_chain_for(FORWARD_CHAIN);
        let in_root = root_chain_for(INPUT_CHAIN);
        let pre_root = root_chain_for(PREROUTING_CHAIN);
        let post_root = root_chain_for(POSTROUTING_CHAIN);

        // Root chains for every (table, built-in) pair in use.
        self.create_chain(IpVersion::Both, &out_root, Table::Filter).await;
        self.create_chain(IpVersion::Both, &fwd_root, Table::Filter).await;
        self.create_chain(IpVersion::Both, &in_root, Table::Filter).await;
        self.create_chain(IpVersion::Both, &pre_root, Table::Raw).await;
        self.create_chain(IpVersion::Both, &out_root, Table::Nat).await;
        self.create_chain(IpVersion::Both, &pre_root, Table::Nat).await;
        self.create_chain(IpVersion::Both, &post_root, Table::Nat).await;
        self.create_chain(IpVersion::Both, &out_root, Table::Mangle).await;
        self.create_chain(IpVersion::Both, &pre_root, Table::Mangle).await;

        // Filter rulesets, root OUTPUT. Loopback acceptance goes in first so
        // it is evaluated before everything else, including the kill-switch
        // floor; the remaining anchors follow in descending priority.
        self.install_anchor(
            IpVersion::Both,
            "000.allowLoopback",
            &rules(["-o lo+ -j ACCEPT"]),
            Table::Filter,
            &out_root,
        )
        .await;
        self.install_anchor(
            IpVersion::Both,
            "400.allowAegis",
            &rules([&format!("-m owner --gid-owner {VPN_GROUP_NAME} -j ACCEPT")]),
            Table::Filter,
            &out_root,
        )
        .await;

        // Allow all packets with the wireguard mark. Another process would
        // need root to spoof this mark, and root can rewrite the ruleset
        // anyway.
        self.install_anchor(
            IpVersion::Both,
            "390.allowWg",
            &rules([&format!("-m mark --mark {} -j ACCEPT", fwmark::WIREGUARD_FWMARK)]),
            Table::Filter,
            &out_root,
        )
        .await;
        self.install_anchor(
            IpVersion::Both,
            ALLOW_HNSD_ANCHOR,
            &[], // filled at run-time with the adapter name
            Table::Filter,
            &out_root,
        )
        .await;
        // Port 13038 is the handshake control port.
        self.install_anchor(
            IpVersion::Both,
            "350.cgAllowHnsd",
            &rules([
                &format!(
                    "-m owner --gid-owner {HNSD_GROUP_NAME} -m cgroup --cgroup {} -p tcp --match multiport --dports 53,13038 -j ACCEPT",
                    cgroup::VPN_ONLY_ID
                ),
                &format!(
                    "-m owner --gid-owner {HNSD_GROUP_NAME} -m cgroup --cgroup {} -p udp --match multiport --dports 53,13038 -j ACCEPT",
                    cgroup::VPN_ONLY_ID
                ),
                &format!("-m owner --gid-owner {HNSD_GROUP_NAME} -j REJECT"),
            ]),
            Table::Filter,
            &out_root,
        )
        .await;

        // vpn-only packets are only blocked while the VPN is disconnected.
        self.install_anchor(
            IpVersion::Both,
            "340.blockVpnOnly",
            &rules([&format!("-m cgroup --cgroup {} -j REJECT", cgroup::VPN_ONLY_ID)]),
            Table::Filter,
            &out_root,
        )
        .await;

        self.install_anchor(IpVersion::V4, ALLOW_DNS_ANCHOR, &[], Table::Filter, &out_root).await;
        self.install_anchor(
            IpVersion::Both,
            "310.blockDNS",
            &rules(["-p udp --dport 53 -j REJECT", "-p tcp --dport 53 -j REJECT"]),
            Table::Filter,
            &out_root,
        )
        .await;

        self.install_anchor(
            IpVersion::Both,
            ALLOW_SUBNETS_ANCHOR,
            &[], // replaced per-family at run-time
            Table::Filter,
            &out_root,
        )
        .await;

        self.install_anchor(
            IpVersion::V4,
            "300.allowLAN",
            &rules([
                "-d 10.0.0.0/8 -j ACCEPT",
                "-d 169.254.0.0/16 -j ACCEPT",
                "-d 172.16.0.0/12 -j ACCEPT",
                "-d 192.168.0.0/16 -j ACCEPT",
                "-d 224.0.0.0/4 -j ACCEPT",
                "-d 255.255.255.255/32 -j ACCEPT",
            ]),
            Table::Filter,
            &out_root,
        )
        .await;
        self.install_anchor(
            IpVersion::V6,
            "300.allowLAN",
            &rules([
                "-d fc00::/7 -j ACCEPT",
                "-d fe80::/10 -j ACCEPT",
                "-d ff00::/8 -j ACCEPT",
            ]),
            Table::Filter,
            &out_root,
        )
        .await;
        self.install_anchor(
            IpVersion::V6,
            ALLOW_IPV6_PREFIX_ANCHOR,
            &[], // filled at run-time with the host's /64
            Table::Filter,
            &out_root,
        )
        .await;
        self.install_anchor(
            IpVersion::V6,
            BLOCK_FWD_IPV6_PREFIX_ANCHOR,
            &[], // companion reject for forwarded traffic, also run-time
            Table::Filter,
            &fwd_root,
        )
        .await;
        self.install_anchor(
            IpVersion::V4,
            "290.allowDHCP",
            &rules(["-p udp -d 255.255.255.255 --sport 68 --dport 67 -j ACCEPT"]),
            Table::Filter,
            &out_root,
        )
        .await;
        self.install_anchor(
            IpVersion::V6,
            "290.allowDHCP",
            &rules(["-p udp -d ff00::/8 --sport 546 --dport 547 -j ACCEPT"]),
            Table::Filter,
            &out_root,
        )
        .await;

        // 100.blockAll can be toggled off when the kill switch is off, but
        // IPv6 transit is unsupported and stays blocked in every state.
        self.install_anchor(
            IpVersion::V6,
            "250.blockIPv6",
            &rules(["! -o lo+ -j REJECT"]),
            Table::Filter,
            &out_root,
        )
        .await;

        self.install_anchor(
            IpVersion::Both,
            ALLOW_VPN_ANCHOR,
            &[], // filled at run-time, depends on the vpn method
            Table::Filter,
            &out_root,
        )
        .await;

        self.install_anchor(
            IpVersion::Both,
            "100.blockAll",
            &rules(["-j REJECT"]),
            Table::Filter,
            &out_root,
        )
        .await;

        // NAT rulesets, all filled dynamically by the reconciler.
        self.install_anchor(IpVersion::Both, SPLIT_DNS_ANCHOR, &[], Table::Nat, &out_root).await;
        self.install_anchor(IpVersion::Both, FWD_SPLIT_DNS_ANCHOR, &[], Table::Nat, &pre_root).await;
        self.install_anchor(IpVersion::Both, SNAT_DNS_ANCHOR, &[], Table::Nat, &post_root).await;
        self.install_anchor(IpVersion::Both, FWD_SNAT_DNS_ANCHOR, &[], Table::Nat, &post_root).await;
        // Set at run-time by the split-tunnel process tracker.
        self.install_anchor(IpVersion::Both, "100.transIp", &[], Table::Nat, &post_root).await;

        // Protect our loopback ips from outside access, since route_localnet
        // may be active.
        self.install_anchor(
            IpVersion::V4,
            "100.protectLoopback",
            &rules(["! -i lo -o lo -j REJECT"]),
            Table::Filter,
            &in_root,
        )
        .await;

        // Mangle rulesets. Bypass subnets are tagged BEFORE the cgroup
        // anchors run: the last written mark wins, so tagging subnets first
        // lets a vpn-only tag override a bypass-subnet tag ("vpn-only apps
        // always win").
        self.install_anchor(IpVersion::Both, TAG_SUBNETS_ANCHOR, &[], Table::Mangle, &out_root).await;
        self.install_anchor(
            IpVersion::Both,
            "100.tagBypass",
            &rules([&format!(
                "-m cgroup --cgroup {} -j MARK --set-mark {}",
                cgroup::BYPASS_ID,
                fwmark::EXCLUDE_PACKET_TAG
            )]),
            Table::Mangle,
            &out_root,
        )
        .await;
        self.install_anchor(
            IpVersion::Both,
            "100.tagVpnOnly",
            &rules([&format!(
                "-m cgroup --cgroup {} -j MARK --set-mark {}",
                cgroup::VPN_ONLY_ID,
                fwmark::VPN_ONLY_PACKET_TAG
            )]),
            Table::Mangle,
            &out_root,
        )
        .await;

        // Mark all forwarded packets.
        self.install_anchor(
            IpVersion::Both,
            "100.tagFwd",
            &rules([&format!("-j MARK --set-mark {}", fwmark::FORWARDED_PACKET_TAG)]),
            Table::Mangle,
            &pre_root,
        )
        .await;
        // Forwarded packets towards bypass subnets are re-marked as bypass.
        self.install_anchor(IpVersion::Both, TAG_FWD_SUBNETS_ANCHOR, &[], Table::Mangle, &pre_root)
            .await;

        // Mitigation for CVE-2019-14899: drop packets addressed to the local
        // VPN IP that did not arrive on the VPN interface. Replaced at
        // run-time once the tunnel address is known.
        self.install_anchor(
            IpVersion::Both,
            "100.vpnTunOnly",
            &rules(["-j ACCEPT"]),
            Table::Raw,
            &pre_root,
        )
        .await;

        // Jump to every root chain from position 1 of its built-in.
        self.ensure_root_anchor_priority(IpVersion::Both).await;

        self.install_policy_routes().await;
    }

    /// Re-assert that every root chain sits at position 1 of its built-in
    /// chain. Safe to call at any time, e.g. after another firewall manager
    /// prepended its own rules.
    pub async fn ensure_root_anchor_priority(&self, ip: IpVersion) {
        let out_root = root_chain_for(OUTPUT_CHAIN);
        let fwd_root = root_chain_for(FORWARD_CHAIN);
        let in_root = root_chain_for(INPUT_CHAIN);
        let pre_root = root_chain_for(PREROUTING_CHAIN);
        let post_root = root_chain_for(POSTROUTING_CHAIN);

        // Filter table
        self.link_chain(ip, &out_root, OUTPUT_CHAIN, true, Table::Filter).await;
        self.link_chain(ip, &fwd_root, FORWARD_CHAIN, true, Table::Filter).await;
        self.link_chain(ip, &in_root, INPUT_CHAIN, true, Table::Filter).await;

        // Nat table
        self.link_chain(ip, &out_root, OUTPUT_CHAIN, true, Table::Nat).await;
        self.link_chain(ip, &pre_root, PREROUTING_CHAIN, true, Table::Nat).await;
        self.link_chain(ip, &post_root, POSTROUTING_CHAIN, true, Table::Nat).await;

        // Mangle table
        self.link_chain(ip, &out_root, OUTPUT_CHAIN, true, Table::Mangle).await;
        self.link_chain(ip, &pre_root, PREROUTING_CHAIN, true, Table::Mangle).await;

        // Raw table
        self.link_chain(ip, &pre_root, PREROUTING_CHAIN, true, Table::Raw).await;
    }

    /// Tear down everything `install` created. Safe to run with no prior
    /// state present.
    pub async fn uninstall(&self) {
        self.remove_policy_routes().await;

        let out_root = root_chain_for(OUTPUT_CHAIN);
        let fwd_root = root_chain_for(FORWARD_CHAIN);
        let in_root = root_chain_for(INPUT_CHAIN);
        let pre_root = root_chain_for(PREROUTING_CHAIN);
        let post_root = root_chain_for(POSTROUTING_CHAIN);

        // Filter table
        self.unlink_and_delete_chain(IpVersion::Both, &out_root, OUTPUT_CHAIN, Table::Filter).await;
        self.unlink_and_delete_chain(IpVersion::Both, &fwd_root, FORWARD_CHAIN, Table::Filter).await;
        self.unlink_and_delete_chain(IpVersion::Both, &in_root, INPUT_CHAIN, Table::Filter).await;

        // NAT table
        self.unlink_and_delete_chain(IpVersion::Both, &out_root, OUTPUT_CHAIN, Table::Nat).await;
        self.unlink_and_delete_chain(IpVersion::Both, &pre_root, PREROUTING_CHAIN, Table::Nat).await;
        self.unlink_and_delete_chain(IpVersion::Both, &post_root, POSTROUTING_CHAIN, Table::Nat)
            .await;

        // Mangle table
        self.unlink_and_delete_chain(IpVersion::Both, &out_root, OUTPUT_CHAIN, Table::Mangle).await;
        self.unlink_and_delete_chain(IpVersion::Both, &pre_root, PREROUTING_CHAIN, Table::Mangle)
            .await;

        // Raw table
        self.unlink_and_delete_chain(IpVersion::Both, &pre_root, PREROUTING_CHAIN, Table::Raw).await;

        // Filter anchors
        self.uninstall_anchor(IpVersion::Both, "000.allowLoopback", Table::Filter, &out_root).await;
        self.uninstall_anchor(IpVersion::Both, "400.allowAegis", Table::Filter, &out_root).await;
        self.uninstall_anchor(IpVersion::Both, "390.allowWg", Table::Filter, &out_root).await;
        self.uninstall_anchor(IpVersion::Both, ALLOW_HNSD_ANCHOR, Table::Filter, &out_root).await;
        self.uninstall_anchor(IpVersion::Both, "350.cgAllowHnsd", Table::Filter, &out_root).await;
        self.uninstall_anchor(IpVersion::Both, "340.blockVpnOnly", Table::Filter, &out_root).await;
        self.uninstall_anchor(IpVersion::V4, ALLOW_DNS_ANCHOR, Table::Filter, &out_root).await;
        self.uninstall_anchor(IpVersion::Both, "310.blockDNS", Table::Filter, &out_root).await;
        self.uninstall_anchor(IpVersion::Both, ALLOW_SUBNETS_ANCHOR, Table::Filter, &out_root).await;
        self.uninstall_anchor(IpVersion::Both, "300.allowLAN", Table::Filter, &out_root).await;
        self.uninstall_anchor(IpVersion::V6, ALLOW_IPV6_PREFIX_ANCHOR, Table::Filter, &out_root)
            .await;
        self.uninstall_anchor(IpVersion::V6, BLOCK_FWD_IPV6_PREFIX_ANCHOR, Table::Filter, &fwd_root)
            .await;
        self.uninstall_anchor(IpVersion::Both, "290.allowDHCP", Table::Filter, &out_root).await;
        self.uninstall_anchor(IpVersion::V6, "250.blockIPv6", Table::Filter, &out_root).await;
        self.uninstall_anchor(IpVersion::Both, ALLOW_VPN_ANCHOR, Table::Filter, &out_root).await;
        self.uninstall_anchor(IpVersion::Both, "100.blockAll", Table::Filter, &out_root).await;
        self.uninstall_anchor(IpVersion::V4, "100.protectLoopback", Table::Filter, &in_root).await;

        // NAT anchors
        self.uninstall_anchor(IpVersion::Both, SNAT_DNS_ANCHOR, Table::Nat, &post_root).await;
        self.uninstall_anchor(IpVersion::Both, "100.transIp", Table::Nat, &post_root).await;
        self.uninstall_anchor(IpVersion::Both, FWD_SNAT_DNS_ANCHOR, Table::Nat, &post_root).await;
        self.uninstall_anchor(IpVersion::Both, FWD_SPLIT_DNS_ANCHOR, Table::Nat, &pre_root).await;
        self.uninstall_anchor(IpVersion::Both, SPLIT_DNS_ANCHOR, Table::Nat, &out_root).await;

        // Mangle anchors
        self.uninstall_anchor(IpVersion::Both, TAG_SUBNETS_ANCHOR, Table::Mangle, &out_root).await;
        self.uninstall_anchor(IpVersion::Both, "100.tagBypass", Table::Mangle, &out_root).await;
        self.uninstall_anchor(IpVersion::Both, "100.tagVpnOnly", Table::Mangle, &out_root).await;
        self.uninstall_anchor(IpVersion::Both, TAG_FWD_SUBNETS_ANCHOR, Table::Mangle, &pre_root)
            .await;
        self.uninstall_anchor(IpVersion::Both, "100.tagFwd", Table::Mangle, &pre_root).await;

        // Raw anchors
        self.uninstall_anchor(IpVersion::Both, "100.vpnTunOnly", Table::Raw, &pre_root).await;
    }

    /// Whether the filter OUTPUT built-in currently jumps into our root
    /// chain.
    pub async fn is_installed(&self) -> bool {
        self.shell
            .bash(
                &format!(
                    "iptables -w -C {OUTPUT_CHAIN} -j {} 2> /dev/null",
                    root_chain_for(OUTPUT_CHAIN)
                ),
                Logs::Suppress,
            )
            .await
            == 0
    }
}
