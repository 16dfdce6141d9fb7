//! Dynamic reconciler: minimal-diff rule updates on configuration change.
//!
//! Every dynamic input is cached after being applied; an anchor is only
//! replaced when its inputs differ from the cache. Correctness does not
//! depend on the cache (every replacement is idempotent), but log noise and
//! kernel churn do.

use std::collections::BTreeSet;

use super::ruleset::{
    ALLOW_DNS_ANCHOR, ALLOW_HNSD_ANCHOR, ALLOW_IPV6_PREFIX_ANCHOR, ALLOW_SUBNETS_ANCHOR,
    ALLOW_VPN_ANCHOR, BLOCK_FWD_IPV6_PREFIX_ANCHOR, FWD_SNAT_DNS_ANCHOR, FWD_SPLIT_DNS_ANCHOR,
    SNAT_DNS_ANCHOR, SPLIT_DNS_ANCHOR, TAG_FWD_SUBNETS_ANCHOR, TAG_SUBNETS_ANCHOR,
};
use super::{Firewall, HNSD_GROUP_NAME, IpVersion, ShellOps, SplitDnsInfo, SplitDnsType, Table};
use crate::params::FirewallParams;
use crate::{cgroup, fwmark};

impl<S: ShellOps> Firewall<S> {
    /// Reconcile the dynamic rules against a fresh [`FirewallParams`]
    /// snapshot. Individual command failures are logged and skipped so a bad
    /// rule in one anchor never blocks unrelated anchors.
    pub async fn update_rules(&mut self, params: &FirewallParams) {
        let adapter_name = params.adapter_name().to_string();
        tracing::info!(adapter = %adapter_name, "VPN interface");
        let ip_address6 = params.net_scan.ip_address6.clone();

        // DNS egress depends on both the adapter and the server list; update
        // if either changed.
        let effective_dns_servers: Vec<String> = params.effective_dns_servers().to_vec();
        if effective_dns_servers != self.dns_servers || adapter_name != self.adapter_name {
            let mut rules = dns_rules(&adapter_name, &effective_dns_servers);
            // Split-tunnel apps may always reach their own resolvers.
            for cg in [cgroup::VPN_ONLY_ID, cgroup::BYPASS_ID] {
                rules.push(format!(
                    "-p udp -m cgroup --cgroup {cg} -m udp --dport 53 -j ACCEPT"
                ));
            }
            for cg in [cgroup::VPN_ONLY_ID, cgroup::BYPASS_ID] {
                rules.push(format!(
                    "-p tcp -m cgroup --cgroup {cg} -m tcp --dport 53 -j ACCEPT"
                ));
            }
            self.replace_anchor(IpVersion::V4, ALLOW_DNS_ANCHOR, &rules, Table::Filter).await;
        }

        // These rules only depend on the adapter name.
        if adapter_name != self.adapter_name {
            if adapter_name.is_empty() {
                tracing::info!("clearing allowVPN and allowHnsd rules, adapter name is not known");
                self.replace_anchor(IpVersion::Both, ALLOW_VPN_ANCHOR, &[], Table::Filter).await;
                self.replace_anchor(IpVersion::Both, ALLOW_HNSD_ANCHOR, &[], Table::Filter).await;
            } else {
                self.replace_anchor(
                    IpVersion::Both,
                    ALLOW_VPN_ANCHOR,
                    &[format!("-o {adapter_name} -j ACCEPT")],
                    Table::Filter,
                )
                .await;
                self.replace_anchor(
                    IpVersion::Both,
                    ALLOW_HNSD_ANCHOR,
                    &[
                        format!(
                            "-m owner --gid-owner {HNSD_GROUP_NAME} -o {adapter_name} -p tcp --match multiport --dports 53,13038 -j ACCEPT"
                        ),
                        format!(
                            "-m owner --gid-owner {HNSD_GROUP_NAME} -o {adapter_name} -p udp --match multiport --dports 53,13038 -j ACCEPT"
                        ),
                        format!("-m owner --gid-owner {HNSD_GROUP_NAME} -j REJECT"),
                    ],
                    Table::Filter,
                )
                .await;
            }
        }

        if ip_address6 != self.ip_address6 {
            if ip_address6.is_empty() {
                tracing::info!("clearing allowIPv6Prefix rules, no global IPv6 address found");
                self.replace_anchor(IpVersion::V6, ALLOW_IPV6_PREFIX_ANCHOR, &[], Table::Filter)
                    .await;
                self.replace_anchor(IpVersion::V6, BLOCK_FWD_IPV6_PREFIX_ANCHOR, &[], Table::Filter)
                    .await;
            } else {
                // The first 64 bits are the network prefix shared by every
                // IPv6 host on the LAN; allowing it keeps those hosts
                // reachable. Forwarded traffic to the same prefix stays
                // blocked.
                self.replace_anchor(
                    IpVersion::V6,
                    ALLOW_IPV6_PREFIX_ANCHOR,
                    &[format!("-d {ip_address6}/64 -j ACCEPT")],
                    Table::Filter,
                )
                .await;
                self.replace_anchor(
                    IpVersion::V6,
                    BLOCK_FWD_IPV6_PREFIX_ANCHOR,
                    &[format!("-d {ip_address6}/64 -j REJECT")],
                    Table::Filter,
                )
                .await;
            }
        }

        self.update_bypass_subnets(IpVersion::V4, &params.bypass_ipv4_subnets).await;
        self.update_bypass_subnets(IpVersion::V6, &params.bypass_ipv6_subnets).await;

        // DNS for forwarded packets. We cannot control where routed clients
        // address their DNS, so it is always redirected to the server the
        // split mode selects.
        let routed_split = if params.enable_split_tunnel && !params.routed_packets_on_vpn {
            SplitDnsType::Bypass
        } else {
            SplitDnsType::VpnOnly
        };
        let routed_dns_info = SplitDnsInfo::info_for(params, routed_split);
        if routed_dns_info != self.routed_dns_info {
            if routed_dns_info.is_valid() {
                tracing::info!(
                    dns = %routed_dns_info.dns_server(),
                    source = %routed_dns_info.source_ip(),
                    "sending routed DNS to the selected server"
                );
                let tag = fwmark::FORWARDED_PACKET_TAG;
                let source = routed_dns_info.source_ip();
                let dns = routed_dns_info.dns_server();
                self.replace_anchor(
                    IpVersion::V4,
                    FWD_SNAT_DNS_ANCHOR,
                    &[
                        format!(
                            "-p udp --match mark --mark {tag} -m udp --dport 53 -j SNAT --to-source {source}"
                        ),
                        format!(
                            "-p tcp --match mark --mark {tag} -m tcp --dport 53 -j SNAT --to-source {source}"
                        ),
                    ],
                    Table::Nat,
                )
                .await;
                self.replace_anchor(
                    IpVersion::V4,
                    FWD_SPLIT_DNS_ANCHOR,
                    &[
                        format!(
                            "-p udp --match mark --mark {tag} -m udp --dport 53 -j DNAT --to-destination {dns}:53"
                        ),
                        format!(
                            "-p tcp --match mark --mark {tag} -m tcp --dport 53 -j DNAT --to-destination {dns}:53"
                        ),
                    ],
                    Table::Nat,
                )
                .await;
            } else {
                tracing::info!(
                    dns = %routed_dns_info.dns_server(),
                    source = %routed_dns_info.source_ip(),
                    "not creating routed DNS rules, received an empty value"
                );
                self.replace_anchor(IpVersion::V4, FWD_SNAT_DNS_ANCHOR, &[], Table::Nat).await;
                self.replace_anchor(IpVersion::V4, FWD_SPLIT_DNS_ANCHOR, &[], Table::Nat).await;
            }
            self.routed_dns_info = routed_dns_info;
        }

        // Split tunnel DNS for apps. At most one of the two classes is ever
        // forced to a specific resolver.
        let mut app_dns_info = SplitDnsInfo::default();
        if let Some(settings) = &params.connection_settings {
            debug_assert!(!(settings.force_vpn_only_dns && settings.force_bypass_dns));
            if settings.force_vpn_only_dns {
                tracing::info!("forcing VPN-only apps to our DNS");
                app_dns_info = SplitDnsInfo::info_for(params, SplitDnsType::VpnOnly);
            } else if settings.force_bypass_dns {
                tracing::info!("forcing bypass apps to existing DNS");
                app_dns_info = SplitDnsInfo::info_for(params, SplitDnsType::Bypass);
            }
        }

        if app_dns_info != self.app_dns_info {
            if app_dns_info.is_valid() {
                tracing::info!(
                    dns = %app_dns_info.dns_server(),
                    cgroup = %app_dns_info.cgroup_id(),
                    source = %app_dns_info.source_ip(),
                    "updating split tunnel DNS"
                );
                let cg = app_dns_info.cgroup_id();
                let source = app_dns_info.source_ip();
                let dns = app_dns_info.dns_server();
                self.replace_anchor(
                    IpVersion::V4,
                    SNAT_DNS_ANCHOR,
                    &[
                        format!(
                            "-p udp -m cgroup --cgroup {cg} -m udp --dport 53 -j SNAT --to-source {source}"
                        ),
                        format!(
                            "-p tcp -m cgroup --cgroup {cg} -m tcp --dport 53 -j SNAT --to-source {source}"
                        ),
                    ],
                    Table::Nat,
                )
                .await;
                self.replace_anchor(
                    IpVersion::V4,
                    SPLIT_DNS_ANCHOR,
                    &[
                        format!(
                            "-p udp -m cgroup --cgroup {cg} -m udp --dport 53 -j DNAT --to-destination {dns}:53"
                        ),
                        format!(
                            "-p tcp -m cgroup --cgroup {cg} -m tcp --dport 53 -j DNAT --to-destination {dns}:53"
                        ),
                    ],
                    Table::Nat,
                )
                .await;
            } else {
                tracing::info!(
                    dns = %app_dns_info.dns_server(),
                    cgroup = %app_dns_info.cgroup_id(),
                    source = %app_dns_info.source_ip(),
                    "clearing split tunnel DNS rules, don't have all information"
                );
                self.replace_anchor(IpVersion::V4, SNAT_DNS_ANCHOR, &[], Table::Nat).await;
                self.replace_anchor(IpVersion::V4, SPLIT_DNS_ANCHOR, &[], Table::Nat).await;
            }
            self.app_dns_info = app_dns_info;
        }

        // The routing decision (loopback vs routable source) happens before
        // POSTROUTING rewrites the source IP, so split tunnel DNS needs
        // route_localnet while it is active.
        if params.enable_split_tunnel {
            self.enable_route_local_net().await;
        } else {
            self.disable_route_local_net().await;
        }

        self.adapter_name = adapter_name;
        self.ip_address6 = ip_address6;
        self.dns_servers = effective_dns_servers;
    }

    async fn update_bypass_subnets(&mut self, version: IpVersion, subnets: &BTreeSet<String>) {
        let changed = match version {
            IpVersion::V4 => *subnets != self.bypass_ipv4_subnets,
            _ => *subnets != self.bypass_ipv6_subnets,
        };
        if changed {
            if subnets.is_empty() {
                tracing::info!(family = ?version, "clearing allowSubnets rule, no subnets found");
                self.replace_anchor(version, ALLOW_SUBNETS_ANCHOR, &[], Table::Filter).await;

                if version == IpVersion::V4 {
                    self.replace_anchor(IpVersion::V4, TAG_SUBNETS_ANCHOR, &[], Table::Mangle).await;
                }
                self.replace_anchor(version, TAG_FWD_SUBNETS_ANCHOR, &[], Table::Mangle).await;
            } else {
                let mut accept_rules: Vec<String> =
                    subnets.iter().map(|subnet| format!("-d {subnet} -j ACCEPT")).collect();

                // Any IPv6 allowance also needs link-local and multicast,
                // which Neighbor Discovery depends on.
                if version == IpVersion::V6 {
                    accept_rules.push("-d fe80::/10 -j ACCEPT".to_string());
                    accept_rules.push("-d ff00::/8 -j ACCEPT".to_string());
                }
                self.replace_anchor(version, ALLOW_SUBNETS_ANCHOR, &accept_rules, Table::Filter)
                    .await;

                // Packets towards a bypass subnet carry the exclude tag; the
                // policy routes then steer them around the tunnel.
                let mark_rules: Vec<String> = subnets
                    .iter()
                    .map(|subnet| {
                        format!("-d {subnet} -j MARK --set-mark {}", fwmark::EXCLUDE_PACKET_TAG)
                    })
                    .collect();
                if version == IpVersion::V4 {
                    tracing::info!("setting bypass subnet tag rules");
                    self.replace_anchor(IpVersion::V4, TAG_SUBNETS_ANCHOR, &mark_rules, Table::Mangle)
                        .await;
                }

                // Forwarded connections to bypassed subnets keep the bypass
                // mark regardless of the routed-packets setting.
                self.replace_anchor(version, TAG_FWD_SUBNETS_ANCHOR, &mark_rules, Table::Mangle)
                    .await;
            }
        }

        match version {
            IpVersion::V4 => self.bypass_ipv4_subnets = subnets.clone(),
            _ => self.bypass_ipv6_subnets = subnets.clone(),
        }
    }
}

/// One ACCEPT per (adapter, server, protocol); empty while no adapter is
/// known.
fn dns_rules(adapter_name: &str, servers: &[String]) -> Vec<String> {
    if adapter_name.is_empty() {
        tracing::info!("adapter name not set, not applying DNS firewall rules");
        return Vec::new();
    }

    servers
        .iter()
        .flat_map(|server| {
            [
                format!("-o {adapter_name} -d {server} -p udp --dport 53 -j ACCEPT"),
                format!("-o {adapter_name} -d {server} -p tcp --dport 53 -j ACCEPT"),
            ]
        })
        .collect()
}
