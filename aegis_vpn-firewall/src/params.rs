//! Input records the daemon hands to the firewall core.
//!
//! [`FirewallParams`] is a plain snapshot; the reconciler diffs consecutive
//! snapshots, so all fields compare by value. Absent states are modelled as
//! `Option` (adapter, connection settings) or empty strings/lists.

use std::collections::BTreeSet;

/// VPN adapter descriptor, present while a tunnel device exists.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct VpnAdapter {
    /// Kernel device name, e.g. `wgaegis0` or `tun0`.
    pub dev_node: String,
    /// Local address assigned to the tunnel device.
    pub local_address: String,
}

/// Settings of the current (or pending) connection.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ConnectionSettings {
    /// DNS servers the user configured for this connection, in order.
    pub dns_servers: Vec<String>,
    /// Force vpn-only apps to the configured DNS servers.
    pub force_vpn_only_dns: bool,
    /// Force bypass apps to the pre-VPN DNS servers.
    pub force_bypass_dns: bool,
    /// Whether the tunnel takes the default route.
    pub default_route: bool,
}

/// Host network scan results.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct NetScan {
    /// Host LAN IPv4 address.
    pub ip_address: String,
    /// Host global IPv6 address; empty when the host has none.
    pub ip_address6: String,
}

/// Union of every input the firewall core reconciles against.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FirewallParams {
    pub adapter: Option<VpnAdapter>,
    pub connection_settings: Option<ConnectionSettings>,
    pub net_scan: NetScan,
    /// DNS servers that were in use before the tunnel came up.
    pub existing_dns_servers: Vec<String>,
    pub enable_split_tunnel: bool,
    /// When true, forwarded (routed) packets use the tunnel.
    pub routed_packets_on_vpn: bool,
    /// CIDR strings of IPv4 subnets that bypass the tunnel.
    pub bypass_ipv4_subnets: BTreeSet<String>,
    /// CIDR strings of IPv6 subnets that bypass the tunnel.
    pub bypass_ipv6_subnets: BTreeSet<String>,
}

impl FirewallParams {
    /// Adapter device name, or `""` while no tunnel device exists.
    pub fn adapter_name(&self) -> &str {
        self.adapter.as_ref().map(|a| a.dev_node.as_str()).unwrap_or("")
    }

    /// Tunnel local address, or `""` while no tunnel device exists.
    pub fn tunnel_local_address(&self) -> &str {
        self.adapter.as_ref().map(|a| a.local_address.as_str()).unwrap_or("")
    }

    /// DNS servers of the current connection, or `[]` when disconnected.
    pub fn effective_dns_servers(&self) -> &[String] {
        self.connection_settings
            .as_ref()
            .map(|c| c.dns_servers.as_slice())
            .unwrap_or(&[])
    }

    /// First pre-VPN DNS server, or `""` when none were found.
    pub fn existing_dns(&self) -> &str {
        self.existing_dns_servers.first().map(String::as_str).unwrap_or("")
    }
}
