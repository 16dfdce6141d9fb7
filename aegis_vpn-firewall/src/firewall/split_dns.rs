//! Split-DNS resolution: which DNS server, cgroup and source address a
//! class of steered traffic must use.

use std::net::IpAddr;

use crate::cgroup;
use crate::params::FirewallParams;

/// Which class of steered traffic a split-DNS rule set applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SplitDnsType {
    /// Traffic leaving via the pre-VPN default route.
    Bypass,
    /// Traffic only permitted over the tunnel.
    VpnOnly,
}

/// DNS redirection parameters derived from [`FirewallParams`].
///
/// Feeds the DNAT (rewrite destination to `dns_server`) and SNAT (rewrite
/// source to `source_ip`) anchors for one cgroup-tagged traffic class.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SplitDnsInfo {
    dns_server: String,
    cgroup_id: String,
    source_ip: String,
}

impl SplitDnsInfo {
    pub fn info_for(params: &FirewallParams, split_type: SplitDnsType) -> Self {
        let (dns_server, cgroup_id, source_ip) = match split_type {
            SplitDnsType::Bypass => (
                params.existing_dns().to_string(),
                cgroup::BYPASS_ID.to_string(),
                params.net_scan.ip_address.clone(),
            ),
            SplitDnsType::VpnOnly => (
                params.effective_dns_servers().first().cloned().unwrap_or_default(),
                cgroup::VPN_ONLY_ID.to_string(),
                params.tunnel_local_address().to_string(),
            ),
        };

        // A loopback resolver forces a loopback source, otherwise the
        // rewritten reply could never route back to it.
        let source_ip = if is_loopback(&dns_server) {
            "127.0.0.1".to_string()
        } else {
            source_ip
        };

        Self {
            dns_server,
            cgroup_id,
            source_ip,
        }
    }

    /// All three fields are required to build the NAT rules.
    pub fn is_valid(&self) -> bool {
        !self.dns_server.is_empty() && !self.cgroup_id.is_empty() && !self.source_ip.is_empty()
    }

    pub fn dns_server(&self) -> &str {
        &self.dns_server
    }

    pub fn cgroup_id(&self) -> &str {
        &self.cgroup_id
    }

    pub fn source_ip(&self) -> &str {
        &self.source_ip
    }
}

fn is_loopback(address: &str) -> bool {
    address.parse::<IpAddr>().map(|a| a.is_loopback()).unwrap_or(false)
}
