//! Layered netfilter rule compiler and reconciler.
//!
//! Every rule this crate owns lives inside a *root chain* (one per
//! table/built-in pair, linked at the top of the built-in) and is grouped
//! into *anchors*. An anchor is a placeholder/actual chain pair:
//!
//! - the placeholder (`aegisvpn.a.<label>`) is linked into the root chain
//!   once, at install time, and never moves — its position fixes the
//!   anchor's precedence;
//! - the actual chain (`aegisvpn.<label>`) holds the concrete rules and may
//!   be flushed and repopulated at any time without disturbing precedence.
//!
//! netfilter offers no atomic "replace chain body" or "move rule", so this
//! two-level structure is what keeps ordering stable across reconfiguration.
//!
//! All kernel mutations funnel through the [`ShellOps`] seam so tests can
//! observe and script them.

mod anchors;
mod chains;
mod policy_routes;
mod reconciler;
mod ruleset;
mod shell_ops;
mod split_dns;

#[cfg(test)]
pub(crate) mod mocks;

pub use shell_ops::{Logs, RealShellOps, ShellOps};
pub use split_dns::{SplitDnsInfo, SplitDnsType};

use std::collections::BTreeSet;

// ============================================================================
// Names
// ============================================================================

/// Base name of every chain this crate owns (`BRAND_CODE` + "vpn").
pub(crate) const ANCHOR_NAME: &str = "aegisvpn";

/// Group owning daemon-originated traffic; never firewalled off.
pub(crate) const VPN_GROUP_NAME: &str = "aegisvpn";

/// Group the hnsd (handshake DNS) helper runs under.
pub(crate) const HNSD_GROUP_NAME: &str = "aegishnsd";

pub(crate) const OUTPUT_CHAIN: &str = "OUTPUT";
pub(crate) const INPUT_CHAIN: &str = "INPUT";
pub(crate) const FORWARD_CHAIN: &str = "FORWARD";
pub(crate) const PREROUTING_CHAIN: &str = "PREROUTING";
pub(crate) const POSTROUTING_CHAIN: &str = "POSTROUTING";

/// Name of the root chain linked at the top of `builtin`.
pub(crate) fn root_chain_for(builtin: &str) -> String {
    format!("{ANCHOR_NAME}.{builtin}")
}

// ============================================================================
// Selectors
// ============================================================================

/// Address family selector for chain and anchor operations.
///
/// `Both` fans out over the concrete families; fanned-out operations return
/// the first non-zero status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpVersion {
    V4,
    V6,
    Both,
}

impl IpVersion {
    pub(crate) fn families(self) -> &'static [Family] {
        match self {
            IpVersion::V4 => &[Family::V4],
            IpVersion::V6 => &[Family::V6],
            IpVersion::Both => &[Family::V4, Family::V6],
        }
    }
}

/// A concrete address family.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Family {
    V4,
    V6,
}

impl Family {
    pub(crate) fn command(self) -> &'static str {
        match self {
            Family::V4 => "iptables",
            Family::V6 => "ip6tables",
        }
    }

    pub(crate) fn tag(self) -> &'static str {
        match self {
            Family::V4 => "(IPv4)",
            Family::V6 => "(IPv6)",
        }
    }
}

/// Kernel packet-filter table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Table {
    Filter,
    Nat,
    Mangle,
    Raw,
}

impl Table {
    pub(crate) fn name(self) -> &'static str {
        match self {
            Table::Filter => "filter",
            Table::Nat => "nat",
            Table::Mangle => "mangle",
            Table::Raw => "raw",
        }
    }
}

// ============================================================================
// Firewall
// ============================================================================

/// The firewall core.
///
/// Holds the shell execution seam and the reconciler cache: the last-applied
/// value of every dynamic input, so [`Firewall::update_rules`] only rewrites
/// anchors whose inputs actually changed. Cache fields use empty strings and
/// empty collections as the "absent" state.
pub struct Firewall<S: ShellOps> {
    shell: S,
    adapter_name: String,
    ip_address6: String,
    dns_servers: Vec<String>,
    bypass_ipv4_subnets: BTreeSet<String>,
    bypass_ipv6_subnets: BTreeSet<String>,
    routed_dns_info: SplitDnsInfo,
    app_dns_info: SplitDnsInfo,
    previous_route_localnet: String,
}

impl Firewall<RealShellOps> {
    /// A firewall driving the real system tools.
    pub fn system() -> Self {
        Self::new(RealShellOps)
    }
}

impl<S: ShellOps> Firewall<S> {
    pub fn new(shell: S) -> Self {
        Self {
            shell,
            adapter_name: String::new(),
            ip_address6: String::new(),
            dns_servers: Vec::new(),
            bypass_ipv4_subnets: BTreeSet::new(),
            bypass_ipv6_subnets: BTreeSet::new(),
            routed_dns_info: SplitDnsInfo::default(),
            app_dns_info: SplitDnsInfo::default(),
            previous_route_localnet: String::new(),
        }
    }
}
