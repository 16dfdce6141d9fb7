//! Linux firewall and packet-steering core for the AegisVPN daemon.
//!
//! Programs the kernel's packet filter (via `iptables`/`ip6tables`), policy
//! routing (via `ip rule`), the `route_localnet` sysctl and the iproute2
//! routing-table-name file so that exactly the intended traffic reaches the
//! network in every VPN state.
//!
//! The daemon owns connection state, settings and IPC; this crate only turns
//! a [`params::FirewallParams`] snapshot into kernel state:
//!
//! - [`firewall::Firewall::install`] builds the static anchor skeleton once
//!   at startup, [`firewall::Firewall::uninstall`] removes it at shutdown.
//! - [`firewall::Firewall::update_rules`] reconciles the dynamic rules on
//!   every configuration or network change, touching only anchors whose
//!   inputs changed.
//! - [`rt_tables::RtTablesInitializer`] seeds the routing-table names the
//!   policy routes refer to.

pub mod cgroup;
pub mod firewall;
pub mod fwmark;
pub mod params;
pub mod routing;
pub mod rt_tables;

/// Brand code every kernel-visible name derives from (chains, groups,
/// routing tables).
pub const BRAND_CODE: &str = "aegis";
