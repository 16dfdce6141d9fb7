//! net_cls cgroup class ids used to classify split-tunnel applications.
//!
//! The split-tunnel process tracker moves bypass and vpn-only application
//! processes into dedicated net_cls cgroups; these class ids are what the
//! `-m cgroup --cgroup` match compares against.

/// Class id of the cgroup holding bypass-app processes.
pub const BYPASS_ID: &str = "0x00110011";

/// Class id of the cgroup holding vpn-only-app processes.
pub const VPN_ONLY_ID: &str = "0x00220022";
