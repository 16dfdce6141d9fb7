//! Policy-routing identifiers: routing-table names and `ip rule` priorities.

/// Suffixes appended to the brand prefix to form the routing-table names,
/// in the order the rt_tables installer appends them.
pub const TABLE_SUFFIXES: [&str; 4] = ["vpnrt", "vpnOnlyrt", "vpnWgrt", "vpnFwdrt"];

/// Routing table carrying forwarded (routed-through) traffic. Must match
/// `BRAND_CODE` + the last entry of [`TABLE_SUFFIXES`].
pub const FORWARDED_TABLE: &str = "aegisvpnFwdrt";

/// `ip rule` priorities. Lower values are evaluated first; both sit after
/// the kernel's local-table rule (priority 0).
pub mod priorities {
    /// `lookup main suppress_prefixlength 1` — LAN destinations consult the
    /// main table before any VPN default route or OpenVPN /1 override.
    pub const SUPPRESSED_MAIN: u32 = 100;

    /// fwmark lookup steering forwarded packets into the forwarded table.
    pub const FORWARDED: u32 = 110;
}
