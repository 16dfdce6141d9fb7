//! Well-known firewall mark values.
//!
//! Marks serve double duty: filter rules match on them, and the policy
//! routing rules steer marked packets into dedicated routing tables.

/// Mark carried by the wireguard tunnel's own encapsulated packets.
/// 51820 is wg-quick's conventional fwmark (its default listen port).
pub const WIREGUARD_FWMARK: u32 = 51820;

/// Mark for packets that must bypass the tunnel (split-tunnel exclude).
pub const EXCLUDE_PACKET_TAG: u32 = 0x3211;

/// Mark for packets originated by vpn-only applications.
pub const VPN_ONLY_PACKET_TAG: u32 = 0x3212;

/// Mark applied to every forwarded (routed-through-this-host) packet.
pub const FORWARDED_PACKET_TAG: u32 = 0x3213;
