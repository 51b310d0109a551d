//! The seam between the engine and the host's VPN facility.
//!
//! The engine owns the resulting file descriptor; constructing and
//! addressing the actual device is the host side's job.

use crate::config::AppInclusion;
use crate::error::EngineError;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::os::fd::OwnedFd;

/// Tunnel-side network constants. Client apps are told the gateway is their
/// DNS server, which is what steers queries into the tunnel.
pub const TUNNEL_MTU: u16 = 1500;
pub const GATEWAY_V4: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 1);
pub const SUBNET_PREFIX_V4: u8 = 24;
pub const GATEWAY_V6: Ipv6Addr = Ipv6Addr::new(0xfd00, 0x6f6e, 0, 0, 0, 0, 0, 1);
pub const SUBNET_PREFIX_V6: u8 = 64;

/// What the host VPN facility is asked to configure.
#[derive(Debug, Clone)]
pub struct TunOptions {
    pub mtu: u16,
    pub ipv4: (Ipv4Addr, u8),
    pub ipv6: Option<(Ipv6Addr, u8)>,
    /// Capture the default route so all outbound traffic enters the tunnel.
    pub capture_default_route: bool,
    pub dns_server: IpAddr,
    /// Opaque per-application selection, applied by builders on platforms
    /// that support it.
    pub apps: AppInclusion,
}

impl TunOptions {
    pub fn new(ipv6_enabled: bool, apps: AppInclusion) -> Self {
        Self {
            mtu: TUNNEL_MTU,
            ipv4: (GATEWAY_V4, SUBNET_PREFIX_V4),
            ipv6: ipv6_enabled.then_some((GATEWAY_V6, SUBNET_PREFIX_V6)),
            capture_default_route: true,
            dns_server: IpAddr::V4(GATEWAY_V4),
            apps,
        }
    }
}

/// Provides the tunnel file descriptor. Reads on the fd yield outbound IP
/// packets from apps; writes inject IP packets back. The fd must be
/// non-blocking.
pub trait TunBuilder: Send {
    fn establish(&mut self, options: &TunOptions) -> Result<OwnedFd, EngineError>;
}
