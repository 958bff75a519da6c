//! Local IPv4 discovery for the listener.
//!
//! Best-effort host discovery: the chosen address is the first one that
//! looks like a LAN address. Nothing here checks that a given peer can
//! actually reach it.

use std::net::Ipv4Addr;

use crate::ChatTransportError;

/// Name fragments that mark tunnel / VPN adapters.
const TUNNEL_MARKERS: &[&str] = &["vpn", "tun", "tap", "wg", "ppp", "utun", "tailscale", "zerotier"];

/// Snapshot of the interface attributes the filter looks at.
#[derive(Debug, Clone, Default)]
pub(crate) struct InterfaceInfo {
    pub name: String,
    pub description: Option<String>,
    pub up: bool,
    pub loopback: bool,
    pub point_to_point: bool,
    pub ipv4: Vec<Ipv4Addr>,
}

impl InterfaceInfo {
    fn from_netdev(iface: &netdev::Interface) -> Self {
        Self {
            name: iface.name.clone(),
            description: iface
                .description
                .clone()
                .or_else(|| iface.friendly_name.clone()),
            up: iface.is_up(),
            loopback: iface.is_loopback(),
            point_to_point: iface.is_point_to_point(),
            ipv4: iface.ipv4.iter().map(|net| net.addr()).collect(),
        }
    }

    fn looks_like_tunnel(&self) -> bool {
        let name = self.name.to_ascii_lowercase();
        let description = self
            .description
            .as_deref()
            .unwrap_or_default()
            .to_ascii_lowercase();
        description.contains("vpn")
            || TUNNEL_MARKERS.iter().any(|marker| name.starts_with(marker))
    }

    fn is_candidate(&self) -> bool {
        self.up && !self.loopback && !self.point_to_point && !self.looks_like_tunnel()
    }
}

/// Discover the machine's usable non-loopback IPv4 address.
pub fn discover_local_ipv4() -> Result<Ipv4Addr, ChatTransportError> {
    let interfaces: Vec<InterfaceInfo> = netdev::get_interfaces()
        .iter()
        .map(InterfaceInfo::from_netdev)
        .collect();

    let addr = select_ipv4(&interfaces).ok_or(ChatTransportError::NoUsableAddress)?;
    tracing::debug!("local IPv4 address: {addr}");
    Ok(addr)
}

/// Pick the first unicast IPv4 address that survives the filters.
pub(crate) fn select_ipv4(interfaces: &[InterfaceInfo]) -> Option<Ipv4Addr> {
    interfaces
        .iter()
        .filter(|iface| iface.is_candidate())
        .flat_map(|iface| iface.ipv4.iter().copied())
        .find(|addr| !addr.is_loopback() && !addr.is_link_local() && !addr.is_unspecified())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn iface(name: &str, addrs: &[&str]) -> InterfaceInfo {
        InterfaceInfo {
            name: name.to_string(),
            description: None,
            up: true,
            loopback: false,
            point_to_point: false,
            ipv4: addrs.iter().map(|a| a.parse().unwrap()).collect(),
        }
    }

    #[test]
    fn picks_first_lan_address() {
        let interfaces = vec![iface("eth0", &["192.168.1.20"]), iface("eth1", &["10.0.0.5"])];
        assert_eq!(select_ipv4(&interfaces), Some(Ipv4Addr::new(192, 168, 1, 20)));
    }

    #[test]
    fn skips_down_and_loopback_interfaces() {
        let mut down = iface("eth0", &["192.168.1.20"]);
        down.up = false;
        let mut lo = iface("lo", &["127.0.0.1"]);
        lo.loopback = true;
        let interfaces = vec![down, lo, iface("wlan0", &["10.1.2.3"])];
        assert_eq!(select_ipv4(&interfaces), Some(Ipv4Addr::new(10, 1, 2, 3)));
    }

    #[test]
    fn skips_vpn_and_point_to_point() {
        let mut ptp = iface("ppp0", &["100.64.0.2"]);
        ptp.point_to_point = true;
        let mut vpn = iface("eth9", &["172.16.0.9"]);
        vpn.description = Some("Corporate VPN Adapter".to_string());
        let interfaces = vec![ptp, vpn, iface("wg0", &["10.8.0.1"]), iface("en0", &["192.168.0.7"])];
        assert_eq!(select_ipv4(&interfaces), Some(Ipv4Addr::new(192, 168, 0, 7)));
    }

    #[test]
    fn skips_link_local_addresses() {
        let interfaces = vec![iface("eth0", &["169.254.10.10", "192.168.5.5"])];
        assert_eq!(select_ipv4(&interfaces), Some(Ipv4Addr::new(192, 168, 5, 5)));
    }

    #[test]
    fn none_when_nothing_usable() {
        let mut lo = iface("lo", &["127.0.0.1"]);
        lo.loopback = true;
        let interfaces = vec![lo, iface("eth0", &["169.254.1.1"])];
        assert_eq!(select_ipv4(&interfaces), None);
    }
}
