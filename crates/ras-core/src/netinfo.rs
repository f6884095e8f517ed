//! Local address detection

use std::net::{IpAddr, SocketAddr, UdpSocket};

/// Outbound interface address used to reach the internet.
///
/// Connecting a UDP socket sends nothing; it only asks the OS to pick a
/// route, whose source address is the LAN address peers can reach.
pub fn detect_lan_ip() -> Option<IpAddr> {
    route_source("8.8.8.8:80".parse().ok()?)
}

/// Source address the OS would use to reach `target`
pub fn route_source(target: SocketAddr) -> Option<IpAddr> {
    let bind: SocketAddr = if target.is_ipv4() {
        SocketAddr::from(([0, 0, 0, 0], 0))
    } else {
        SocketAddr::from(([0u16; 8], 0))
    };

    let socket = UdpSocket::bind(bind).ok()?;
    socket.connect(target).ok()?;
    let ip = socket.local_addr().ok()?.ip();
    (!ip.is_unspecified()).then_some(ip)
}

/// Whether `ip` is a private-range (RFC 1918 / ULA) address
pub fn is_private(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4.is_private() || v4.is_link_local(),
        IpAddr::V6(v6) => (v6.segments()[0] & 0xfe00) == 0xfc00,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_route_to_loopback() {
        let ip = route_source("127.0.0.1:9".parse().unwrap()).unwrap();
        assert!(ip.is_loopback());
    }

    #[test]
    fn test_is_private() {
        assert!(is_private(&"192.168.1.100".parse().unwrap()));
        assert!(is_private(&"10.1.2.3".parse().unwrap()));
        assert!(is_private(&"fd00::1".parse().unwrap()));
        assert!(!is_private(&"8.8.8.8".parse().unwrap()));
        assert!(!is_private(&"2001:db8::1".parse().unwrap()));
    }
}
