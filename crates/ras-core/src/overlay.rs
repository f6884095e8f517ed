//! Overlay network (Tailscale) detection
//!
//! The daemon advertises its overlay address in the pairing payload when
//! Tailscale is running; the client tries that address first.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::process::Command;

/// Local overlay node as reported by `tailscale status --json`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OverlayStatus {
    /// Whether the backend is up and logged in
    pub running: bool,
    /// Device name (e.g. "lab-server")
    pub device_name: String,
    /// Overlay addresses of this node
    pub addresses: Vec<IpAddr>,
    /// Number of peers currently online
    pub online_peers: usize,
}

impl OverlayStatus {
    /// Preferred overlay address (IPv4 first)
    pub fn primary_address(&self) -> Option<IpAddr> {
        self.addresses
            .iter()
            .find(|ip| ip.is_ipv4())
            .or_else(|| self.addresses.first())
            .copied()
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct TailscaleStatus {
    backend_state: String,
    #[serde(rename = "Self")]
    self_node: Option<NodeStatus>,
    #[serde(default, deserialize_with = "deserialize_null_as_empty_map")]
    peer: HashMap<String, NodeStatus>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct NodeStatus {
    #[serde(rename = "DNSName", default)]
    dns_name: String,
    #[serde(rename = "TailscaleIPs", default)]
    tailscale_ips: Vec<String>,
    #[serde(default)]
    online: bool,
}

/// Deserialize null as an empty HashMap
fn deserialize_null_as_empty_map<'de, D, K, V>(deserializer: D) -> Result<HashMap<K, V>, D::Error>
where
    D: serde::Deserializer<'de>,
    K: std::cmp::Eq + std::hash::Hash + Deserialize<'de>,
    V: Deserialize<'de>,
{
    Option::<HashMap<K, V>>::deserialize(deserializer).map(|opt| opt.unwrap_or_default())
}

/// Parse the output of `tailscale status --json`
pub fn parse_status(json: &[u8]) -> Result<OverlayStatus> {
    let status: TailscaleStatus =
        serde_json::from_slice(json).context("Failed to parse tailscale status JSON")?;

    let running = status.backend_state == "Running";
    let (device_name, addresses) = match status.self_node {
        Some(node) => {
            // "lab-server.tailnet-abc.ts.net." -> "lab-server"
            let dns_name = node.dns_name.trim_end_matches('.');
            let device_name = dns_name.split('.').next().unwrap_or(dns_name).to_string();
            let addresses = node
                .tailscale_ips
                .iter()
                .filter_map(|ip| ip.parse().ok())
                .collect();
            (device_name, addresses)
        }
        None => (String::new(), Vec::new()),
    };

    Ok(OverlayStatus {
        running,
        device_name,
        addresses,
        online_peers: status.peer.values().filter(|p| p.online).count(),
    })
}

/// Query the local Tailscale daemon; `Ok(None)` when it is not installed
pub fn local_status() -> Result<Option<OverlayStatus>> {
    let output = match Command::new("tailscale").args(["status", "--json"]).output() {
        Ok(output) => output,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e).context("Failed to run tailscale status"),
    };

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        // Installed but stopped or logged out
        if stderr.contains("not logged in") || stderr.contains("stopped") {
            return Ok(Some(OverlayStatus {
                running: false,
                device_name: String::new(),
                addresses: Vec::new(),
                online_peers: 0,
            }));
        }
        anyhow::bail!("Tailscale status failed: {}", stderr);
    }

    parse_status(&output.stdout).map(Some)
}

/// This machine's overlay address, if Tailscale is up
pub fn local_overlay_ip() -> Option<IpAddr> {
    match local_status() {
        Ok(Some(status)) if status.running => status.primary_address(),
        Ok(_) => None,
        Err(e) => {
            tracing::debug!("Overlay detection failed: {:#}", e);
            None
        }
    }
}

/// Whether `ip` is in Tailscale's address ranges
/// (100.64.0.0/10 or fd7a:115c:a1e0::/48)
pub fn is_overlay_ip(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            let base = u32::from(Ipv4Addr::new(100, 64, 0, 0));
            u32::from(*v4) & 0xFFC0_0000 == base
        }
        IpAddr::V6(v6) => {
            let prefix = Ipv6Addr::new(0xfd7a, 0x115c, 0xa1e0, 0, 0, 0, 0, 0).segments();
            v6.segments()[..3] == prefix[..3]
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const STATUS: &str = r#"{
        "BackendState": "Running",
        "Self": {
            "DNSName": "lab-server.tailnet-abc.ts.net.",
            "TailscaleIPs": ["fd7a:115c:a1e0::1", "100.101.102.103"],
            "Online": true
        },
        "CurrentTailnet": {"Name": "me@example.com", "MagicDNSSuffix": "tailnet-abc.ts.net"},
        "Peer": {
            "a": {"DNSName": "phone.tailnet-abc.ts.net.", "TailscaleIPs": ["100.64.0.7"], "Online": true},
            "b": {"DNSName": "old.tailnet-abc.ts.net.", "TailscaleIPs": ["100.64.0.8"], "Online": false}
        }
    }"#;

    #[test]
    fn test_parse_running_status() {
        let status = parse_status(STATUS.as_bytes()).unwrap();
        assert!(status.running);
        assert_eq!(status.device_name, "lab-server");
        assert_eq!(status.addresses.len(), 2);
        assert_eq!(
            status.primary_address(),
            Some("100.101.102.103".parse().unwrap())
        );
        assert_eq!(status.online_peers, 1);
    }

    #[test]
    fn test_parse_stopped_with_null_peers() {
        let status =
            parse_status(br#"{"BackendState": "Stopped", "Self": null, "Peer": null}"#).unwrap();
        assert!(!status.running);
        assert_eq!(status.primary_address(), None);
        assert_eq!(status.online_peers, 0);
    }

    #[test]
    fn test_is_overlay_ip() {
        assert!(is_overlay_ip(&"100.64.0.1".parse().unwrap()));
        assert!(is_overlay_ip(&"100.127.255.254".parse().unwrap()));
        assert!(!is_overlay_ip(&"100.128.0.1".parse().unwrap()));
        assert!(!is_overlay_ip(&"192.168.1.100".parse().unwrap()));
        assert!(is_overlay_ip(&"fd7a:115c:a1e0:ab12::1".parse().unwrap()));
        assert!(!is_overlay_ip(&"fd7a:115c:a1e1::1".parse().unwrap()));
    }
}
