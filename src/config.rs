use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;

/// System-wide configuration path, used when running as the portal service.
const SYSTEM_CONFIG_PATH: &str = "/etc/captive-portal/config.toml";

/// Static, declarative configuration for the portal: the access point
/// identity, its subnet, and where captive clients get redirected.
///
/// Loaded once at startup and never mutated mid-run. Every value has a
/// working default so the portal can come up on a fresh install with no
/// config file at all.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PortalConfig {
    /// Wireless interface the access point runs on.
    pub interface: String,

    /// SSID advertised in AP mode. Doubles as the NetworkManager profile
    /// name for the AP connection, and is excluded from scans and from
    /// saved-profile recovery.
    pub ap_ssid: String,

    /// WPA-PSK passphrase for the access point.
    pub ap_passphrase: String,

    /// Gateway address of the AP subnet. All DNS answers and HTTP redirects
    /// point here while the portal is active.
    pub gateway: String,

    /// Subnet prefix length for the AP network.
    pub prefix_len: u8,

    /// DHCP pool handed out to captive clients.
    pub dhcp_range_start: String,
    pub dhcp_range_end: String,

    /// DHCP lease time, in dnsmasq syntax (e.g. "24h").
    pub lease_time: String,

    /// Port the portal HTTP server listens on; inbound 80/443 on the
    /// wireless interface is rewritten to this port.
    pub portal_port: u16,
}

impl Default for PortalConfig {
    fn default() -> Self {
        PortalConfig {
            interface: "wlan0".to_string(),
            ap_ssid: "SetupPortal".to_string(),
            ap_passphrase: "changeme123".to_string(),
            gateway: "10.42.0.1".to_string(),
            prefix_len: 24,
            dhcp_range_start: "10.42.0.2".to_string(),
            dhcp_range_end: "10.42.0.20".to_string(),
            lease_time: "24h".to_string(),
            portal_port: 5000,
        }
    }
}

impl PortalConfig {
    /// Load the configuration, preferring the system path and falling back
    /// to the per-user config directory. A missing file yields the defaults.
    pub fn load() -> Result<Self> {
        for path in candidate_paths() {
            if path.exists() {
                let content = fs::read_to_string(&path)
                    .with_context(|| format!("Failed to read config file: {}", path.display()))?;
                return toml::from_str(&content)
                    .with_context(|| format!("Failed to parse config file: {}", path.display()));
            }
        }
        Ok(PortalConfig::default())
    }

    /// Gateway address with the prefix length, e.g. "10.42.0.1/24".
    pub fn gateway_cidr(&self) -> String {
        format!("{}/{}", self.gateway, self.prefix_len)
    }

    /// Destination for the captive-portal DNAT rules, e.g. "10.42.0.1:5000".
    pub fn redirect_target(&self) -> String {
        format!("{}:{}", self.gateway, self.portal_port)
    }
}

fn candidate_paths() -> Vec<PathBuf> {
    let mut paths = vec![PathBuf::from(SYSTEM_CONFIG_PATH)];
    if let Some(config_dir) = dirs::config_dir() {
        paths.push(config_dir.join("captive-portal").join("config.toml"));
    }
    paths
}

/// Path a freshly written config would land at, for display purposes.
pub fn config_path() -> PathBuf {
    PathBuf::from(SYSTEM_CONFIG_PATH)
}
