use std::{
    env,
    net::{Ipv4Addr, SocketAddr},
    path::PathBuf,
};

use serde::Deserialize;

/// Everything the manager needs to know about the host it runs on.
///
/// The external bridge, its DHCP server, and IP forwarding are operator
/// prerequisites; the internal bridge is created by the manager on first
/// need. Defaults can be overridden with a JSON blob in `LABVISOR_CONFIG`.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct LabConfig {
    pub external_bridge: String,
    pub internal_bridge: String,
    pub internal_gateway: Ipv4Addr,
    pub internal_prefix_len: u8,
    pub library_dir: PathBuf,
    pub log_dir: PathBuf,
    pub overlay_dir: PathBuf,
    pub external_leases: PathBuf,
    pub internal_leases: PathBuf,
    pub listen_addr: SocketAddr,
}

impl Default for LabConfig {
    fn default() -> Self {
        Self {
            external_bridge: "br0".into(),
            internal_bridge: "br_internal".into(),
            internal_gateway: Ipv4Addr::new(192, 168, 200, 1),
            internal_prefix_len: 24,
            library_dir: "library".into(),
            log_dir: "logs".into(),
            overlay_dir: "overlays".into(),
            external_leases: "/var/lib/misc/dnsmasq-br0.leases".into(),
            internal_leases: "/var/lib/misc/dnsmasq-br_internal.leases".into(),
            listen_addr: ([0, 0, 0, 0], 5000).into(),
        }
    }
}

impl LabConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        match env::var("LABVISOR_CONFIG") {
            Ok(raw) => Ok(serde_json::from_str(&raw)?),
            Err(_) => Ok(Self::default()),
        }
    }
}
