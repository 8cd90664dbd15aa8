use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use netif_cni::config::parse_subnet;
use netif_cni::types::DEFAULT_CNI_VERSION;

/// Network configuration as the runtime hands it to the plugin
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkConfig {
    cni_version: String,
    name: String,
    #[serde(rename = "type")]
    plugin_type: String,
    subnet: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    gateway: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    bridge: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    mtu: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    data_dir: Option<PathBuf>,
}

pub struct GenerateArgs<'a> {
    pub name: &'a str,
    pub subnet: &'a str,
    pub gateway: Option<&'a str>,
    pub bridge: Option<&'a str>,
    pub mtu: Option<u32>,
    pub data_dir: Option<PathBuf>,
}

/// Build a network configuration, validating the subnet and gateway the
/// same way the plugin will.
pub fn generate_network_config(args: GenerateArgs<'_>) -> Result<NetworkConfig> {
    let subnet = parse_subnet(args.subnet).context("Invalid subnet")?;

    if let Some(gw) = args.gateway {
        let gw: std::net::Ipv4Addr = gw
            .parse()
            .with_context(|| format!("Invalid gateway address {}", gw))?;
        if !subnet.contains(gw) {
            anyhow::bail!("Gateway {} is outside subnet {}", gw, subnet);
        }
    }

    Ok(NetworkConfig {
        cni_version: DEFAULT_CNI_VERSION.to_string(),
        name: args.name.to_string(),
        plugin_type: "netif-cni".to_string(),
        subnet: subnet.to_string(),
        gateway: args.gateway.map(str::to_string),
        bridge: args.bridge.map(str::to_string),
        mtu: args.mtu,
        data_dir: args.data_dir,
    })
}
