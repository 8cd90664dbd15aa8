use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::str::FromStr;

use ipnetwork::{IpNetwork, Ipv4Network};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::debug;

use crate::error::{CniError, CniResult};
use crate::request::{Command, RequestContext};
use crate::types::{SuccessResult, DEFAULT_CNI_VERSION, DNS, SUPPORTED_VERSIONS};

/// Default root directory for the allocation ledger
pub const DEFAULT_DATA_DIR: &str = "/var/lib/netif-cni";

/// Host level defaults shared by the plugin and the control tool
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginSettings {
    /// Root directory of the allocation ledger
    pub data_dir: PathBuf,
}

impl Default for PluginSettings {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from(DEFAULT_DATA_DIR),
        }
    }
}

/// Typed view over the keys this plugin understands
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct KnownFields {
    cni_version: Option<String>,
    name: Option<String>,
    subnet: Option<Value>,
    gateway: Option<String>,
    bridge: Option<String>,
    mtu: Option<u32>,
    data_dir: Option<PathBuf>,
    dns: Option<DNS>,
}

/// Network configuration for one invocation, read from stdin
#[derive(Debug, Clone)]
pub struct NetConf {
    /// Full configuration, in input order, unknown keys included
    pub raw: Map<String, Value>,
    /// CNI specification version
    pub cni_version: String,
    /// Name of the network
    pub name: Option<String>,
    /// Subnet CIDR as given; required for ADD
    pub subnet: Option<String>,
    /// Parsed subnet, normalised to its network address
    pub network: Option<Ipv4Network>,
    /// Gateway address inside the subnet, never handed to a container
    pub gateway: Option<Ipv4Addr>,
    /// Host bridge the host end gets attached to
    pub bridge: Option<String>,
    /// Interface MTU
    pub mtu: Option<u32>,
    /// Root directory of the allocation ledger
    pub data_dir: PathBuf,
    /// DNS settings passed through to the result
    pub dns: Option<DNS>,
    /// Result of the earlier ADD; required for DEL and CHECK
    pub prev_result: Option<Map<String, Value>>,
}

impl NetConf {
    /// Parse NetConf from the stdin payload, enforcing the keys `request`'s
    /// command depends on.
    pub fn parse(bytes: &[u8], request: &RequestContext) -> CniResult<Self> {
        if bytes.iter().all(u8::is_ascii_whitespace) {
            return Err(CniError::EmptyConfig);
        }

        let raw = match serde_json::from_slice::<Value>(bytes)? {
            Value::Object(map) => map,
            other => {
                return Err(CniError::config(format!(
                    "expected a JSON object, got {}",
                    json_type(&other)
                )))
            }
        };

        let known: KnownFields = serde_json::from_value(Value::Object(raw.clone()))?;

        let cni_version = known
            .cni_version
            .unwrap_or_else(|| DEFAULT_CNI_VERSION.to_string());
        if !SUPPORTED_VERSIONS.contains(&cni_version.as_str()) {
            return Err(CniError::IncompatibleVersion(cni_version));
        }

        let subnet = match known.subnet {
            None | Some(Value::Null) => None,
            Some(Value::String(s)) => Some(s),
            Some(other) => {
                return Err(CniError::config(format!(
                    "subnet must be a string, got {}",
                    json_type(&other)
                )))
            }
        };
        let network = subnet.as_deref().map(parse_subnet).transpose()?;

        let gateway = known
            .gateway
            .as_deref()
            .map(|gw| {
                Ipv4Addr::from_str(gw)
                    .map_err(|_| CniError::config(format!("invalid gateway address {:?}", gw)))
            })
            .transpose()?;
        if let (Some(gw), Some(net)) = (gateway, network) {
            if !net.contains(gw) {
                return Err(CniError::config(format!(
                    "gateway {} is outside subnet {}",
                    gw, net
                )));
            }
        }

        let prev_result = match raw.get("prevResult") {
            None | Some(Value::Null) => None,
            Some(Value::Object(map)) => Some(map.clone()),
            Some(other) => {
                return Err(CniError::config(format!(
                    "prevResult must be an object, got {}",
                    json_type(other)
                )))
            }
        };

        match request.command {
            Command::Add if network.is_none() => {
                return Err(CniError::config("subnet is required for ADD"));
            }
            Command::Del | Command::Check if prev_result.is_none() => {
                return Err(CniError::config(format!(
                    "prevResult is required for {}",
                    request.command
                )));
            }
            _ => {}
        }

        let conf = Self {
            raw,
            cni_version,
            name: known.name,
            subnet,
            network,
            gateway,
            bridge: known.bridge.filter(|b| !b.is_empty()),
            mtu: known.mtu,
            data_dir: known
                .data_dir
                .unwrap_or_else(|| PluginSettings::default().data_dir),
            dns: known.dns,
            prev_result,
        };
        debug!(
            "network configuration: name={:?} subnet={:?} bridge={:?}",
            conf.name, conf.subnet, conf.bridge
        );
        Ok(conf)
    }

    /// Subnet the container address is drawn from
    pub fn network(&self) -> CniResult<Ipv4Network> {
        self.network
            .ok_or_else(|| CniError::config("no subnet configured"))
    }

    /// Decode `prevResult` into the CNI result shape
    pub fn previous_result(&self) -> CniResult<Option<SuccessResult>> {
        self.prev_result
            .as_ref()
            .map(|map| serde_json::from_value(Value::Object(map.clone())))
            .transpose()
            .map_err(CniError::from)
    }
}

/// CNI version named by a configuration or result document, when it is one
/// this plugin speaks. Errors are reported in that version.
pub fn cni_version_hint(bytes: &[u8]) -> String {
    serde_json::from_slice::<Value>(bytes)
        .ok()
        .and_then(|doc| doc.get("cniVersion").and_then(Value::as_str).map(str::to_string))
        .filter(|v| SUPPORTED_VERSIONS.contains(&v.as_str()))
        .unwrap_or_else(|| DEFAULT_CNI_VERSION.to_string())
}

/// Parse an IPv4 CIDR and normalise it to the network address
pub fn parse_subnet(subnet: &str) -> CniResult<Ipv4Network> {
    match IpNetwork::from_str(subnet) {
        Ok(IpNetwork::V4(net)) => Ipv4Network::new(net.network(), net.prefix())
            .map_err(|e| CniError::config(format!("invalid subnet {:?}: {}", subnet, e))),
        Ok(IpNetwork::V6(_)) => Err(CniError::config(format!(
            "subnet {} is not IPv4; only IPv4 subnets are supported",
            subnet
        ))),
        Err(e) => Err(CniError::config(format!("invalid subnet {:?}: {}", subnet, e))),
    }
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_subnet_normalises() {
        let net = parse_subnet("10.1.2.3/16").unwrap();
        assert_eq!(net.to_string(), "10.1.0.0/16");
        assert!(parse_subnet("10.1.2.3/33").is_err());
        assert!(parse_subnet("fd00::/64").is_err());
        assert!(parse_subnet("not-a-subnet").is_err());
    }

    #[test]
    fn test_cni_version_hint() {
        assert_eq!(cni_version_hint(br#"{"cniVersion": "0.4.0"}"#), "0.4.0");
        assert_eq!(cni_version_hint(br#"{"cniVersion": "9.9.9"}"#), DEFAULT_CNI_VERSION);
        assert_eq!(cni_version_hint(b"{broken"), DEFAULT_CNI_VERSION);
        assert_eq!(cni_version_hint(b""), DEFAULT_CNI_VERSION);
    }
}
