use serde::{Deserialize, Serialize};

/// CNI specification version emitted when the configuration names none
pub const DEFAULT_CNI_VERSION: &str = "1.0.0";

/// CNI specification versions this plugin can speak
pub const SUPPORTED_VERSIONS: &[&str] = &["0.3.0", "0.3.1", "0.4.0", "1.0.0"];

/// Success result format (CNI 1.0.0)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SuccessResult {
    /// CNI specification version
    #[serde(rename = "cniVersion", default)]
    pub cni_version: String,
    /// Interfaces created
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interfaces: Option<Vec<Interface>>,
    /// IP configurations
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ips: Option<Vec<IPConfig>>,
    /// Routes to configure
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub routes: Option<Vec<Route>>,
    /// DNS configuration
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dns: Option<DNS>,
}

/// Interface information
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Interface {
    /// Interface name
    pub name: String,
    /// MAC address
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mac: Option<String>,
    /// Sandbox path (network namespace); absent for host side interfaces
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sandbox: Option<String>,
}

/// IP configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IPConfig {
    /// IP address with prefix length
    pub address: String,
    /// Index into `interfaces` this IP is assigned to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interface: Option<usize>,
    /// Gateway
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gateway: Option<String>,
}

/// DNS configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DNS {
    /// DNS nameservers
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nameservers: Option<Vec<String>>,
    /// DNS domain
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
    /// DNS search domains
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub search: Option<Vec<String>>,
    /// DNS options
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub options: Option<Vec<String>>,
}

/// Route configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Route {
    /// Destination CIDR
    pub dst: String,
    /// Gateway for this route
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gw: Option<String>,
}

/// Error result format
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResult {
    #[serde(rename = "cniVersion")]
    pub cni_version: String,
    pub code: u32,
    pub msg: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

/// Answer to the VERSION command
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VersionResult {
    #[serde(rename = "cniVersion")]
    pub cni_version: String,
    #[serde(rename = "supportedVersions")]
    pub supported_versions: Vec<String>,
}

impl Default for VersionResult {
    fn default() -> Self {
        Self {
            cni_version: DEFAULT_CNI_VERSION.to_string(),
            supported_versions: SUPPORTED_VERSIONS.iter().map(|v| v.to_string()).collect(),
        }
    }
}

impl SuccessResult {
    /// Create a new empty result
    pub fn new(cni_version: &str) -> Self {
        Self {
            cni_version: cni_version.to_string(),
            ..Default::default()
        }
    }

    /// Add an interface to the result and return its index
    pub fn add_interface(&mut self, interface: Interface) -> usize {
        let interfaces = self.interfaces.get_or_insert_with(Vec::new);
        interfaces.push(interface);
        interfaces.len() - 1
    }

    /// Add an IP configuration to the result
    pub fn add_ip(&mut self, ip: IPConfig) {
        self.ips.get_or_insert_with(Vec::new).push(ip);
    }

    /// Add a route to the result
    pub fn add_route(&mut self, route: Route) {
        self.routes.get_or_insert_with(Vec::new).push(route);
    }

    /// Set DNS configuration
    pub fn set_dns(&mut self, dns: DNS) {
        self.dns = Some(dns);
    }

    /// Host side interface, i.e. the first one without a sandbox
    pub fn host_interface(&self) -> Option<&Interface> {
        self.interfaces
            .as_ref()
            .and_then(|ifs| ifs.iter().find(|i| i.sandbox.is_none()))
    }

    /// Container side interface, i.e. the first one with a sandbox
    pub fn container_interface(&self) -> Option<(usize, &Interface)> {
        self.interfaces
            .as_ref()
            .and_then(|ifs| ifs.iter().enumerate().find(|(_, i)| i.sandbox.is_some()))
    }

    /// First address assigned to the interface at `index`, falling back to
    /// the first address when no IP names an interface.
    pub fn address_for(&self, index: Option<usize>) -> Option<&IPConfig> {
        let ips = self.ips.as_ref()?;
        ips.iter()
            .find(|ip| index.is_some() && ip.interface == index)
            .or_else(|| ips.iter().find(|ip| ip.interface.is_none()))
            .or_else(|| ips.first())
    }
}
