use crate::config::NetConf;
use crate::error::{CniError, CniResult};
use crate::netif::NetIf;
use crate::request::RequestContext;
use crate::types::{IPConfig, Interface, Route, SuccessResult};

/// Assembles the ADD success document from an engine's interface data.
/// Building it never touches the host.
#[derive(Debug, Clone)]
pub struct AddResult {
    result: SuccessResult,
}

impl AddResult {
    pub fn new(conf: &NetConf, request: &RequestContext, netif: &dyn NetIf) -> Self {
        let mut result = SuccessResult::new(&conf.cni_version);

        let host_name = netif.host_if_name();
        if !host_name.is_empty() {
            result.add_interface(Interface {
                name: host_name,
                mac: netif.virtual_if().mac.clone(),
                sandbox: None,
            });
        }

        let ctr = netif.container_if();
        let index = result.add_interface(Interface {
            name: ctr.name.clone(),
            mac: Some(ctr.mac.clone()).filter(|m| !m.is_empty()),
            sandbox: Some(request.netns.clone()),
        });
        let gateway = conf.gateway.map(|gw| gw.to_string());
        if let Some(ip) = ctr.ip {
            result.add_ip(IPConfig {
                address: ip.to_string(),
                interface: Some(index),
                gateway: gateway.clone(),
            });
        }
        if let Some(gw) = gateway {
            result.add_route(Route {
                dst: "0.0.0.0/0".to_string(),
                gw: Some(gw),
            });
        }
        if let Some(dns) = &conf.dns {
            result.set_dns(dns.clone());
        }

        Self { result }
    }

    pub fn result(&self) -> &SuccessResult {
        &self.result
    }

    pub fn into_result(self) -> SuccessResult {
        self.result
    }

    /// Serialise the result document
    pub fn json_output(&self) -> CniResult<String> {
        serde_json::to_string(&self.result).map_err(CniError::from)
    }
}
