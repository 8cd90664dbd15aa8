//! epair interfaces and vnet jails.

use std::net::Ipv4Addr;
use std::path::Path;
use std::str::FromStr;

use ipnetwork::Ipv4Network;
use tracing::{debug, info};

use crate::config::NetConf;
use crate::effector::{HostCommand, SystemEffector};
use crate::error::{CniError, CniResult};
use crate::request::RequestContext;

use super::{gen_mac_addr, mask_prefix, NetIf, NetIfState, Platform};

const DEVICE_PREFIX: &str = "epair";
/// Highest epair index considered before giving up
const MAX_DEVICE_INDEX: u32 = 32768;

fn ifconfig<'a, I: IntoIterator<Item = &'a str>>(args: I) -> HostCommand {
    HostCommand::new("ifconfig").args(args)
}

/// Run `ifconfig` inside `jail`
fn jail_ifconfig<'a, I: IntoIterator<Item = &'a str>>(jail: &str, args: I) -> HostCommand {
    HostCommand::new("jexec").args([jail, "ifconfig"]).args(args)
}

/// Addresses from `ifconfig <if> inet`, e.g.
/// `inet 172.16.0.2 netmask 0xffffff00 broadcast 172.16.0.255`
pub fn parse_inet(output: &str) -> CniResult<Vec<Ipv4Network>> {
    let mut addrs = Vec::new();
    for line in output.lines() {
        let fields: Vec<&str> = line.split_whitespace().collect();
        let (Some(&"inet"), Some(addr)) = (fields.first(), fields.get(1)) else {
            continue;
        };
        let addr = Ipv4Addr::from_str(addr)
            .map_err(|_| CniError::CheckFailed(format!("unparsable address in {:?}", line)))?;
        let prefix = match fields.iter().position(|f| *f == "netmask") {
            Some(i) => {
                let mask = fields.get(i + 1).copied().unwrap_or_default();
                let mask = u32::from_str_radix(mask.trim_start_matches("0x"), 16)
                    .map_err(|_| CniError::CheckFailed(format!("unparsable netmask in {:?}", line)))?;
                mask_prefix(mask)?
            }
            None => 32,
        };
        let net = Ipv4Network::new(addr, prefix)
            .map_err(|e| CniError::CheckFailed(format!("{}: {}", line, e)))?;
        addrs.push(net);
    }
    Ok(addrs)
}

pub struct FreeBsdNetIf {
    state: NetIfState,
}

impl FreeBsdNetIf {
    pub fn new(conf: NetConf, request: RequestContext, effector: Box<dyn SystemEffector>) -> Self {
        Self {
            state: NetIfState::new(conf, request, effector),
        }
    }

    /// Jail the container lives in. A path names the jail by its last
    /// component.
    fn jail(&self) -> String {
        let netns = &self.state.request.netns;
        Path::new(netns)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| netns.clone())
    }

    fn host_end(&self) -> String {
        format!("{}a", self.state.virtual_if.device)
    }

    fn container_end(&self) -> String {
        format!("{}b", self.state.virtual_if.device)
    }

    fn host_interfaces(&self) -> CniResult<Vec<String>> {
        let out = self.state.effector.capture(&ifconfig(["-l"]))?;
        Ok(out.split_whitespace().map(str::to_string).collect())
    }

    fn run(&self, cmd: HostCommand, what: &str) -> CniResult<()> {
        self.state
            .effector
            .execute(&cmd)
            .map_err(|e| CniError::wrap(what.to_string(), e))
    }

    fn configure_container_end(&self, jail: &str) -> CniResult<()> {
        let ctr = &self.state.container_if;
        let name = ctr.name.as_str();
        let cidr = ctr
            .ip
            .ok_or_else(|| CniError::config("container address was not assigned"))?
            .to_string();

        self.run(
            jail_ifconfig(jail, [self.container_end().as_str(), "name", name]),
            "rename container interface",
        )?;
        self.run(
            jail_ifconfig(jail, [name, "ether", ctr.mac.as_str()]),
            "set container MAC address",
        )?;
        if let Some(mtu) = self.state.conf.mtu {
            self.run(
                jail_ifconfig(jail, [name, "mtu", mtu.to_string().as_str()]),
                "set container MTU",
            )?;
        }
        self.run(
            jail_ifconfig(jail, [name, "inet", cidr.as_str()]),
            "assign container address",
        )?;
        self.run(jail_ifconfig(jail, [name, "up"]), "bring container interface up")?;
        if let Some(gw) = self.state.conf.gateway {
            self.run(
                HostCommand::new("jexec")
                    .args([jail, "route", "add", "default"])
                    .arg(gw.to_string()),
                "add default route",
            )?;
        }
        Ok(())
    }

    fn configure_host_end(&self) -> CniResult<()> {
        let host = self.host_end();
        if let Some(mtu) = self.state.conf.mtu {
            self.run(
                ifconfig([host.as_str(), "mtu", mtu.to_string().as_str()]),
                "set host MTU",
            )?;
        }
        if let Some(bridge) = &self.state.conf.bridge {
            self.run(
                ifconfig([bridge.as_str(), "addm", host.as_str()]),
                "attach host interface to bridge",
            )?;
        }
        self.run(ifconfig([host.as_str(), "up"]), "bring host interface up")
    }
}

impl NetIf for FreeBsdNetIf {
    fn platform(&self) -> Platform {
        Platform::FreeBsd
    }

    fn state(&self) -> &NetIfState {
        &self.state
    }

    fn state_mut(&mut self) -> &mut NetIfState {
        &mut self.state
    }

    fn host_if_name(&self) -> String {
        self.host_end()
    }

    fn allocate(&mut self) -> CniResult<()> {
        self.state.lock_devices()?;
        let existing = self.host_interfaces()?;

        let taken = |n: u32| {
            let a = format!("{}{}a", DEVICE_PREFIX, n);
            let b = format!("{}{}b", DEVICE_PREFIX, n);
            existing.iter().any(|i| *i == a || *i == b)
        };
        let index = (0..MAX_DEVICE_INDEX)
            .find(|n| !taken(*n))
            .ok_or_else(|| CniError::DeviceUnavailable(DEVICE_PREFIX.to_string()))?;

        let device = format!("{}{}", DEVICE_PREFIX, index);
        debug!("epair for {}: {}", self.state.request.container_id, device);
        self.state.virtual_if.device = device;
        self.state.container_if.mac = gen_mac_addr();
        Ok(())
    }

    fn create(&mut self) -> CniResult<()> {
        if self.state.virtual_if.device.is_empty() {
            self.allocate()?;
        }
        if self.state.container_if.ip.is_none() {
            self.new_ip()?;
        }

        let jail = self.jail();
        let device = self.state.virtual_if.device.clone();

        let created = self.run(ifconfig([device.as_str(), "create"]), "create epair");
        self.state.unlock_devices();
        created?;

        self.run(
            ifconfig([self.container_end().as_str(), "vnet", jail.as_str()]),
            "move interface into jail",
        )?;
        self.configure_container_end(&jail)?;
        self.configure_host_end()?;

        info!(
            "attached {} ({}) to jail {} via {}",
            self.state.container_if.name,
            self.state
                .container_if
                .ip
                .map(|ip| ip.to_string())
                .unwrap_or_default(),
            jail,
            self.host_end()
        );
        Ok(())
    }

    fn delete(&mut self) -> CniResult<()> {
        let prev = self.state.previous_result()?;
        self.state.restore(&prev)?;

        // results carry the host end, e.g. epair3a
        let restored = self.state.virtual_if.device.clone();
        if let Some(device) = restored.strip_suffix('a') {
            self.state.virtual_if.device = device.to_string();
        }

        let teardown = self.state.begin_teardown(&prev)?;
        if teardown.reassigned(&self.state.virtual_if.device) {
            return Ok(());
        }

        if !self.state.virtual_if.device.is_empty() {
            let host = self.host_end();
            let interfaces = self.host_interfaces();
            if self
                .state
                .absent_on_dry_run("list host interfaces", interfaces)?
                .contains(&host)
            {
                // destroying one end destroys the pair
                self.run(ifconfig([host.as_str(), "destroy"]), "destroy epair")?;
            } else {
                debug!("host interface {} already gone", host);
            }
        } else {
            let jail = self.jail();
            let name = self.state.container_if.name.clone();
            let present = self
                .state
                .effector
                .capture(&jail_ifconfig(&jail, ["-l"]))
                .map(|out| out.split_whitespace().any(|i| i == name))
                .unwrap_or(false);
            if present {
                self.run(
                    jail_ifconfig(&jail, [name.as_str(), "destroy"]),
                    "destroy container interface",
                )?;
            } else {
                debug!("container interface {} already gone", name);
            }
        }

        teardown.release()
    }

    fn check(&mut self) -> CniResult<()> {
        let prev = self.state.previous_result()?;
        self.state.restore(&prev)?;

        let jail = self.jail();
        let name = self.state.container_if.name.clone();
        let out = self
            .state
            .effector
            .capture(&jail_ifconfig(&jail, [name.as_str(), "inet"]))
            .map_err(|e| CniError::wrap(format!("inspect {}", name), e))?;

        if let Some(cidr) = self.state.container_if.ip {
            if !parse_inet(&out)?.contains(&cidr) {
                return Err(CniError::CheckFailed(format!(
                    "interface {} does not carry {}",
                    name, cidr
                )));
            }
        }
        Ok(())
    }
}
