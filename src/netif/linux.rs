//! veth pairs and network namespaces.

use std::path::{Path, PathBuf};

use rand::Rng;
use tracing::{debug, info};

use crate::config::NetConf;
use crate::effector::{HostCommand, SystemEffector};
use crate::error::{CniError, CniResult};
use crate::request::RequestContext;

use super::{gen_mac_addr, NetIf, NetIfState, Platform};

const HOST_PREFIX: &str = "veth";
/// Random names tried before giving up
const NAME_ATTEMPTS: usize = 16;

/// Names from `ip -o link show`, e.g. `5: veth1a2b3c4d@if4: <...>`
pub fn parse_link_names(output: &str) -> Vec<String> {
    output
        .lines()
        .filter_map(|line| line.split(": ").nth(1))
        .map(|name| name.split('@').next().unwrap_or(name).trim().to_string())
        .filter(|name| !name.is_empty())
        .collect()
}

fn ip<'a, I: IntoIterator<Item = &'a str>>(args: I) -> HostCommand {
    HostCommand::new("ip").args(args)
}

pub struct LinuxNetIf {
    state: NetIfState,
}

impl LinuxNetIf {
    pub fn new(conf: NetConf, request: RequestContext, effector: Box<dyn SystemEffector>) -> Self {
        Self {
            state: NetIfState::new(conf, request, effector),
        }
    }

    fn netns(&self) -> PathBuf {
        PathBuf::from(&self.state.request.netns)
    }

    fn host_links(&self) -> CniResult<Vec<String>> {
        let out = self.state.effector.capture(&ip(["-o", "link", "show"]))?;
        Ok(parse_link_names(&out))
    }

    fn run(&self, cmd: HostCommand, what: &str) -> CniResult<()> {
        self.state
            .effector
            .execute(&cmd)
            .map_err(|e| CniError::wrap(what.to_string(), e))
    }

    fn peer_name(&self) -> String {
        format!("{}p", self.state.virtual_if.device)
    }

    fn configure_container_end(&self, netns: &Path, peer: &str) -> CniResult<()> {
        let ctr = &self.state.container_if;
        let cidr = ctr
            .ip
            .ok_or_else(|| CniError::config("container address was not assigned"))?
            .to_string();

        self.run(
            ip(["link", "set", "dev", peer, "name", ctr.name.as_str()]).in_netns(netns),
            "rename container interface",
        )?;
        self.run(
            ip(["link", "set", "dev", ctr.name.as_str(), "address", ctr.mac.as_str()]).in_netns(netns),
            "set container MAC address",
        )?;
        if let Some(mtu) = self.state.conf.mtu {
            self.run(
                ip(["link", "set", "dev", ctr.name.as_str(), "mtu", mtu.to_string().as_str()]).in_netns(netns),
                "set container MTU",
            )?;
        }
        self.run(
            ip(["addr", "add", cidr.as_str(), "dev", ctr.name.as_str()]).in_netns(netns),
            "assign container address",
        )?;
        self.run(
            ip(["link", "set", "dev", ctr.name.as_str(), "up"]).in_netns(netns),
            "bring container interface up",
        )?;
        if let Some(gw) = self.state.conf.gateway {
            self.run(
                ip(["route", "add", "default", "via", gw.to_string().as_str(), "dev", ctr.name.as_str()])
                    .in_netns(netns),
                "add default route",
            )?;
        }
        Ok(())
    }

    fn configure_host_end(&self) -> CniResult<()> {
        let host = self.state.virtual_if.device.as_str();
        if let Some(mtu) = self.state.conf.mtu {
            self.run(
                ip(["link", "set", "dev", host, "mtu", mtu.to_string().as_str()]),
                "set host MTU",
            )?;
        }
        if let Some(bridge) = &self.state.conf.bridge {
            self.run(
                ip(["link", "set", "dev", host, "master", bridge.as_str()]),
                "attach host interface to bridge",
            )?;
        }
        self.run(ip(["link", "set", "dev", host, "up"]), "bring host interface up")
    }
}

impl NetIf for LinuxNetIf {
    fn platform(&self) -> Platform {
        Platform::Linux
    }

    fn state(&self) -> &NetIfState {
        &self.state
    }

    fn state_mut(&mut self) -> &mut NetIfState {
        &mut self.state
    }

    fn allocate(&mut self) -> CniResult<()> {
        self.state.lock_devices()?;
        let existing = self.host_links()?;

        let mut rng = rand::thread_rng();
        let device = (0..NAME_ATTEMPTS)
            .map(|_| format!("{}{:08x}", HOST_PREFIX, rng.gen::<u32>()))
            .find(|name| !existing.contains(name))
            .ok_or_else(|| CniError::DeviceUnavailable(HOST_PREFIX.to_string()))?;

        debug!("host interface for {}: {}", self.state.request.container_id, device);
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

        let netns = self.netns();
        let host = self.state.virtual_if.device.clone();
        let peer = self.peer_name();

        let created = self.run(
            ip(["link", "add", host.as_str(), "type", "veth", "peer", "name", peer.as_str()]),
            "create veth pair",
        );
        // the name is taken on the host now, or was never taken
        self.state.unlock_devices();
        created?;

        self.run(
            ip(["link", "set", "dev", peer.as_str(), "netns"]).arg(netns.display().to_string()),
            "move interface into container namespace",
        )?;
        self.configure_container_end(&netns, &peer)?;
        self.configure_host_end()?;

        info!(
            "attached {} ({}) to {} via {}",
            self.state.container_if.name,
            self.state
                .container_if
                .ip
                .map(|ip| ip.to_string())
                .unwrap_or_default(),
            netns.display(),
            host
        );
        Ok(())
    }

    fn delete(&mut self) -> CniResult<()> {
        let prev = self.state.previous_result()?;
        self.state.restore(&prev)?;

        let host = self.state.virtual_if.device.clone();
        let teardown = self.state.begin_teardown(&prev)?;
        if teardown.reassigned(&host) {
            return Ok(());
        }

        if !host.is_empty() {
            let links = self.host_links();
            if self.state.absent_on_dry_run("list host links", links)?.contains(&host) {
                // removing one end removes the pair
                self.run(ip(["link", "del", "dev", host.as_str()]), "delete veth pair")?;
            } else {
                debug!("host interface {} already gone", host);
            }
        } else {
            let netns = self.netns();
            let name = self.state.container_if.name.clone();
            let present = netns.exists()
                && self
                    .state
                    .effector
                    .capture(&ip(["-o", "link", "show"]).in_netns(&netns))
                    .map(|out| parse_link_names(&out).contains(&name))
                    .unwrap_or(false);
            if present {
                self.run(
                    ip(["link", "del", "dev", name.as_str()]).in_netns(&netns),
                    "delete container interface",
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

        let netns = self.netns();
        let name = self.state.container_if.name.clone();
        let out = self
            .state
            .effector
            .capture(&ip(["-o", "-4", "addr", "show", "dev", name.as_str()]).in_netns(&netns))
            .map_err(|e| CniError::wrap(format!("inspect {}", name), e))?;

        if let Some(cidr) = self.state.container_if.ip {
            let expected = format!("inet {}", cidr);
            if !out.contains(&expected) {
                return Err(CniError::CheckFailed(format!(
                    "interface {} does not carry {}",
                    name, cidr
                )));
            }
        }
        Ok(())
    }
}
