//! Network interface engine.
//!
//! One [`NetIf`] implementation per host platform. Both give the container an
//! interface pair: one end stays on the host (optionally on a bridge), the
//! other moves into the container's namespace with a generated MAC and an
//! address drawn from the configured subnet.

use std::net::Ipv4Addr;
use std::str::FromStr;

use ipnetwork::Ipv4Network;
use rand::Rng;
use tracing::{debug, info, warn};

use crate::config::NetConf;
use crate::effector::{DryRunEffector, HostEffector, SystemEffector};
use crate::error::{CniError, CniResult};
use crate::ledger::{DeviceLock, Lease, Ledger, LedgerMode};
use crate::request::RequestContext;
use crate::types::SuccessResult;

pub mod freebsd;
pub mod linux;

pub use freebsd::FreeBsdNetIf;
pub use linux::LinuxNetIf;

/// Host platform variant
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Platform {
    /// epair interfaces moved into vnet jails
    FreeBsd,
    /// veth pairs moved into network namespaces
    Linux,
}

impl Platform {
    pub fn detect() -> Self {
        if cfg!(target_os = "freebsd") {
            Platform::FreeBsd
        } else {
            Platform::Linux
        }
    }
}

/// Host side end of the pair
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VirtualInterface {
    /// Host visible device name
    pub device: String,
    pub mac: Option<String>,
}

/// Container side end of the pair
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContainerInterface {
    /// Name inside the container
    pub name: String,
    pub mac: String,
    /// Assigned address with the subnet prefix
    pub ip: Option<Ipv4Network>,
}

/// State shared by every platform variant
pub struct NetIfState {
    pub conf: NetConf,
    pub request: RequestContext,
    pub effector: Box<dyn SystemEffector>,
    pub virtual_if: VirtualInterface,
    pub container_if: ContainerInterface,
    /// Held from allocate() until the pair exists on the host
    device_lock: Option<DeviceLock>,
}

impl NetIfState {
    pub fn new(conf: NetConf, request: RequestContext, effector: Box<dyn SystemEffector>) -> Self {
        let container_if = ContainerInterface {
            name: request.if_name.clone(),
            ..Default::default()
        };
        Self {
            conf,
            request,
            effector,
            virtual_if: VirtualInterface::default(),
            container_if,
            device_lock: None,
        }
    }

    pub fn dry_run(&self) -> bool {
        self.request.dry_run
    }

    fn ledger_mode(&self) -> LedgerMode {
        if self.dry_run() {
            LedgerMode::ReadOnly
        } else {
            LedgerMode::ReadWrite
        }
    }

    /// Serialise device name selection with concurrent invocations
    pub fn lock_devices(&mut self) -> CniResult<()> {
        if self.device_lock.is_none() && !self.dry_run() {
            self.device_lock = Some(DeviceLock::acquire(&self.conf.data_dir)?);
        }
        Ok(())
    }

    pub fn unlock_devices(&mut self) {
        self.device_lock = None;
    }

    fn lease(&self) -> Lease {
        Lease::new(&self.request.container_id, &self.request.if_name)
            .with_device(&self.virtual_if.device)
    }

    /// In a dry run a failed query reads as "nothing there"
    pub fn absent_on_dry_run<T: Default>(&self, what: &str, res: CniResult<T>) -> CniResult<T> {
        match res {
            Err(e) if self.dry_run() => {
                warn!("dry run: {} failed, treating as absent: {}", what, e);
                Ok(T::default())
            }
            res => res,
        }
    }

    /// Address requested through CNI_ARGS, if any
    fn requested_ip(&self) -> CniResult<Option<Ipv4Addr>> {
        self.request
            .args
            .get("IP")
            .map(|ip| {
                let ip = ip.split('/').next().unwrap_or(ip);
                Ipv4Addr::from_str(ip).map_err(|_| CniError::InvalidEnv {
                    name: crate::request::ENV_ARGS,
                    value: format!("IP={}", ip),
                })
            })
            .transpose()
    }

    /// Draw the container address from the ledger and persist it
    pub fn assign_ip(&mut self) -> CniResult<()> {
        let subnet = self.conf.network()?;
        let requested = self.requested_ip()?;
        let reserved: Vec<Ipv4Addr> = self.conf.gateway.into_iter().collect();

        let mut ledger = Ledger::open(&self.conf.data_dir, subnet, self.ledger_mode())?;
        let ip = ledger.allocate(self.lease(), requested, &reserved)?;
        ledger.commit()?;
        drop(ledger);

        let cidr = Ipv4Network::new(ip, subnet.prefix())
            .map_err(|e| CniError::config(format!("invalid prefix for {}: {}", ip, e)))?;
        info!("assigned {} to container {}", cidr, self.request.container_id);
        self.container_if.ip = Some(cidr);
        Ok(())
    }

    /// Address `prev` assigned to the container end
    fn previous_address(&self, prev: &SuccessResult) -> CniResult<Option<Ipv4Network>> {
        let index = prev.container_interface().map(|(i, _)| i);
        let Some(ipconf) = prev.address_for(index) else {
            return Ok(None);
        };
        Ipv4Network::from_str(&ipconf.address)
            .map(Some)
            .map_err(|e| {
                CniError::config(format!(
                    "invalid address {:?} in prevResult: {}",
                    ipconf.address, e
                ))
            })
    }

    fn open_teardown_ledger(&self, cidr: Option<Ipv4Network>) -> CniResult<Option<Ledger>> {
        let subnet = match (self.conf.network, cidr) {
            (Some(net), Some(cidr)) if !net.contains(cidr.ip()) => {
                crate::config::parse_subnet(&cidr.to_string())?
            }
            (Some(net), _) => net,
            (None, Some(cidr)) => crate::config::parse_subnet(&cidr.to_string())?,
            (None, None) => return Ok(None),
        };
        Ledger::open(&self.conf.data_dir, subnet, self.ledger_mode()).map(Some)
    }

    /// Open the ledger for tearing down what `prev` describes. Call after
    /// [`NetIfState::restore`] so the recorded device is known. The ledger
    /// stays locked until the teardown is released or dropped.
    pub fn begin_teardown(&self, prev: &SuccessResult) -> CniResult<Teardown> {
        let cidr = self.previous_address(prev)?;
        if cidr.is_none() {
            debug!("previous result carries no address, nothing to release");
        }
        let ledger = self.open_teardown_ledger(cidr);
        let ledger = match ledger {
            Err(e) if self.dry_run() => {
                warn!("dry run: ignoring unusable ledger: {}", e);
                None
            }
            ledger => ledger?,
        };
        Ok(Teardown {
            ledger,
            ip: cidr.map(|c| c.ip()),
            lease: self.lease(),
        })
    }

    /// Fill the interface data from the previous ADD result
    pub fn restore(&mut self, prev: &SuccessResult) -> CniResult<()> {
        if let Some(host) = prev.host_interface() {
            self.virtual_if = VirtualInterface {
                device: host.name.clone(),
                mac: host.mac.clone(),
            };
        }
        let index = match prev.container_interface() {
            Some((index, ctr)) => {
                self.container_if.name = ctr.name.clone();
                self.container_if.mac = ctr.mac.clone().unwrap_or_default();
                Some(index)
            }
            None => None,
        };
        if let Some(ipconf) = prev.address_for(index) {
            self.container_if.ip = Ipv4Network::from_str(&ipconf.address).ok();
        }
        Ok(())
    }

    pub fn previous_result(&self) -> CniResult<SuccessResult> {
        self.conf
            .previous_result()?
            .ok_or_else(|| CniError::config("prevResult is missing"))
    }
}

/// Ledger view of a DEL in progress
pub struct Teardown {
    ledger: Option<Ledger>,
    ip: Option<Ipv4Addr>,
    lease: Lease,
}

impl Teardown {
    /// Whether the address or `device` now belongs to another container,
    /// i.e. this DEL is a late retry and must leave the host alone
    pub fn reassigned(&self, device: &str) -> bool {
        let Some(ledger) = &self.ledger else {
            return false;
        };
        let other = |held: &Lease| !held.same_holder(&self.lease);
        let ip_taken = self
            .ip
            .and_then(|ip| ledger.holder(ip))
            .is_some_and(other);
        let device_taken = !device.is_empty() && ledger.device_holder(device).is_some_and(other);
        if ip_taken || device_taken {
            info!(
                "resources of {} were reissued, skipping teardown",
                self.lease.container_id
            );
        }
        ip_taken || device_taken
    }

    /// Return the address to the ledger if this container still holds it
    pub fn release(self) -> CniResult<()> {
        let (Some(mut ledger), Some(ip)) = (self.ledger, self.ip) else {
            return Ok(());
        };
        if ledger.release(ip, &self.lease) {
            ledger.commit()?;
            info!("released {} from {}", ip, ledger.subnet());
        }
        Ok(())
    }
}

/// Platform specific interface management
pub trait NetIf {
    fn platform(&self) -> Platform;

    fn state(&self) -> &NetIfState;

    fn state_mut(&mut self) -> &mut NetIfState;

    /// Choose the host side device name without touching the host
    fn allocate(&mut self) -> CniResult<()>;

    /// Create the pair and configure the container end
    fn create(&mut self) -> CniResult<()>;

    /// Tear down what `prevResult` describes; absent devices are not an error
    fn delete(&mut self) -> CniResult<()>;

    /// Verify the container end still matches `prevResult`
    fn check(&mut self) -> CniResult<()>;

    /// Draw the next free address from the subnet for the container end
    fn new_ip(&mut self) -> CniResult<()> {
        self.state_mut().assign_ip()
    }

    /// Name of the host end as it shows up on the host
    fn host_if_name(&self) -> String {
        self.state().virtual_if.device.clone()
    }

    fn virtual_if(&self) -> &VirtualInterface {
        &self.state().virtual_if
    }

    fn container_if(&self) -> &ContainerInterface {
        &self.state().container_if
    }
}

/// Build the engine for `platform`, running commands through `host`. When
/// the request is a dry run every mutating command is swallowed.
pub fn for_platform_with<E>(
    platform: Platform,
    conf: NetConf,
    request: RequestContext,
    host: E,
) -> Box<dyn NetIf>
where
    E: SystemEffector + 'static,
{
    let effector: Box<dyn SystemEffector> = if request.dry_run {
        Box::new(DryRunEffector::new(host))
    } else {
        Box::new(host)
    };
    match platform {
        Platform::FreeBsd => Box::new(FreeBsdNetIf::new(conf, request, effector)),
        Platform::Linux => Box::new(LinuxNetIf::new(conf, request, effector)),
    }
}

/// Build the engine for `platform` against the real host
pub fn for_platform(platform: Platform, conf: NetConf, request: RequestContext) -> Box<dyn NetIf> {
    for_platform_with(platform, conf, request, HostEffector)
}

/// Generate a random, locally administered, unicast MAC address
pub fn gen_mac_addr() -> String {
    let mut rng = rand::thread_rng();
    let mut octets: [u8; 6] = rng.gen();
    octets[0] = (octets[0] & 0xfc) | 0x02;
    octets
        .iter()
        .map(|o| format!("{:02x}", o))
        .collect::<Vec<_>>()
        .join(":")
}

/// Prefix length of a contiguous 32 bit netmask
pub fn mask_prefix(mask: u32) -> CniResult<u8> {
    let prefix = mask.leading_ones();
    // everything after the leading ones must be zero
    if mask.checked_shl(prefix).unwrap_or(0) != 0 {
        return Err(CniError::config(format!(
            "netmask {} is not contiguous",
            Ipv4Addr::from(mask)
        )));
    }
    Ok(prefix as u8)
}

/// Convert a dotted-quad netmask such as 255.255.254.0 to its prefix length
pub fn fix_netmask(netmask: &str) -> CniResult<u8> {
    let mask = Ipv4Addr::from_str(netmask.trim())
        .map_err(|_| CniError::config(format!("invalid netmask {:?}", netmask)))?;
    mask_prefix(u32::from(mask))
}
