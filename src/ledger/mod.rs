//! On-disk address allocation ledger.
//!
//! File layout looks like this
//! $data_dir/
//!          - <network>-<prefix>.json -> issued and released addresses
//!          - <network>-<prefix>.lock -> held while the ledger is open
//!          - devices.lock            -> held while a device name is chosen
//!
//! Each plugin run is its own process, so the lock files are what keeps two
//! concurrent ADDs from handing out the same address or device.

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};

use fs2::FileExt;
use ipnetwork::Ipv4Network;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{CniError, CniResult, ErrorWrap};

const DEVICE_LOCK_FILE: &str = "devices.lock";

/// Who holds an issued address
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Lease {
    pub container_id: String,
    pub if_name: String,
    /// Host side device created for the holder
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device: Option<String>,
}

impl Lease {
    pub fn new<C: Into<String>, I: Into<String>>(container_id: C, if_name: I) -> Self {
        Self {
            container_id: container_id.into(),
            if_name: if_name.into(),
            device: None,
        }
    }

    pub fn with_device<D: Into<String>>(mut self, device: D) -> Self {
        let device = device.into();
        self.device = Some(device).filter(|d| !d.is_empty());
        self
    }

    /// Same container and interface, whatever device was recorded
    pub fn same_holder(&self, other: &Lease) -> bool {
        self.container_id == other.container_id && self.if_name == other.if_name
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LedgerState {
    subnet: String,
    #[serde(default)]
    last_issued: Option<Ipv4Addr>,
    #[serde(default)]
    issued: BTreeMap<String, Lease>,
    #[serde(default)]
    released: Vec<Ipv4Addr>,
}

/// Whether the ledger may be changed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LedgerMode {
    /// Locked, persisted on commit
    ReadWrite,
    /// Unlocked snapshot; commit is a no-op
    ReadOnly,
}

/// Open allocation ledger for one subnet. The lock is released on drop.
#[derive(Debug)]
pub struct Ledger {
    path: PathBuf,
    subnet: Ipv4Network,
    state: LedgerState,
    mode: LedgerMode,
    _lock: Option<File>,
}

/// File stem for a subnet's ledger
fn ledger_stem(subnet: &Ipv4Network) -> String {
    format!("{}-{}", subnet.network(), subnet.prefix())
}

fn lock_file(path: &Path) -> CniResult<File> {
    let file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(false)
        .open(path)
        .wrap(format!("open lock file {}", path.display()))?;
    file.lock_exclusive()
        .wrap(format!("lock {}", path.display()))?;
    Ok(file)
}

impl Ledger {
    /// Open the ledger of `subnet` under `data_dir`
    pub fn open(data_dir: &Path, subnet: Ipv4Network, mode: LedgerMode) -> CniResult<Self> {
        let stem = ledger_stem(&subnet);
        let path = data_dir.join(format!("{}.json", stem));

        let lock = match mode {
            LedgerMode::ReadWrite => {
                fs::create_dir_all(data_dir)
                    .wrap(format!("create ledger dir {}", data_dir.display()))?;
                Some(lock_file(&data_dir.join(format!("{}.lock", stem)))?)
            }
            LedgerMode::ReadOnly => None,
        };

        let state = match fs::read(&path) {
            Ok(bytes) => {
                let state: LedgerState =
                    serde_json::from_slice(&bytes).map_err(|e| CniError::LedgerCorrupt {
                        path: path.display().to_string(),
                        reason: e.to_string(),
                    })?;
                if state.subnet != subnet.to_string() {
                    return Err(CniError::LedgerCorrupt {
                        path: path.display().to_string(),
                        reason: format!("belongs to subnet {}", state.subnet),
                    });
                }
                state
            }
            Err(e) if e.kind() == ErrorKind::NotFound => LedgerState {
                subnet: subnet.to_string(),
                ..Default::default()
            },
            Err(e) => return Err(e).wrap(format!("read ledger {}", path.display())),
        };

        debug!("opened ledger {} ({} issued)", path.display(), state.issued.len());
        Ok(Self {
            path,
            subnet,
            state,
            mode,
            _lock: lock,
        })
    }

    pub fn subnet(&self) -> Ipv4Network {
        self.subnet
    }

    /// Issued addresses and their holders
    pub fn entries(&self) -> Vec<(Ipv4Addr, Lease)> {
        self.state
            .issued
            .iter()
            .filter_map(|(ip, lease)| ip.parse().ok().map(|ip| (ip, lease.clone())))
            .collect()
    }

    /// Addresses released since they were last issued
    pub fn released(&self) -> &[Ipv4Addr] {
        &self.state.released
    }

    pub fn is_issued(&self, ip: Ipv4Addr) -> bool {
        self.state.issued.contains_key(&ip.to_string())
    }

    /// Address currently held by `lease`'s container and interface, if any
    pub fn lookup(&self, lease: &Lease) -> Option<Ipv4Addr> {
        self.state
            .issued
            .iter()
            .find(|(_, held)| held.same_holder(lease))
            .and_then(|(ip, _)| ip.parse().ok())
    }

    /// Lease holding `ip`
    pub fn holder(&self, ip: Ipv4Addr) -> Option<&Lease> {
        self.state.issued.get(&ip.to_string())
    }

    /// Lease whose host device is `device`
    pub fn device_holder(&self, device: &str) -> Option<&Lease> {
        self.state
            .issued
            .values()
            .find(|lease| lease.device.as_deref() == Some(device))
    }

    /// Issue an address to `lease`.
    ///
    /// A lease that already holds an address gets it back. Otherwise
    /// `requested` is honoured when free, or the next free host address after
    /// the last issued one is chosen. Network, broadcast and `reserved`
    /// addresses are never issued.
    pub fn allocate(
        &mut self,
        lease: Lease,
        requested: Option<Ipv4Addr>,
        reserved: &[Ipv4Addr],
    ) -> CniResult<Ipv4Addr> {
        if let Some(ip) = self.lookup(&lease) {
            debug!("{} already holds {}", lease.container_id, ip);
            if lease.device.is_some() {
                self.state.issued.insert(ip.to_string(), lease);
            }
            return Ok(ip);
        }

        let first = u32::from(self.subnet.network()).saturating_add(1);
        let last = u32::from(self.subnet.broadcast()).saturating_sub(1);
        let usable = |ip: u32| {
            let addr = Ipv4Addr::from(ip);
            ip >= first && ip <= last && !reserved.contains(&addr) && !self.is_issued(addr)
        };

        let chosen = match requested {
            Some(ip) if usable(u32::from(ip)) => ip,
            Some(ip) => return Err(CniError::AddressUnavailable(ip.to_string())),
            None => {
                if first > last {
                    return Err(CniError::PoolExhausted(self.subnet.to_string()));
                }
                let start = self
                    .state
                    .last_issued
                    .map(u32::from)
                    .filter(|ip| *ip >= first && *ip < last)
                    .map(|ip| ip + 1)
                    .unwrap_or(first);
                (start..=last)
                    .chain(first..start)
                    .find(|ip| usable(*ip))
                    .map(Ipv4Addr::from)
                    .ok_or_else(|| CniError::PoolExhausted(self.subnet.to_string()))?
            }
        };

        self.state.released.retain(|ip| *ip != chosen);
        self.state.issued.insert(chosen.to_string(), lease);
        self.state.last_issued = Some(chosen);
        Ok(chosen)
    }

    /// Release `ip` if `lease`'s container and interface still hold it.
    /// Returns false when the address was not issued or belongs to someone
    /// else.
    pub fn release(&mut self, ip: Ipv4Addr, lease: &Lease) -> bool {
        match self.holder(ip) {
            Some(held) if held.same_holder(lease) => self.force_release(ip),
            Some(held) => {
                debug!(
                    "{} is held by {}/{}, not releasing for {}",
                    ip, held.container_id, held.if_name, lease.container_id
                );
                false
            }
            None => {
                debug!("{} was not issued in {}", ip, self.subnet);
                false
            }
        }
    }

    /// Release `ip` whoever holds it; returns false when it was not issued
    pub fn force_release(&mut self, ip: Ipv4Addr) -> bool {
        if self.state.issued.remove(&ip.to_string()).is_none() {
            return false;
        }
        if !self.state.released.contains(&ip) {
            self.state.released.push(ip);
        }
        true
    }

    /// Persist the ledger. Read-only ledgers are left untouched.
    pub fn commit(&self) -> CniResult<()> {
        if self.mode == LedgerMode::ReadOnly {
            debug!("read-only ledger {}, not persisting", self.path.display());
            return Ok(());
        }
        let tmp = self.path.with_extension("json.tmp");
        let data = serde_json::to_vec_pretty(&self.state)?;
        let mut file = File::create(&tmp).wrap(format!("create {}", tmp.display()))?;
        file.write_all(&data)
            .and_then(|_| file.sync_all())
            .wrap(format!("write {}", tmp.display()))?;
        fs::rename(&tmp, &self.path).wrap(format!("replace {}", self.path.display()))?;
        info!("ledger {} updated", self.path.display());
        Ok(())
    }
}

/// Exclusive hold on device name selection, released on drop
#[derive(Debug)]
pub struct DeviceLock {
    _file: File,
}

impl DeviceLock {
    pub fn acquire(data_dir: &Path) -> CniResult<Self> {
        fs::create_dir_all(data_dir).wrap(format!("create ledger dir {}", data_dir.display()))?;
        let file = lock_file(&data_dir.join(DEVICE_LOCK_FILE))?;
        Ok(Self { _file: file })
    }
}
