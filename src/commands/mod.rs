use std::io::{self, Read, Write};

use tracing::info;

use crate::config::{cni_version_hint, NetConf};
use crate::effector::{HostEffector, SystemEffector};
use crate::error::{CniError, CniResult, ErrorWrap};
use crate::netif::{self, Platform};
use crate::request::{Command, RequestContext};
use crate::result::AddResult;
use crate::types::{VersionResult, DEFAULT_CNI_VERSION};

/// Execute the add command and return the result document
pub fn cmd_add<E>(
    request: &RequestContext,
    conf: NetConf,
    platform: Platform,
    host: E,
) -> CniResult<String>
where
    E: SystemEffector + 'static,
{
    let mut netif = netif::for_platform_with(platform, conf.clone(), request.clone(), host);
    netif.create()?;
    AddResult::new(&conf, request, &*netif).json_output()
}

/// Execute the delete command
pub fn cmd_del<E>(request: &RequestContext, conf: NetConf, platform: Platform, host: E) -> CniResult<()>
where
    E: SystemEffector + 'static,
{
    let mut netif = netif::for_platform_with(platform, conf, request.clone(), host);
    netif.delete()
}

/// Execute the check command
pub fn cmd_check<E>(request: &RequestContext, conf: NetConf, platform: Platform, host: E) -> CniResult<()>
where
    E: SystemEffector + 'static,
{
    let mut netif = netif::for_platform_with(platform, conf, request.clone(), host);
    netif.check()
}

pub fn cmd_version() -> CniResult<String> {
    Ok(serde_json::to_string(&VersionResult::default())?)
}

/// Run one parsed request. Returns what belongs on stdout, if anything.
pub fn dispatch_with<E>(
    request: &RequestContext,
    stdin_data: &[u8],
    platform: Platform,
    host: E,
) -> CniResult<Option<String>>
where
    E: SystemEffector + 'static,
{
    if request.command == Command::Version {
        return cmd_version().map(Some);
    }

    let conf = NetConf::parse(stdin_data, request)?;
    info!(
        "{} container={} ifname={} platform={:?}",
        request.command, request.container_id, request.if_name, platform
    );

    match request.command {
        Command::Add => cmd_add(request, conf, platform, host).map(Some),
        Command::Del => cmd_del(request, conf, platform, host).map(|_| None),
        Command::Check => cmd_check(request, conf, platform, host).map(|_| None),
        Command::Version => unreachable!("handled above"),
    }
}

/// A failed invocation and the CNI version its error document is written in
#[derive(Debug)]
pub struct Failure {
    pub cni_version: String,
    pub error: CniError,
}

impl Failure {
    /// Failure raised before any configuration was read
    pub fn early(error: CniError) -> Self {
        Self {
            cni_version: DEFAULT_CNI_VERSION.to_string(),
            error,
        }
    }

    /// Write the error document to `out` and return the exit status
    pub fn report<W: Write>(&self, out: &mut W) -> i32 {
        self.error.report(&self.cni_version, out)
    }
}

/// Like [`dispatch_with`], but a failure carries the version the
/// configuration asked for.
pub fn invoke<E>(
    request: &RequestContext,
    stdin_data: &[u8],
    platform: Platform,
    host: E,
) -> Result<Option<String>, Failure>
where
    E: SystemEffector + 'static,
{
    dispatch_with(request, stdin_data, platform, host).map_err(|error| Failure {
        cni_version: cni_version_hint(stdin_data),
        error,
    })
}

/// Write a result document to `out`
pub fn emit<W: Write>(output: &str, out: &mut W) -> Result<(), Failure> {
    writeln!(out, "{}", output)
        .and_then(|_| out.flush())
        .wrap("failed to write result to stdout")
        .map_err(|error| Failure {
            cni_version: cni_version_hint(output.as_bytes()),
            error,
        })
}

/// Main entry point for the CNI plugin
pub fn run_cni() -> Result<Option<String>, Failure> {
    let request = RequestContext::from_env().map_err(Failure::early)?;

    // Read stdin data
    let mut stdin_data = Vec::new();
    if request.command != Command::Version {
        io::stdin()
            .read_to_end(&mut stdin_data)
            .wrap("failed to read from stdin")
            .map_err(Failure::early)?;
    }

    invoke(&request, &stdin_data, Platform::detect(), HostEffector)
}
