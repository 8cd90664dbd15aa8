//! Request context built from the CNI environment variables.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use tracing::debug;

use crate::error::{CniError, CniResult};

pub const ENV_COMMAND: &str = "CNI_COMMAND";
pub const ENV_CONTAINER_ID: &str = "CNI_CONTAINERID";
pub const ENV_NETNS: &str = "CNI_NETNS";
pub const ENV_IFNAME: &str = "CNI_IFNAME";
pub const ENV_ARGS: &str = "CNI_ARGS";
/// Non-standard switch that turns every host mutation into a no-op
pub const ENV_NOOP: &str = "NOOP";

/// CNI command requested by the runtime
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Add,
    Del,
    Check,
    Version,
}

impl Command {
    fn requires_container(self) -> bool {
        !matches!(self, Command::Version)
    }

    fn requires_ifname(self) -> bool {
        matches!(self, Command::Add | Command::Del)
    }
}

impl FromStr for Command {
    type Err = CniError;

    fn from_str(s: &str) -> CniResult<Self> {
        match s {
            "ADD" => Ok(Command::Add),
            "DEL" => Ok(Command::Del),
            "CHECK" => Ok(Command::Check),
            "VERSION" => Ok(Command::Version),
            other => Err(CniError::InvalidEnv {
                name: ENV_COMMAND,
                value: other.to_string(),
            }),
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Command::Add => "ADD",
            Command::Del => "DEL",
            Command::Check => "CHECK",
            Command::Version => "VERSION",
        };
        f.write_str(s)
    }
}

/// Immutable description of one plugin invocation
#[derive(Debug, Clone)]
pub struct RequestContext {
    /// Requested command
    pub command: Command,
    /// Container ID
    pub container_id: String,
    /// Network namespace reference (a path on Linux, a jail on FreeBSD)
    pub netns: String,
    /// Interface name inside the container
    pub if_name: String,
    /// Extra `K=V` arguments from CNI_ARGS
    pub args: HashMap<String, String>,
    /// Compute everything but leave the host untouched
    pub dry_run: bool,
}

impl RequestContext {
    /// Read the request from the process environment
    pub fn from_env() -> CniResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read the request through `lookup`, which maps a variable name to its
    /// value.
    pub fn from_lookup<F>(lookup: F) -> CniResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let present = |key: &str| lookup(key).filter(|v| !v.is_empty());

        let command: Command = present(ENV_COMMAND)
            .ok_or(CniError::MissingEnv(ENV_COMMAND))?
            .parse()?;

        let required = |key: &'static str, needed: bool| -> CniResult<String> {
            match present(key) {
                Some(value) => Ok(value),
                None if needed => Err(CniError::MissingEnv(key)),
                None => Ok(String::new()),
            }
        };

        let container_id = required(ENV_CONTAINER_ID, command.requires_container())?;
        let netns = required(ENV_NETNS, command.requires_container())?;
        let if_name = required(ENV_IFNAME, command.requires_ifname())?;

        let args = parse_cni_args(&present(ENV_ARGS).unwrap_or_default());
        let dry_run = matches!(present(ENV_NOOP).as_deref(), Some("True") | Some("true"));

        debug!(
            "CNI request: command={} container={} netns={} ifname={} dry_run={}",
            command, container_id, netns, if_name, dry_run
        );

        Ok(Self {
            command,
            container_id,
            netns,
            if_name,
            args,
            dry_run,
        })
    }
}

/// Parse CNI_ARGS string into key-value pairs
fn parse_cni_args(args_str: &str) -> HashMap<String, String> {
    args_str
        .split(';')
        .filter_map(|pair| pair.split_once('='))
        .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
        .filter(|(k, _)| !k.is_empty())
        .collect()
}
