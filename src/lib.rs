//! CNI plugin attaching containers through virtual interface pairs
//!
//! This implementation provides a pure Rust CNI plugin that:
//! - Creates a veth pair (Linux) or epair (FreeBSD) per container
//! - Moves one end into the container's network namespace or vnet jail
//! - Hands out addresses from a single subnet, tracked in an on-disk ledger
//! - Attaches the host end to a bridge when one is configured
//! - Tears everything down again from the previous ADD result

pub mod commands;
pub mod config;
pub mod effector;
pub mod error;
pub mod ledger;
pub mod netif;
pub mod request;
pub mod result;
pub mod types;

// Re-export commonly used items
pub use commands::{cmd_add, cmd_check, cmd_del, dispatch_with, invoke, run_cni, Failure};
pub use config::NetConf;
pub use error::{CniError, CniResult};
pub use netif::{NetIf, Platform};
pub use request::{Command, RequestContext};
pub use result::AddResult;
