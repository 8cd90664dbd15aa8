#![allow(dead_code)]

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use netif_cni::error::CniResult;
use netif_cni::request::RequestContext;

/// Environment of a well-formed invocation of `command`
pub fn env(command: &str) -> HashMap<String, String> {
    [
        ("CNI_COMMAND", command),
        ("CNI_CONTAINERID", "blah"),
        ("CNI_NETNS", "superblah"),
        ("CNI_IFNAME", "eth0"),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect()
}

pub fn request_from(vars: &HashMap<String, String>) -> CniResult<RequestContext> {
    RequestContext::from_lookup(|key| vars.get(key).cloned())
}

pub fn request(command: &str) -> RequestContext {
    request_from(&env(command)).expect("valid request")
}

pub fn noop_request(command: &str) -> RequestContext {
    let mut vars = env(command);
    vars.insert("NOOP".to_string(), "True".to_string());
    request_from(&vars).expect("valid request")
}

pub fn fixture_path(name: &str) -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("tests")
        .join("fixtures")
        .join(name)
}

pub fn fixture(name: &str) -> String {
    std::fs::read_to_string(fixture_path(name)).expect("fixture exists")
}

/// Fixture with its ledger pointed at `data_dir`
pub fn fixture_in(name: &str, data_dir: &Path) -> Vec<u8> {
    let mut value: serde_json::Value = serde_json::from_str(&fixture(name)).expect("valid json");
    value["dataDir"] = serde_json::Value::String(data_dir.display().to_string());
    serde_json::to_vec(&value).expect("serialisable")
}
