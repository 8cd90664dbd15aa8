mod common;

use std::collections::HashSet;
use std::net::Ipv4Addr;
use std::path::Path;
use std::str::FromStr;
use std::thread;

use ipnetwork::Ipv4Network;

use common::{env, fixture_in, noop_request, request, request_from};
use netif_cni::config::NetConf;
use netif_cni::effector::RecordingEffector;
use netif_cni::error::{code, CniError};
use netif_cni::ledger::{Lease, Ledger, LedgerMode};
use netif_cni::netif::{self, fix_netmask, gen_mac_addr, NetIf, Platform};
use netif_cni::request::RequestContext;

fn engine(
    platform: Platform,
    request: RequestContext,
    fixture: &str,
    data_dir: &Path,
    recorder: &RecordingEffector,
) -> Box<dyn NetIf> {
    let conf = NetConf::parse(&fixture_in(fixture, data_dir), &request).expect("valid config");
    netif::for_platform_with(platform, conf, request, recorder.clone())
}

fn add_fixture(platform: Platform) -> &'static str {
    match platform {
        Platform::FreeBsd => "add_input_freebsd.json",
        Platform::Linux => "add_input_linux.json",
    }
}

fn is_mac(s: &str) -> bool {
    let groups: Vec<&str> = s.split(':').collect();
    groups.len() == 6
        && groups
            .iter()
            .all(|g| g.len() == 2 && g.chars().all(|c| c.is_ascii_hexdigit()))
}

fn is_cidr(s: &str) -> bool {
    let Some((addr, prefix)) = s.split_once('/') else {
        return false;
    };
    let octets: Vec<&str> = addr.split('.').collect();
    octets.len() == 4
        && octets
            .iter()
            .all(|o| (1..=3).contains(&o.len()) && o.chars().all(|c| c.is_ascii_digit()))
        && (1..=2).contains(&prefix.len())
        && prefix.chars().all(|c| c.is_ascii_digit())
}

fn is_device_name(s: &str) -> bool {
    let digits = s.trim_start_matches(|c: char| c.is_ascii_lowercase());
    digits.len() < s.len() && !digits.is_empty() && digits.chars().all(|c| c.is_ascii_digit())
}

#[test]
fn test_gen_mac_addr() {
    for _ in 0..32 {
        let mac = gen_mac_addr();
        assert!(is_mac(&mac), "{}", mac);
        let first = u8::from_str_radix(&mac[..2], 16).unwrap();
        assert_eq!(first & 0b11, 0b10, "{}", mac);
    }
}

#[test]
fn test_fix_netmask() {
    assert_eq!(fix_netmask("255.255.254.0").unwrap(), 23);
    assert_eq!(fix_netmask("255.255.255.0").unwrap(), 24);
    assert_eq!(fix_netmask("0.0.0.0").unwrap(), 0);
    assert!(fix_netmask("255.255.0.255").is_err());
}

#[test]
fn test_freebsd_allocate() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempfile::tempdir()?;
    let recorder = RecordingEffector::new().respond("ifconfig -l", "lo0 em0 epair0a epair0b bridge0\n");
    let mut netif = engine(Platform::FreeBsd, request("ADD"), "add_input_freebsd.json", dir.path(), &recorder);

    netif.allocate()?;

    assert!(is_device_name(&netif.virtual_if().device));
    assert_eq!(netif.virtual_if().device, "epair1");
    assert_eq!(netif.host_if_name(), "epair1a");
    assert!(is_mac(&netif.container_if().mac));
    assert!(recorder.executed().is_empty());
    Ok(())
}

#[test]
fn test_linux_allocate() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempfile::tempdir()?;
    let recorder = RecordingEffector::new().respond("ip -o link show", "1: lo: <LOOPBACK,UP>\n2: eth0: <UP>\n");
    let mut netif = engine(Platform::Linux, request("ADD"), "add_input_linux.json", dir.path(), &recorder);

    netif.allocate()?;

    let device = &netif.virtual_if().device;
    assert!(device.starts_with("veth"));
    assert!(device.len() <= 15);
    assert!(device.chars().all(|c| c.is_ascii_alphanumeric()));
    assert_eq!(netif.container_if().name, "eth0");
    assert!(recorder.executed().is_empty());
    Ok(())
}

#[test]
fn test_new_ip() -> Result<(), Box<dyn std::error::Error>> {
    let subnet = Ipv4Network::from_str("172.16.0.0/24")?;
    for platform in [Platform::FreeBsd, Platform::Linux] {
        let dir = tempfile::tempdir()?;
        let recorder = RecordingEffector::new();
        let mut netif = engine(platform, request("ADD"), add_fixture(platform), dir.path(), &recorder);

        netif.new_ip()?;

        let ip = netif.container_if().ip.expect("address assigned");
        assert!(is_cidr(&ip.to_string()), "{}", ip);
        assert_eq!(ip.prefix(), 24);
        assert!(subnet.contains(ip.ip()));
        assert_ne!(ip.ip(), subnet.network());
        assert_ne!(ip.ip(), subnet.broadcast());
    }
    Ok(())
}

#[test]
fn test_new_ip_skips_gateway_and_persists() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempfile::tempdir()?;
    let recorder = RecordingEffector::new();

    let mut first = engine(Platform::Linux, request("ADD"), "add_input_linux.json", dir.path(), &recorder);
    first.new_ip()?;
    assert_eq!(first.container_if().ip.map(|ip| ip.to_string()).as_deref(), Some("172.16.0.2/24"));

    let mut vars = env("ADD");
    vars.insert("CNI_CONTAINERID".to_string(), "other".to_string());
    let mut second = engine(Platform::Linux, request_from(&vars)?, "add_input_linux.json", dir.path(), &recorder);
    second.new_ip()?;
    assert_eq!(second.container_if().ip.map(|ip| ip.to_string()).as_deref(), Some("172.16.0.3/24"));

    // the same container asking again keeps its address
    let mut again = engine(Platform::Linux, request("ADD"), "add_input_linux.json", dir.path(), &recorder);
    again.new_ip()?;
    assert_eq!(again.container_if().ip, first.container_if().ip);
    Ok(())
}

#[test]
fn test_requested_ip_from_cni_args() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempfile::tempdir()?;
    let mut vars = env("ADD");
    vars.insert("CNI_ARGS".to_string(), "IP=172.16.0.77".to_string());
    let recorder = RecordingEffector::new();
    let mut netif = engine(Platform::FreeBsd, request_from(&vars)?, "add_input_freebsd.json", dir.path(), &recorder);

    netif.new_ip()?;
    assert_eq!(netif.container_if().ip.map(|ip| ip.to_string()).as_deref(), Some("172.16.0.77/24"));
    Ok(())
}

#[test]
fn test_linux_create() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempfile::tempdir()?;
    let recorder = RecordingEffector::new();
    let mut netif = engine(Platform::Linux, request("ADD"), "add_input_linux.json", dir.path(), &recorder);

    netif.create()?;

    let host = netif.virtual_if().device.clone();
    let ctr = netif.container_if().clone();
    let ip = ctr.ip.expect("address assigned").to_string();
    assert!(is_cidr(&ip));

    let lines = recorder.executed_lines();
    let expected = vec![
        format!("ip link add {} type veth peer name {}p", host, host),
        format!("ip link set dev {}p netns superblah", host),
        format!("[netns superblah] ip link set dev {}p name eth0", host),
        format!("[netns superblah] ip link set dev eth0 address {}", ctr.mac),
        format!("[netns superblah] ip addr add {} dev eth0", ip),
        "[netns superblah] ip link set dev eth0 up".to_string(),
        "[netns superblah] ip route add default via 172.16.0.1 dev eth0".to_string(),
        format!("ip link set dev {} master cni0", host),
        format!("ip link set dev {} up", host),
    ];
    assert_eq!(lines, expected);
    Ok(())
}

#[test]
fn test_freebsd_create() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempfile::tempdir()?;
    let recorder = RecordingEffector::new().respond("ifconfig -l", "lo0 em0 bridge0");
    let mut netif = engine(Platform::FreeBsd, request("ADD"), "add_input_freebsd.json", dir.path(), &recorder);

    netif.create()?;

    let ctr = netif.container_if().clone();
    let ip = ctr.ip.expect("address assigned").to_string();
    assert_eq!(ip, "172.16.0.1/24");

    let lines = recorder.executed_lines();
    let expected = vec![
        "ifconfig epair0 create".to_string(),
        "ifconfig epair0b vnet superblah".to_string(),
        "jexec superblah ifconfig epair0b name eth0".to_string(),
        format!("jexec superblah ifconfig eth0 ether {}", ctr.mac),
        format!("jexec superblah ifconfig eth0 inet {}", ip),
        "jexec superblah ifconfig eth0 up".to_string(),
        "ifconfig bridge0 addm epair0a".to_string(),
        "ifconfig epair0a up".to_string(),
    ];
    assert_eq!(lines, expected);
    Ok(())
}

#[test]
fn test_create_noop() -> Result<(), Box<dyn std::error::Error>> {
    for platform in [Platform::FreeBsd, Platform::Linux] {
        let dir = tempfile::tempdir()?;
        let data_dir = dir.path().join("ledger");
        let recorder = RecordingEffector::new();
        let mut netif = engine(platform, noop_request("ADD"), add_fixture(platform), &data_dir, &recorder);

        netif.create()?;

        assert!(recorder.executed().is_empty(), "{:?}", recorder.executed_lines());
        let ip = netif.container_if().ip.expect("address assigned").to_string();
        assert!(is_cidr(&ip));
        assert!(!netif.virtual_if().device.is_empty());
        assert!(is_mac(&netif.container_if().mac));
        // dry runs leave the ledger alone too
        assert!(!data_dir.exists());
    }
    Ok(())
}

#[test]
fn test_create_failure_propagates() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempfile::tempdir()?;
    let recorder = RecordingEffector::new().fail("ip link set dev");
    let mut netif = engine(Platform::Linux, request("ADD"), "add_input_linux.json", dir.path(), &recorder);

    let err = netif.create().unwrap_err();

    assert_eq!(err.code(), code::HOST_COMMAND_FAILED);
    assert!(err.to_string().starts_with("move interface into container namespace"));
    // the pair was created before the failure and nothing ran after it
    assert_eq!(recorder.executed().len(), 2);
    Ok(())
}

#[test]
fn test_del_noop() -> Result<(), Box<dyn std::error::Error>> {
    for platform in [Platform::FreeBsd, Platform::Linux] {
        let dir = tempfile::tempdir()?;
        let recorder = RecordingEffector::new()
            .respond("ifconfig -l", "lo0 epair0a")
            .respond("ip -o link show", "7: epair0a@if6: <UP>");
        let mut netif = engine(platform, noop_request("DEL"), "del_input.json", dir.path(), &recorder);

        netif.delete()?;

        assert!(recorder.executed().is_empty(), "{:?}", recorder.executed_lines());
    }
    Ok(())
}

#[test]
fn test_del_noop_survives_failed_queries_and_bad_ledger() -> Result<(), Box<dyn std::error::Error>> {
    for platform in [Platform::FreeBsd, Platform::Linux] {
        let dir = tempfile::tempdir()?;
        std::fs::write(dir.path().join("172.16.0.0-24.json"), b"{garbage")?;
        let recorder = RecordingEffector::new()
            .fail("ifconfig -l")
            .fail("ip -o link show");
        let mut netif = engine(platform, noop_request("DEL"), "del_input.json", dir.path(), &recorder);

        netif.delete()?;

        assert!(recorder.executed().is_empty());
        assert_eq!(std::fs::read(dir.path().join("172.16.0.0-24.json"))?, b"{garbage");
    }
    Ok(())
}

#[test]
fn test_del_reports_failed_queries() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempfile::tempdir()?;
    let recorder = RecordingEffector::new().fail("ip -o link show");
    let mut netif = engine(Platform::Linux, request("DEL"), "del_input.json", dir.path(), &recorder);

    let err = netif.delete().unwrap_err();
    assert_eq!(err.code(), code::HOST_COMMAND_FAILED);
    Ok(())
}

#[test]
fn test_stale_delete_leaves_reissued_resources() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempfile::tempdir()?;
    let subnet = Ipv4Network::from_str("172.16.0.0/24")?;
    let ip = Ipv4Addr::new(172, 16, 0, 2);
    {
        // blah's address and epair went to another container after its DEL
        let mut ledger = Ledger::open(dir.path(), subnet, LedgerMode::ReadWrite)?;
        ledger.allocate(Lease::new("other", "eth0").with_device("epair0"), Some(ip), &[])?;
        ledger.commit()?;
    }

    let recorder = RecordingEffector::new().respond("ifconfig -l", "lo0 em0 epair0a bridge0");
    let mut netif = engine(Platform::FreeBsd, request("DEL"), "del_input.json", dir.path(), &recorder);
    netif.delete()?;

    assert!(recorder.executed().is_empty(), "{:?}", recorder.executed_lines());
    let ledger = Ledger::open(dir.path(), subnet, LedgerMode::ReadOnly)?;
    assert_eq!(ledger.holder(ip).map(|l| l.container_id.as_str()), Some("other"));
    Ok(())
}

#[test]
fn test_freebsd_delete_releases_address() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempfile::tempdir()?;
    let subnet = Ipv4Network::from_str("172.16.0.0/24")?;
    let ip = Ipv4Addr::new(172, 16, 0, 2);
    {
        let mut ledger = Ledger::open(dir.path(), subnet, LedgerMode::ReadWrite)?;
        ledger.allocate(Lease::new("blah", "eth0").with_device("epair0"), Some(ip), &[])?;
        ledger.commit()?;
    }

    let recorder = RecordingEffector::new().respond("ifconfig -l", "lo0 em0 epair0a bridge0");
    let mut netif = engine(Platform::FreeBsd, request("DEL"), "del_input.json", dir.path(), &recorder);
    netif.delete()?;

    assert_eq!(recorder.executed_lines(), vec!["ifconfig epair0a destroy"]);
    let ledger = Ledger::open(dir.path(), subnet, LedgerMode::ReadOnly)?;
    assert!(!ledger.is_issued(ip));
    assert_eq!(ledger.released(), &[ip]);
    Ok(())
}

#[test]
fn test_delete_already_gone() -> Result<(), Box<dyn std::error::Error>> {
    for platform in [Platform::FreeBsd, Platform::Linux] {
        let dir = tempfile::tempdir()?;
        let recorder = RecordingEffector::new();
        let mut netif = engine(platform, request("DEL"), "del_input.json", dir.path(), &recorder);

        // twice: the second DEL finds nothing left to remove
        netif.delete()?;
        netif.delete()?;

        assert!(recorder.executed().is_empty());
    }
    Ok(())
}

#[test]
fn test_linux_check() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempfile::tempdir()?;
    let recorder = RecordingEffector::new().respond(
        "[netns superblah] ip -o -4 addr show dev eth0",
        "2: eth0    inet 172.16.0.2/24 scope global eth0\\       valid_lft forever",
    );
    let mut netif = engine(Platform::Linux, request("CHECK"), "del_input.json", dir.path(), &recorder);
    netif.check()?;

    let recorder = RecordingEffector::new().respond(
        "[netns superblah] ip -o -4 addr show dev eth0",
        "2: eth0    inet 172.16.0.9/24 scope global eth0",
    );
    let mut netif = engine(Platform::Linux, request("CHECK"), "del_input.json", dir.path(), &recorder);
    assert!(matches!(
        netif.check().unwrap_err(),
        CniError::CheckFailed(_)
    ));
    Ok(())
}

#[test]
fn test_freebsd_check() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempfile::tempdir()?;
    let recorder = RecordingEffector::new().respond(
        "jexec superblah ifconfig eth0 inet",
        "eth0: flags=8863<UP,BROADCAST,RUNNING> metric 0 mtu 1500\n\
         \tinet 172.16.0.2 netmask 0xffffff00 broadcast 172.16.0.255\n",
    );
    let mut netif = engine(Platform::FreeBsd, request("CHECK"), "del_input.json", dir.path(), &recorder);
    netif.check()?;
    assert!(recorder.executed().is_empty());
    Ok(())
}

#[test]
fn test_concurrent_adds_get_distinct_addresses() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempfile::tempdir()?;
    let data_dir = dir.path().to_path_buf();

    let handles: Vec<_> = (0..8)
        .map(|i| {
            let data_dir = data_dir.clone();
            thread::spawn(move || {
                let mut vars = env("ADD");
                vars.insert("CNI_CONTAINERID".to_string(), format!("ctr-{}", i));
                let request = request_from(&vars).expect("valid request");
                let recorder = RecordingEffector::new();
                let mut netif = engine(Platform::Linux, request, "add_input_linux.json", &data_dir, &recorder);
                netif.new_ip().expect("address assigned");
                netif.container_if().ip.expect("address assigned")
            })
        })
        .collect();

    let mut seen = HashSet::new();
    for handle in handles {
        let ip = handle.join().expect("thread finished");
        assert!(seen.insert(ip), "{} handed out twice", ip);
    }
    assert_eq!(seen.len(), 8);
    Ok(())
}
