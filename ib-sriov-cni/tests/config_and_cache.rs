//! Integration test exercising the crate's public config+cache boundary
//! the way a CNI runtime actually drives it: parse the stdin document CNI
//! hands the plugin, resolve the GUID, then round-trip the resulting
//! Attachment through the on-disk cache (spec.md boundary scenario 1).

use ib_sriov_cni::config::{Attachment, Cache, LinkState};
use ib_sriov_cni::guid::Guid;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};

fn tempdir() -> PathBuf {
    static COUNTER: AtomicU32 = AtomicU32::new(0);
    let n = COUNTER.fetch_add(1, Ordering::Relaxed);
    let dir = std::env::temp_dir().join(format!(
        "ib-sriov-cni-integration-{}-{}",
        std::process::id(),
        n
    ));
    let _ = std::fs::remove_dir_all(&dir);
    dir
}

#[test]
fn happy_add_config_resolves_and_caches_as_spec_scenario_1_describes() {
    let stdin = br#"{
        "cniVersion": "0.4.0",
        "name": "ibnet",
        "type": "ib-sriov",
        "deviceID": "0000:af:06.0",
        "link_state": "enable",
        "runtimeConfig": {"infinibandGUID": "01:23:45:67:89:ab:cd:ef"}
    }"#;

    let conf = ib_sriov_cni::config::NetConf::parse(stdin).unwrap();
    assert_eq!(conf.device_id, "0000:af:06.0");
    assert_eq!(conf.link_state, Some(LinkState::Enable));

    let guid = conf.resolve_guid().unwrap();
    let parsed = Guid::parse(&guid).unwrap();
    assert_eq!(parsed.as_str(), "01:23:45:67:89:AB:CD:EF");

    let dir = tempdir();
    let cache = Cache::new(dir.clone());
    let attachment = Attachment {
        pci_address: conf.device_id.clone(),
        pf_name: "ib0".to_string(),
        vf_index: 0,
        host_if_name: Some("ib0v0".to_string()),
        host_if_guid: Some("11:22:33:44:55:66:77:88".to_string()),
        container_if_name: Some("net1".to_string()),
        requested_guid: Some(guid),
        link_state: conf.link_state,
        vfio_mode: false,
        rdma_isolation: false,
        rdma_state: None,
        ipam_type: conf.ipam_type.clone(),
        raw_config: conf.raw.clone(),
    };
    cache.store("cid-happy-path", "net1", &attachment).unwrap();

    let path = dir.join("cid-happy-path-net1");
    assert!(path.exists(), "cache file should land at <cache_dir>/<container_id>-<container_if_name>");

    let loaded = cache.load("cid-happy-path", "net1").unwrap().unwrap();
    assert_eq!(loaded, attachment);

    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn dhcp_ipam_is_rejected_before_any_cache_interaction() {
    let stdin = br#"{
        "cniVersion": "0.4.0",
        "deviceID": "0000:af:06.0",
        "ipam": {"type": "dhcp"}
    }"#;
    assert!(ib_sriov_cni::config::NetConf::parse(stdin).is_err());
}
