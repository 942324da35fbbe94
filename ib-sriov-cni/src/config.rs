//! Stdin configuration and on-disk attachment cache (spec §3, §4.6, §6).
//! Field names, defaults and the cache key scheme match
//! `examples/original_source/pkg/config/config.go` and
//! `pkg/types/types.go` so existing deployments' NetworkAttachmentDefinitions
//! keep working unmodified.

use crate::error::{CacheError, ConfigError};
use crate::error::{CreateCacheDirSnafu, InvalidSnafu, JsonSnafu, ParseSnafu, ReadSnafu, RemoveSnafu, WriteSnafu};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use snafu::{ensure, OptionExt, ResultExt};
use std::collections::HashMap;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;

pub const DEFAULT_CNI_DIR: &str = "/var/lib/cni/ib-sriov";
pub const CNI_FILE_LOCK_DIR: &str = "/var/run/cni/ib-sriov";
pub const CNI_FILE_LOCK_NAME: &str = "cni.lock";

const DIR_MODE: u32 = 0o700;
const FILE_MODE: u32 = 0o600;

const IB_KUBERNETES_ANNOTATION: &str = "mellanox.infiniband.app";
const IB_KUBERNETES_CONFIGURED: &str = "configured";
const IPAM_DHCP: &str = "dhcp";

/// The `link_state` values the kernel accepts (spec §3/§6). `""`/absent is
/// treated as "leave alone" — no `IFLA_VF_LINK_STATE` attribute is sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkState {
    Auto,
    Enable,
    Disable,
}

impl LinkState {
    fn parse(raw: &str) -> Result<Option<LinkState>, ConfigError> {
        match raw {
            "" => Ok(None),
            "auto" => Ok(Some(LinkState::Auto)),
            "enable" => Ok(Some(LinkState::Enable)),
            "disable" => Ok(Some(LinkState::Disable)),
            other => InvalidSnafu {
                message: format!("invalid link_state {:?}, expected one of \"\", auto, enable, disable", other),
            }
            .fail(),
        }
    }
}

impl std::fmt::Display for LinkState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            LinkState::Auto => "auto",
            LinkState::Enable => "enable",
            LinkState::Disable => "disable",
        };
        write!(f, "{}", s)
    }
}

/// `args.cni` bag, carrying per-invocation annotations the orchestrator
/// pulls `guid` and the ib-kubernetes gate annotation out of.
pub type CniArgs = HashMap<String, String>;

/// Raw stdin document as the CNI runtime hands it to us (spec §6), field
/// names matching the original Go `NetConf` struct's JSON tags.
#[derive(Debug, Deserialize)]
struct RawNetConf {
    #[serde(rename = "cniVersion", default)]
    cni_version: String,
    #[serde(default)]
    name: String,
    #[serde(rename = "type", default)]
    plugin_type: String,
    #[serde(rename = "deviceID", default)]
    device_id: Option<String>,
    #[serde(default)]
    pkey: Option<String>,
    #[serde(rename = "link_state", default)]
    link_state: Option<String>,
    #[serde(rename = "rdmaIsolation", default)]
    rdma_isolation: bool,
    #[serde(rename = "ibKubernetesEnabled", default)]
    ib_kubernetes_enabled: bool,
    #[serde(rename = "vfioPciMode", default)]
    vfio_pci_mode: bool,
    #[serde(rename = "runtimeConfig", default)]
    runtime_config: RawRuntimeConfig,
    #[serde(default)]
    args: RawArgs,
    #[serde(default)]
    ipam: Option<Value>,
    #[serde(default)]
    dns: Option<Value>,
    #[serde(rename = "prevResult", default)]
    prev_result: Option<Value>,
    #[serde(rename = "cniDir", default)]
    cni_dir: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct RawRuntimeConfig {
    #[serde(rename = "infinibandGUID", default)]
    infiniband_guid: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct RawArgs {
    #[serde(default)]
    cni: CniArgs,
}

/// Validated plugin configuration for a single ADD/DEL/CHECK invocation
/// (spec §3/§6). Carries the raw stdin bytes verbatim so they can be
/// replayed unmodified to the IPAM delegate on rollback and on DEL.
#[derive(Debug, Clone)]
pub struct NetConf {
    pub cni_version: String,
    pub name: String,
    pub plugin_type: String,
    pub device_id: String,
    pub pkey: Option<String>,
    pub link_state: Option<LinkState>,
    pub rdma_isolation: bool,
    pub ib_kubernetes_enabled: bool,
    pub vfio_pci_mode: bool,
    pub runtime_guid: Option<String>,
    pub cni_args: CniArgs,
    pub ipam_type: Option<String>,
    pub ipam: Option<Value>,
    pub dns: Option<Value>,
    pub prev_result: Option<Value>,
    pub cni_dir: PathBuf,
    pub raw: Vec<u8>,
}

impl NetConf {
    /// Parse and validate the stdin JSON document (spec §4.1 step 1 /
    /// §4.6). Rejects malformed JSON, an unrecognized `link_state`, and
    /// `ipam.type == "dhcp"`. Does not yet perform the ib-kubernetes gate
    /// check, which needs the resolved GUID from [`NetConf::resolve_guid`].
    pub fn parse(stdin: &[u8]) -> Result<NetConf, ConfigError> {
        let raw: RawNetConf = serde_json::from_slice(stdin).context(JsonSnafu)?;

        let device_id = raw.device_id.context(InvalidSnafu {
            message: "deviceID is required".to_string(),
        })?;
        ensure!(
            !device_id.is_empty(),
            InvalidSnafu {
                message: "deviceID must not be empty".to_string(),
            }
        );

        let link_state = LinkState::parse(raw.link_state.as_deref().unwrap_or(""))?;

        let ipam_type = raw
            .ipam
            .as_ref()
            .and_then(|v| v.get("type"))
            .and_then(|v| v.as_str())
            .map(|s| s.to_string());
        if let Some(t) = &ipam_type {
            ensure!(
                t != IPAM_DHCP,
                InvalidSnafu {
                    message: "ipam type \"dhcp\" is not supported".to_string(),
                }
            );
        }

        let cni_dir = raw
            .cni_dir
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CNI_DIR));

        Ok(NetConf {
            cni_version: raw.cni_version,
            name: raw.name,
            plugin_type: raw.plugin_type,
            device_id,
            pkey: raw.pkey,
            link_state,
            rdma_isolation: raw.rdma_isolation,
            ib_kubernetes_enabled: raw.ib_kubernetes_enabled,
            vfio_pci_mode: raw.vfio_pci_mode,
            runtime_guid: raw.runtime_config.infiniband_guid,
            cni_args: raw.args.cni,
            ipam_type,
            ipam: raw.ipam,
            dns: raw.dns,
            prev_result: raw.prev_result,
            cni_dir,
            raw: stdin.to_vec(),
        })
    }

    /// Resolve the GUID to program, preferring `runtimeConfig.infinibandGUID`
    /// over the CNI-arg `guid`, else `None` (spec §4.1 step 2).
    pub fn resolve_guid(&self) -> Option<String> {
        self.runtime_guid
            .clone()
            .or_else(|| self.cni_args.get("guid").cloned())
    }

    /// Enforce the ib-kubernetes gate (spec §4.1 step 1): when enabled, the
    /// `mellanox.infiniband.app` annotation must read `"configured"` and a
    /// GUID must be resolvable.
    pub fn check_ib_kubernetes_gate(&self, resolved_guid: Option<&str>) -> Result<(), ConfigError> {
        if !self.ib_kubernetes_enabled {
            return Ok(());
        }
        let annotation = self.cni_args.get(IB_KUBERNETES_ANNOTATION).map(String::as_str);
        ensure!(
            annotation == Some(IB_KUBERNETES_CONFIGURED),
            InvalidSnafu {
                message: format!(
                    "ib-kubernetes gate enabled but {} annotation is {:?}, expected {:?}",
                    IB_KUBERNETES_ANNOTATION, annotation, IB_KUBERNETES_CONFIGURED
                ),
            }
        );
        ensure!(
            resolved_guid.map_or(false, |g| !g.is_empty()),
            InvalidSnafu {
                message: "ib-kubernetes gate enabled but no GUID is resolvable".to_string(),
            }
        );
        Ok(())
    }
}

/// Per-invocation RDMA device relocation record (spec §3).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RdmaState {
    pub pci: String,
    pub sandbox_rdma_name: String,
    pub container_rdma_name: String,
}

/// Everything recorded on ADD and replayed on DEL (spec §3). This is the
/// sole source of truth for DEL; the CNI DEL invocation receives the same
/// stdin the ADD did, but orchestrators are not required to guarantee
/// that, which is why the original implementation — and this one — caches
/// explicitly rather than re-deriving state from stdin on DEL.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Attachment {
    pub pci_address: String,
    pub pf_name: String,
    pub vf_index: u32,
    pub host_if_name: Option<String>,
    pub host_if_guid: Option<String>,
    pub container_if_name: Option<String>,
    pub requested_guid: Option<String>,
    pub link_state: Option<LinkState>,
    pub vfio_mode: bool,
    pub rdma_isolation: bool,
    pub rdma_state: Option<RdmaState>,
    pub ipam_type: Option<String>,
    pub raw_config: Vec<u8>,
}

/// The on-disk attachment cache, keyed by `{container_id}-{container_if_name}`
/// (a plain hyphen join of exactly those two fields, matching the
/// original's `strings.Join([]string{cid, podIfName}, "-")` — not a
/// path-escaped encoding).
pub struct Cache {
    dir: PathBuf,
}

impl Cache {
    pub fn new(dir: PathBuf) -> Cache {
        Cache { dir }
    }

    fn key(container_id: &str, container_if_name: &str) -> String {
        format!("{}-{}", container_id, container_if_name)
    }

    fn path(&self, container_id: &str, container_if_name: &str) -> PathBuf {
        self.dir.join(Cache::key(container_id, container_if_name))
    }

    pub fn store(
        &self,
        container_id: &str,
        container_if_name: &str,
        attachment: &Attachment,
    ) -> Result<(), CacheError> {
        fs::create_dir_all(&self.dir).context(CreateCacheDirSnafu {
            path: self.dir.clone(),
        })?;
        let _ = fs::set_permissions(&self.dir, fs::Permissions::from_mode(DIR_MODE));

        let path = self.path(container_id, container_if_name);
        let body = serde_json::to_vec_pretty(attachment).expect("Attachment always serializes");
        fs::write(&path, body).context(WriteSnafu { path: path.clone() })?;
        let _ = fs::set_permissions(&path, fs::Permissions::from_mode(FILE_MODE));
        Ok(())
    }

    pub fn load(
        &self,
        container_id: &str,
        container_if_name: &str,
    ) -> Result<Option<Attachment>, CacheError> {
        let path = self.path(container_id, container_if_name);
        let body = match fs::read(&path) {
            Ok(body) => body,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(source) => return Err(source).context(ReadSnafu { path }),
        };
        let attachment = serde_json::from_slice(&body).context(ParseSnafu { path })?;
        Ok(Some(attachment))
    }

    pub fn remove(&self, container_id: &str, container_if_name: &str) -> Result<(), CacheError> {
        let path = self.path(container_id, container_if_name);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(source).context(RemoveSnafu { path }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn tempdir() -> PathBuf {
        static COUNTER: AtomicU32 = AtomicU32::new(0);
        let n = COUNTER.fetch_add(1, Ordering::Relaxed);
        std::env::temp_dir().join(format!("ib-sriov-cache-test-{}-{}", std::process::id(), n))
    }

    #[test]
    fn parses_minimal_config() {
        let stdin = br#"{"cniVersion":"0.4.0","name":"ibnet","type":"ib-sriov","deviceID":"0000:af:06.0"}"#;
        let conf = NetConf::parse(stdin).unwrap();
        assert_eq!(conf.device_id, "0000:af:06.0");
        assert!(conf.link_state.is_none());
        assert_eq!(conf.cni_dir, PathBuf::from(DEFAULT_CNI_DIR));
        assert!(!conf.rdma_isolation);
        assert_eq!(conf.resolve_guid(), None);
    }

    #[test]
    fn rejects_missing_device_id() {
        let stdin = br#"{"cniVersion":"0.4.0","name":"ibnet"}"#;
        assert!(NetConf::parse(stdin).is_err());
    }

    #[test]
    fn rejects_invalid_link_state() {
        let stdin = br#"{"cniVersion":"0.4.0","name":"ibnet","deviceID":"0000:af:06.0","link_state":"sideways"}"#;
        assert!(NetConf::parse(stdin).is_err());
    }

    #[test]
    fn rejects_dhcp_ipam() {
        let stdin = br#"{"cniVersion":"0.4.0","name":"ibnet","deviceID":"0000:af:06.0","ipam":{"type":"dhcp"}}"#;
        assert!(NetConf::parse(stdin).is_err());
    }

    #[test]
    fn resolves_guid_preferring_runtime_config() {
        let stdin = br#"{
            "cniVersion":"0.4.0","name":"ibnet","deviceID":"0000:af:06.0",
            "runtimeConfig":{"infinibandGUID":"01:00:00:00:00:00:00:01"},
            "args":{"cni":{"guid":"02:00:00:00:00:00:00:02"}}
        }"#;
        let conf = NetConf::parse(stdin).unwrap();
        assert_eq!(conf.resolve_guid().as_deref(), Some("01:00:00:00:00:00:00:01"));
    }

    #[test]
    fn falls_back_to_cni_arg_guid() {
        let stdin = br#"{
            "cniVersion":"0.4.0","name":"ibnet","deviceID":"0000:af:06.0",
            "args":{"cni":{"guid":"02:00:00:00:00:00:00:02"}}
        }"#;
        let conf = NetConf::parse(stdin).unwrap();
        assert_eq!(conf.resolve_guid().as_deref(), Some("02:00:00:00:00:00:00:02"));
    }

    #[test]
    fn ib_kubernetes_gate_requires_annotation_and_guid() {
        let stdin = br#"{
            "cniVersion":"0.4.0","name":"ibnet","deviceID":"0000:af:06.0",
            "ibKubernetesEnabled":true
        }"#;
        let conf = NetConf::parse(stdin).unwrap();
        assert!(conf.check_ib_kubernetes_gate(conf.resolve_guid().as_deref()).is_err());

        let stdin = br#"{
            "cniVersion":"0.4.0","name":"ibnet","deviceID":"0000:af:06.0",
            "ibKubernetesEnabled":true,
            "args":{"cni":{"guid":"02:00:00:00:00:00:00:02","mellanox.infiniband.app":"configured"}}
        }"#;
        let conf = NetConf::parse(stdin).unwrap();
        assert!(conf.check_ib_kubernetes_gate(conf.resolve_guid().as_deref()).is_ok());
    }

    #[test]
    fn cache_round_trips_and_is_removable() {
        let dir = tempdir();
        let cache = Cache::new(dir.clone());
        let attachment = Attachment {
            pci_address: "0000:af:06.0".to_string(),
            pf_name: "ib0".to_string(),
            vf_index: 1,
            host_if_name: Some("ib0v1".to_string()),
            host_if_guid: Some("FF:FF:FF:FF:FF:FF:FF:FF".to_string()),
            container_if_name: Some("net1".to_string()),
            requested_guid: Some("01:23:45:67:89:AB:CD:EF".to_string()),
            link_state: Some(LinkState::Enable),
            vfio_mode: false,
            rdma_isolation: true,
            rdma_state: Some(RdmaState {
                pci: "0000:af:06.0".to_string(),
                sandbox_rdma_name: "mlx5_1".to_string(),
                container_rdma_name: "mlx5_1".to_string(),
            }),
            ipam_type: None,
            raw_config: b"{}".to_vec(),
        };
        cache.store("cid123", "net1", &attachment).unwrap();
        let loaded = cache.load("cid123", "net1").unwrap();
        assert_eq!(loaded, Some(attachment));

        cache.remove("cid123", "net1").unwrap();
        assert_eq!(cache.load("cid123", "net1").unwrap(), None);

        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn cache_key_is_plain_hyphen_join() {
        assert_eq!(Cache::key("cid123", "net1"), "cid123-net1");
    }

    #[test]
    fn missing_cache_entry_loads_as_none() {
        let dir = tempdir();
        let cache = Cache::new(dir.clone());
        assert_eq!(cache.load("nope", "net1").unwrap(), None);
        let _ = fs::remove_dir_all(&dir);
    }
}
