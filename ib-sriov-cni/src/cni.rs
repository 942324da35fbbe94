//! CNI wire-protocol result/error JSON (spec §6). Printing these is the
//! only thing ever written to stdout/stderr; all diagnostic output goes
//! through `log` instead.

use crate::error::EngineError;
use serde::Serialize;
use serde_json::Value;

/// A single interface entry in a CNI result document.
#[derive(Debug, Clone, Serialize)]
pub struct CniInterface {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mac: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sandbox: Option<String>,
}

/// The JSON document an `ADD` prints to stdout on success (spec §4.1 step
/// 12). `ips` is carried through verbatim from whatever the IPAM delegate
/// returned, with its `interface` indices pointed at this result's own
/// `interfaces` array.
#[derive(Debug, Clone, Serialize)]
pub struct CniResult {
    #[serde(rename = "cniVersion")]
    pub cni_version: String,
    pub interfaces: Vec<CniInterface>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ips: Vec<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dns: Option<Value>,
}

impl CniResult {
    /// Build the result for a successful ADD: one interface (the VF
    /// inside the target namespace) plus whatever IP configuration the
    /// IPAM delegate assigned to it.
    pub fn for_add(
        cni_version: &str,
        container_if_name: &str,
        sandbox: &str,
        ipam_result: Option<&Value>,
        dns: Option<Value>,
    ) -> CniResult {
        let interfaces = vec![CniInterface {
            name: container_if_name.to_string(),
            mac: None,
            sandbox: Some(sandbox.to_string()),
        }];

        let ips = ipam_result
            .and_then(|v| v.get("ips"))
            .and_then(|v| v.as_array())
            .cloned()
            .unwrap_or_default()
            .into_iter()
            .map(|mut ip| {
                if let Some(obj) = ip.as_object_mut() {
                    obj.insert("interface".to_string(), Value::from(0));
                }
                ip
            })
            .collect();

        CniResult {
            cni_version: cni_version.to_string(),
            interfaces,
            ips,
            dns,
        }
    }

    /// Print this result as the ADD command's stdout JSON.
    pub fn print(&self) {
        let body = serde_json::to_string(self).expect("CniResult always serializes");
        println!("{}", body);
    }
}

/// The JSON document written to stderr on any failure (spec §6, §7).
#[derive(Debug, Clone, Serialize)]
pub struct CniError {
    #[serde(rename = "cniVersion")]
    pub cni_version: String,
    pub code: u32,
    pub msg: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl CniError {
    pub fn from_engine_error(cni_version: &str, err: &EngineError) -> CniError {
        CniError {
            cni_version: cni_version.to_string(),
            code: err.kind.code(),
            msg: err.kind.name().to_string(),
            details: Some(err.message.clone()),
        }
    }

    /// Print this error as the failure path's stderr JSON.
    pub fn print(&self) {
        let body = serde_json::to_string(self).expect("CniError always serializes");
        eprintln!("{}", body);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use serde_json::json;

    #[test]
    fn for_add_points_ips_at_the_single_interface() {
        let ipam_result = json!({"cniVersion": "0.4.0", "ips": [{"address": "10.0.0.2/24"}]});
        let result = CniResult::for_add("0.4.0", "net1", "/proc/1234/ns/net", Some(&ipam_result), None);
        assert_eq!(result.interfaces.len(), 1);
        assert_eq!(result.interfaces[0].name, "net1");
        assert_eq!(result.ips[0]["interface"], 0);
        assert_eq!(result.ips[0]["address"], "10.0.0.2/24");
    }

    #[test]
    fn for_add_without_ipam_has_empty_ips() {
        let result = CniResult::for_add("0.4.0", "net1", "/proc/1234/ns/net", None, None);
        assert!(result.ips.is_empty());
    }

    #[test]
    fn error_carries_kind_code_and_message() {
        let err = EngineError::new(ErrorKind::RdmaTopology, "expected exactly one RDMA device");
        let cni_err = CniError::from_engine_error("0.4.0", &err);
        assert_eq!(cni_err.code, ErrorKind::RdmaTopology.code());
        assert_eq!(cni_err.msg, "RdmaTopology");
        assert_eq!(cni_err.details.as_deref(), Some("expected exactly one RDMA device"));
    }
}
