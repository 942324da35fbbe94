//! IPAM delegate invocation (spec §4.1 step 10, §4.6). IP address
//! allocation itself is explicitly out of scope (spec §1 Non-goals); this
//! module only implements the CNI exec-delegate contract: locate the IPAM
//! plugin binary on `CNI_PATH`, run it with the same stdin configuration
//! document the engine itself received, and parse its JSON result.

use crate::error::{ExecSnafu, IpamError, NoAddressesSnafu, NonZeroExitSnafu, ParseResultSnafu, PluginNotFoundSnafu};
use serde_json::Value;
use snafu::{ensure, ResultExt};
use std::io::Write;
use std::process::{Command, Stdio};

/// Triple of environment context every CNI exec delegate is invoked with
/// (spec §6 "Environment variables"), threaded through from the engine's
/// own invocation.
#[derive(Debug, Clone)]
pub struct CniEnv {
    pub container_id: String,
    pub netns: String,
    pub if_name: String,
    pub cni_args: String,
    pub path: String,
}

fn find_plugin(plugin: &str, cni_path: &str) -> Option<std::path::PathBuf> {
    for dir in cni_path.split(':').filter(|d| !d.is_empty()) {
        let candidate = std::path::Path::new(dir).join(plugin);
        if candidate.is_file() {
            return Some(candidate);
        }
    }
    None
}

fn run(
    plugin: &str,
    command: &str,
    env: &CniEnv,
    stdin: &[u8],
) -> Result<Vec<u8>, IpamError> {
    let bin = find_plugin(plugin, &env.path).context(PluginNotFoundSnafu {
        plugin: plugin.to_string(),
    })?;

    let mut child = Command::new(&bin)
        .env("CNI_COMMAND", command)
        .env("CNI_CONTAINERID", &env.container_id)
        .env("CNI_NETNS", &env.netns)
        .env("CNI_IFNAME", &env.if_name)
        .env("CNI_ARGS", &env.cni_args)
        .env("CNI_PATH", &env.path)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .context(ExecSnafu {
            plugin: plugin.to_string(),
        })?;

    child
        .stdin
        .take()
        .expect("piped")
        .write_all(stdin)
        .context(ExecSnafu {
            plugin: plugin.to_string(),
        })?;

    let output = child.wait_with_output().context(ExecSnafu {
        plugin: plugin.to_string(),
    })?;

    ensure!(
        output.status.success(),
        NonZeroExitSnafu {
            plugin: plugin.to_string(),
            status: output.status.code().unwrap_or(-1),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        }
    );

    Ok(output.stdout)
}

/// Run the IPAM plugin's `ADD` and parse its result as a generic CNI
/// result document. The caller is responsible for extracting `ips` and
/// configuring the container interface with them (spec §4.1 step 10).
pub fn exec_add(plugin: &str, env: &CniEnv, stdin: &[u8]) -> Result<Value, IpamError> {
    let stdout = run(plugin, "ADD", env, stdin)?;
    let result: Value = serde_json::from_slice(&stdout).context(ParseResultSnafu {
        plugin: plugin.to_string(),
    })?;
    let has_ips = result
        .get("ips")
        .and_then(|v| v.as_array())
        .map_or(false, |a| !a.is_empty());
    ensure!(has_ips, NoAddressesSnafu);
    Ok(result)
}

/// Run the IPAM plugin's `DEL`. Used both on the rollback path of a
/// failed ADD and on normal DEL (spec §4.1 step 10 undo, §4.1 Delete
/// step 1).
pub fn exec_del(plugin: &str, env: &CniEnv, stdin: &[u8]) -> Result<(), IpamError> {
    run(plugin, "DEL", env, stdin)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::os::unix::fs::PermissionsExt;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn tempdir() -> std::path::PathBuf {
        static COUNTER: AtomicU32 = AtomicU32::new(0);
        let n = COUNTER.fetch_add(1, Ordering::Relaxed);
        let dir = std::env::temp_dir().join(format!("ib-sriov-ipam-test-{}-{}", std::process::id(), n));
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn write_fake_plugin(dir: &std::path::Path, name: &str, script: &str) {
        let path = dir.join(name);
        fs::write(&path, script).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
    }

    fn env(path: &std::path::Path) -> CniEnv {
        CniEnv {
            container_id: "cid123".to_string(),
            netns: "/proc/1/ns/net".to_string(),
            if_name: "net1".to_string(),
            cni_args: "".to_string(),
            path: path.to_string_lossy().into_owned(),
        }
    }

    #[test]
    fn missing_plugin_binary_fails_with_plugin_not_found() {
        let dir = tempdir();
        let err = exec_add("host-local", &env(&dir), b"{}").unwrap_err();
        assert!(matches!(err, IpamError::PluginNotFound { .. }));
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn exec_add_parses_result_and_rejects_empty_ips() {
        let dir = tempdir();
        write_fake_plugin(&dir, "host-local", "#!/bin/sh\necho '{\"cniVersion\":\"0.4.0\",\"ips\":[]}'\n");
        let err = exec_add("host-local", &env(&dir), b"{}").unwrap_err();
        assert!(matches!(err, IpamError::NoAddresses));
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn exec_add_succeeds_with_ips() {
        let dir = tempdir();
        write_fake_plugin(
            &dir,
            "host-local",
            "#!/bin/sh\necho '{\"cniVersion\":\"0.4.0\",\"ips\":[{\"address\":\"10.0.0.2/24\"}]}'\n",
        );
        let result = exec_add("host-local", &env(&dir), b"{}").unwrap();
        assert_eq!(result["ips"][0]["address"], "10.0.0.2/24");
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn nonzero_exit_surfaces_stderr() {
        let dir = tempdir();
        write_fake_plugin(&dir, "host-local", "#!/bin/sh\necho 'boom' >&2\nexit 1\n");
        let err = exec_del("host-local", &env(&dir), b"{}").unwrap_err();
        match err {
            IpamError::NonZeroExit { stderr, .. } => assert!(stderr.contains("boom")),
            other => panic!("unexpected error: {:?}", other),
        }
        let _ = fs::remove_dir_all(&dir);
    }
}
