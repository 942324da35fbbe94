//! Orchestrator (spec §4.1): dispatches `Add`/`Delete`/`Check`, owns the
//! compensating-action stack, serializes mutating work through the
//! cross-process lock. This is the only component that ever catches an
//! error from the lower layers (spec §7's propagation policy).

use crate::cni::CniResult;
use crate::config::{Attachment, Cache, NetConf, CNI_FILE_LOCK_DIR, CNI_FILE_LOCK_NAME, DEFAULT_CNI_DIR};
use crate::error::{EngineError, ErrorKind, NamespaceError};
use crate::ipam::{self, CniEnv};
use crate::lock::FileLock;
use crate::namespace::{self, NetNsHandle};
use crate::netlink::NetlinkOps;
use crate::probe;
use crate::rdma::{self, RdmaOps};
use crate::vf;
use serde_json::Value;
use std::path::{Path, PathBuf};

/// The per-invocation identity every CNI command carries (spec §4.1),
/// assembled by the CLI shell from environment variables.
#[derive(Debug, Clone)]
pub struct Invocation {
    pub container_id: String,
    pub target_ns_path: String,
    pub container_if_name: String,
    pub cni_args_raw: String,
    pub cni_path: String,
}

/// A step whose effect needs undoing if a later step in `Add` fails,
/// pushed in the order completed and unwound in reverse (spec §9).
#[derive(Debug)]
enum UndoStep {
    ResetVfConfig,
    MoveRdmaHome,
    ReleaseVf,
    IpamDelete,
}

/// The engine, holding the two kernel-facing abstractions `Add`/`Delete`
/// need. `Check` needs neither.
pub struct Engine<'a> {
    netlink: &'a dyn NetlinkOps,
    rdma: &'a dyn RdmaOps,
}

impl<'a> Engine<'a> {
    pub fn new(netlink: &'a dyn NetlinkOps, rdma: &'a dyn RdmaOps) -> Engine<'a> {
        Engine { netlink, rdma }
    }

    /// Attach a VF to the target namespace (spec §4.1 Add).
    pub fn add(&self, invocation: &Invocation, stdin: &[u8]) -> Result<CniResult, EngineError> {
        let conf = NetConf::parse(stdin)?;
        let resolved_guid = conf.resolve_guid();
        conf.check_ib_kubernetes_gate(resolved_guid.as_deref())?;

        if conf.rdma_isolation && !self.rdma.is_exclusive_mode()? {
            return Err(EngineError::new(
                ErrorKind::SystemPrerequisite,
                "RDMA subsystem is not in exclusive netns mode",
            ));
        }

        let pf_name = probe::pf_name(&conf.device_id)?;
        let vf_index = probe::vf_index(&conf.device_id, &pf_name)?;
        let vfio_mode = conf.vfio_pci_mode || probe::is_vfio(&conf.device_id);

        let mut attachment = Attachment {
            pci_address: conf.device_id.clone(),
            pf_name,
            vf_index,
            host_if_name: None,
            host_if_guid: None,
            container_if_name: None,
            requested_guid: resolved_guid,
            link_state: conf.link_state,
            vfio_mode,
            rdma_isolation: conf.rdma_isolation,
            rdma_state: None,
            ipam_type: conf.ipam_type.clone(),
            raw_config: conf.raw.clone(),
        };

        let target_ns = NetNsHandle::open(&invocation.target_ns_path)?;
        let _lock = FileLock::acquire(Path::new(CNI_FILE_LOCK_DIR), CNI_FILE_LOCK_NAME)?;

        let mut undo = Vec::new();
        let outcome = self.add_locked(invocation, &conf, &mut attachment, &target_ns, &mut undo);

        match outcome {
            Ok(ipam_result) => {
                let cache = Cache::new(conf.cni_dir.clone());
                cache.store(&invocation.container_id, &invocation.container_if_name, &attachment)?;
                Ok(CniResult::for_add(
                    &conf.cni_version,
                    &invocation.container_if_name,
                    &invocation.target_ns_path,
                    ipam_result.as_ref(),
                    conf.dns.clone(),
                ))
            }
            Err(err) => {
                self.unwind(invocation, &conf, &mut attachment, &target_ns, undo);
                Err(err)
            }
        }
    }

    /// Steps 7-10 of Add, run with the lock held; `undo` accumulates which
    /// compensating actions are needed so far, surviving past an `Err`
    /// return since the caller owns it.
    fn add_locked(
        &self,
        invocation: &Invocation,
        conf: &NetConf,
        attachment: &mut Attachment,
        target_ns: &NetNsHandle,
        undo: &mut Vec<UndoStep>,
    ) -> Result<Option<Value>, EngineError> {
        vf::apply_vf_config(self.netlink, attachment)?;
        undo.push(UndoStep::ResetVfConfig);

        if attachment.rdma_isolation {
            let device = rdma::move_to_namespace(self.rdma, &attachment.pci_address, target_ns.as_raw_fd())?;
            attachment.rdma_state = Some(crate::config::RdmaState {
                pci: attachment.pci_address.clone(),
                sandbox_rdma_name: device.clone(),
                container_rdma_name: device,
            });
            undo.push(UndoStep::MoveRdmaHome);
        }

        if !attachment.vfio_mode {
            vf::setup_vf(self.netlink, attachment, target_ns, &invocation.container_if_name)?;
            undo.push(UndoStep::ReleaseVf);
        }

        let ipam_result = match &conf.ipam_type {
            Some(plugin) => {
                let env = invocation_cni_env(invocation);
                let result = ipam::exec_add(plugin, &env, &conf.raw)?;
                undo.push(UndoStep::IpamDelete);
                Some(result)
            }
            None => None,
        };

        Ok(ipam_result)
    }

    /// Unwind completed steps in LIFO order on a failed Add. Each
    /// individual failure is logged and suppressed — the original error
    /// is what the caller sees (spec §7, §9).
    fn unwind(
        &self,
        invocation: &Invocation,
        conf: &NetConf,
        attachment: &mut Attachment,
        target_ns: &NetNsHandle,
        undo: Vec<UndoStep>,
    ) {
        for step in undo.into_iter().rev() {
            let result = match step {
                UndoStep::IpamDelete => match &conf.ipam_type {
                    Some(plugin) => {
                        let env = invocation_cni_env(invocation);
                        ipam::exec_del(plugin, &env, &conf.raw).map_err(EngineError::from)
                    }
                    None => Ok(()),
                },
                UndoStep::ReleaseVf => vf::release_vf(self.netlink, attachment, target_ns),
                UndoStep::MoveRdmaHome => match attachment.rdma_state.clone() {
                    Some(state) => namespace::CurrentNs::capture()
                        .map_err(EngineError::from)
                        .and_then(|host_ns| {
                            let host_fd = host_ns.as_raw_fd();
                            // The RDMA device still lives in target_ns; the
                            // lookup that resolves it by PCI address is a
                            // sysfs scan that is itself namespace-scoped, so
                            // it has to run from inside target_ns, not from
                            // the host namespace we're unwinding back to.
                            namespace::with_netns(target_ns, || {
                                rdma::move_to_host(self.rdma, &state.pci, host_fd)
                                    .map(|_| ())
                                    .map_err(EngineError::from)
                            })
                        }),
                    None => Ok(()),
                },
                UndoStep::ResetVfConfig => vf::reset_vf_config(self.netlink, attachment),
            };
            if let Err(e) = result {
                log::warn!("rollback step {:?} failed (continuing unwind): {}", step, e);
            }
        }
    }

    /// Detach a VF from the target namespace (spec §4.1 Delete). Must
    /// remain idempotent: an empty namespace path, an already-gone
    /// namespace, and a missing cache entry are all successes, not
    /// errors.
    pub fn delete(&self, invocation: &Invocation, stdin: &[u8]) -> Result<(), EngineError> {
        if invocation.target_ns_path.is_empty() {
            return Ok(());
        }

        let cni_dir = NetConf::parse(stdin)
            .map(|conf| conf.cni_dir)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_CNI_DIR));
        let cache = Cache::new(cni_dir);

        let mut attachment = match cache.load(&invocation.container_id, &invocation.container_if_name) {
            Ok(Some(attachment)) => attachment,
            Ok(None) => return Ok(()),
            Err(e) => {
                log::warn!("failed to read cache entry, treating DEL as already done: {}", e);
                return Ok(());
            }
        };

        if let Some(plugin) = attachment.ipam_type.clone() {
            let env = invocation_cni_env(invocation);
            if let Err(e) = ipam::exec_del(&plugin, &env, &attachment.raw_config) {
                log::warn!("IPAM delete failed (continuing DEL, open question per spec §9): {}", e);
            }
        }

        let target_ns = match NetNsHandle::open(&invocation.target_ns_path) {
            Ok(ns) => ns,
            Err(NamespaceError::Namespace { source, .. }) if source.kind() == std::io::ErrorKind::NotFound => {
                log::debug!("target namespace no longer exists, DEL is a no-op (node reboot semantics)");
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };

        let _lock = FileLock::acquire(Path::new(CNI_FILE_LOCK_DIR), CNI_FILE_LOCK_NAME)?;

        vf::release_vf(self.netlink, &mut attachment, &target_ns)?;

        if attachment.rdma_isolation {
            if let Some(state) = attachment.rdma_state.clone() {
                let host_ns = namespace::CurrentNs::capture()?;
                let host_fd = host_ns.as_raw_fd();
                // Same reasoning as the ADD-rollback path: the device
                // still lives in target_ns, and resolving it by PCI
                // address is a namespace-scoped sysfs scan, so the move
                // has to be issued from inside target_ns.
                let result = namespace::with_netns(&target_ns, || {
                    rdma::move_to_host(self.rdma, &state.pci, host_fd)
                        .map(|_| ())
                        .map_err(EngineError::from)
                });
                if let Err(e) = result {
                    log::warn!(
                        "failed to move RDMA device {} back to host: {}",
                        state.sandbox_rdma_name,
                        e
                    );
                }
            }
        }

        vf::reset_vf_config(self.netlink, &attachment)?;

        if let Err(e) = cache.remove(&invocation.container_id, &invocation.container_if_name) {
            log::warn!("failed to remove cache entry after successful teardown: {}", e);
        }

        Ok(())
    }

    /// `Check` is always a successful no-op (spec §4.1).
    pub fn check(&self) -> Result<(), EngineError> {
        Ok(())
    }
}

fn invocation_cni_env(invocation: &Invocation) -> CniEnv {
    CniEnv {
        container_id: invocation.container_id.clone(),
        netns: invocation.target_ns_path.clone(),
        if_name: invocation.container_if_name.clone(),
        cni_args: invocation.cni_args_raw.clone(),
        path: invocation.cni_path.clone(),
    }
}
