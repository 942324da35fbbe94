//! VF Manager (spec §4.2): PF-side VF configuration and moving/renaming
//! the VF netdevice between namespaces. Talks to the kernel only through
//! [`NetlinkOps`] plus the pure [`probe`] reads and [`rebind`]; carries no
//! state of its own beyond the [`crate::config::Attachment`] it is handed.

use crate::config::{Attachment, LinkState};
use crate::error::{EngineError, ErrorKind};
use crate::guid::{self, Guid};
use crate::namespace::{self, NetNsHandle};
use crate::netlink::{NetlinkOps, VfConfig, VfLinkState};
use crate::probe;
use crate::rebind;

fn to_vf_link_state(state: LinkState) -> VfLinkState {
    match state {
        LinkState::Auto => VfLinkState::Auto,
        LinkState::Enable => VfLinkState::Enable,
        LinkState::Disable => VfLinkState::Disable,
    }
}

/// Apply PF-side VF configuration (spec §4.2 "Apply VF Configuration").
/// Programs the per-VF link state if requested, then either programs a
/// requested GUID (capturing the pre-existing one first and rebinding to
/// make it take effect) or, absent a requested GUID, validates that the
/// VF already carries a well-formed one.
pub fn apply_vf_config(ops: &dyn NetlinkOps, attachment: &mut Attachment) -> Result<(), EngineError> {
    let pf_ifindex = ops.link_index(&attachment.pf_name)?;

    if let Some(link_state) = attachment.link_state {
        let config = VfConfig {
            link_state: Some(to_vf_link_state(link_state)),
            ..Default::default()
        };
        ops.set_vf_config(pf_ifindex, attachment.vf_index, &config)?;
    }

    match attachment.requested_guid.clone() {
        Some(requested) => {
            let guid = Guid::parse(&requested)?;

            if !attachment.vfio_mode {
                let current_name = probe::vf_netdev_name(&attachment.pci_address)?;
                let hwaddr = ops.link_hwaddr(&current_name)?;
                attachment.host_if_guid = guid::guid_from_hwaddr(&hwaddr).map(|g| g.as_str().to_string());
            }

            let bytes = guid.to_bytes();
            let config = VfConfig {
                node_guid: Some(bytes),
                port_guid: Some(bytes),
                ..Default::default()
            };
            ops.set_vf_config(pf_ifindex, attachment.vf_index, &config)?;

            if !attachment.vfio_mode {
                let driver = probe::pf_driver(&attachment.pf_name)?;
                rebind::rebind(&attachment.pci_address, &driver)?;
            }
        }
        None => {
            if !attachment.vfio_mode {
                let current_name = probe::vf_netdev_name(&attachment.pci_address)?;
                let hwaddr = ops.link_hwaddr(&current_name)?;
                let existing = guid::guid_from_hwaddr(&hwaddr);
                let valid = existing
                    .as_ref()
                    .map_or(false, |g| !g.is_all_zero() && !g.is_all_ones());
                if !valid {
                    return Err(EngineError::new(
                        ErrorKind::ProbeFailure,
                        format!(
                            "VF {} has no valid pre-existing GUID to keep",
                            attachment.pci_address
                        ),
                    ));
                }
            }
        }
    }

    Ok(())
}

/// Move the VF into the target namespace under `container_if_name` (spec
/// §4.2 "Setup VF"). Renames through a collision-free temporary name
/// derived from the kernel ifindex before the move, since the target
/// namespace may already have a link named `container_if_name` or
/// `host_if_name`.
pub fn setup_vf(
    ops: &dyn NetlinkOps,
    attachment: &mut Attachment,
    target_ns: &NetNsHandle,
    container_if_name: &str,
) -> Result<(), EngineError> {
    let current_name = probe::vf_netdev_name(&attachment.pci_address)?;
    attachment.host_if_name = Some(current_name.clone());

    let ifindex = ops.link_index(&current_name)?;
    ops.set_link_up(ifindex, false)?;

    let tmp_name = format!("vfdev{}", ifindex);
    ops.rename_link(ifindex, &tmp_name)?;

    if let Err(e) = ops.remove_alt_name(ifindex, &current_name) {
        log::warn!(
            "failed to remove alt name {} on ifindex {} (pre-5.x kernel?): {}",
            current_name,
            ifindex,
            e
        );
    }

    ops.move_to_netns(ifindex, target_ns.as_raw_fd())?;

    namespace::with_netns(target_ns, || {
        let ifindex = ops.link_index(&tmp_name)?;
        ops.rename_link(ifindex, container_if_name)?;
        ops.set_link_up(ifindex, true)?;
        Ok(())
    })?;

    attachment.container_if_name = Some(container_if_name.to_string());
    Ok(())
}

/// Move the VF back to the host namespace (spec §4.2 "Release VF"). A
/// no-op for `vfio_mode` (no netdev ever existed) and for an Attachment
/// whose `container_if_name` is unset (already cleaned up).
pub fn release_vf(
    ops: &dyn NetlinkOps,
    attachment: &mut Attachment,
    target_ns: &NetNsHandle,
) -> Result<(), EngineError> {
    if attachment.vfio_mode {
        return Ok(());
    }
    let container_if_name = match attachment.container_if_name.clone() {
        Some(name) => name,
        None => return Ok(()),
    };

    let host_ns = namespace::CurrentNs::capture()?;
    let host_ns_fd = host_ns.as_raw_fd();
    let host_if_name = attachment.host_if_name.clone();

    namespace::with_netns(target_ns, || {
        let ifindex = ops.link_index(&container_if_name)?;
        ops.set_link_up(ifindex, false)?;
        if let Some(name) = &host_if_name {
            // Best-effort: the move back to the host is what actually
            // matters, renaming is cosmetic and the VF may already have
            // picked up a different name via a concurrent rebind.
            if let Err(e) = ops.rename_link(ifindex, name) {
                log::warn!("failed to rename {} back to {} before release: {}", container_if_name, name, e);
            }
        }
        ops.move_to_netns(ifindex, host_ns_fd)?;
        Ok(())
    })?;

    if host_if_name.is_none() {
        let driver = probe::pf_driver(&attachment.pf_name)?;
        rebind::rebind(&attachment.pci_address, &driver)?;
    }

    attachment.container_if_name = None;
    Ok(())
}

/// Best-effort reset of PF-side VF configuration on DEL (spec §4.2 "Reset
/// VF Configuration"). Never fails hard on an unresolvable PF — DEL must
/// remain idempotent across node reboots and missing state.
pub fn reset_vf_config(ops: &dyn NetlinkOps, attachment: &Attachment) -> Result<(), EngineError> {
    let pf_name = if !attachment.pf_name.is_empty() {
        attachment.pf_name.clone()
    } else {
        match probe::pf_name(&attachment.pci_address) {
            Ok(name) => name,
            Err(_) => return Ok(()),
        }
    };

    let pf_ifindex = match ops.link_index(&pf_name) {
        Ok(ifindex) => ifindex,
        Err(_) => return Ok(()),
    };

    let mut config = VfConfig {
        spoofchk: Some(true),
        trust: Some(false),
        min_tx_rate: Some(0),
        ..Default::default()
    };
    if attachment.link_state.is_some() {
        config.link_state = Some(VfLinkState::Auto);
    }

    if let Some(guid) = &attachment.host_if_guid {
        let guid = Guid::parse_lenient(guid)?;
        let guid = if guid.is_all_zero() { Guid::all_ones() } else { guid };
        let bytes = guid.to_bytes();
        config.node_guid = Some(bytes);
        config.port_guid = Some(bytes);
    }

    ops.set_vf_config(pf_ifindex, attachment.vf_index, &config)?;

    if !attachment.vfio_mode {
        if let Some(expected) = &attachment.host_if_name {
            if let Ok(current) = probe::vf_netdev_name(&attachment.pci_address) {
                if &current != expected {
                    let ifindex = ops.link_index(&current)?;
                    ops.rename_link(ifindex, expected)?;
                }
            }
        }
    }

    Ok(())
}
