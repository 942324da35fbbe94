//! Pure, read-only sysfs/PCI probe functions (spec §4.4). No netlink, no
//! mutation — safe to call at any point, including speculatively.

use crate::error::{IoSnafu, NoPfSnafu, ProbeError, VfNotFoundSnafu};
use snafu::ResultExt;
use std::path::{Path, PathBuf};

const SYS_BUS_PCI: &str = "/sys/bus/pci/devices";
const SYS_CLASS_NET: &str = "/sys/class/net";
const VFIO_PCI_DRIVER: &str = "vfio-pci";

fn io_ctx<P: Into<PathBuf>>(path: P) -> IoSnafu<PathBuf> {
    IoSnafu { path: path.into() }
}

/// Resolve the host netdev name of a VF's parent PF.
pub fn pf_name(vf_pci: &str) -> Result<String, ProbeError> {
    let dir = Path::new(SYS_BUS_PCI).join(vf_pci).join("physfn").join("net");
    sysfs::single_dir_entry(&dir).map_err(|_| {
        NoPfSnafu {
            vf_pci: vf_pci.to_string(),
        }
        .build()
    })
}

/// Resolve the VF's index under its PF by scanning `virtfn<i>` symlinks for
/// the one whose target basename matches `vf_pci`.
pub fn vf_index(vf_pci: &str, pf_name: &str) -> Result<u32, ProbeError> {
    let pf_device_dir = Path::new(SYS_CLASS_NET).join(pf_name).join("device");
    let num_vfs: u32 = sysfs::parse_value(&pf_device_dir, "sriov_numvfs")
        .context(io_ctx(&pf_device_dir))?;

    for i in 0..num_vfs {
        let link = pf_device_dir.join(format!("virtfn{}", i));
        if let Ok(target) = sysfs::read_link_basename(&link) {
            if target == vf_pci {
                return Ok(i);
            }
        }
    }
    VfNotFoundSnafu {
        vf_pci: vf_pci.to_string(),
        pf_name: pf_name.to_string(),
    }
    .fail()
}

/// Inverse of [`vf_index`]: resolve the VF's PCI address given its PF and
/// index.
pub fn pci_address(pf_name: &str, vf_index: u32) -> Result<String, ProbeError> {
    let link = Path::new(SYS_CLASS_NET)
        .join(pf_name)
        .join("device")
        .join(format!("virtfn{}", vf_index));
    sysfs::read_link_basename(&link).context(io_ctx(&link))
}

/// Resolve the VF's current netdev name (the single entry under its
/// `net/` sysfs directory). A prior driver rebind may have changed this
/// since the last probe.
pub fn vf_netdev_name(vf_pci: &str) -> Result<String, ProbeError> {
    let dir = Path::new(SYS_BUS_PCI).join(vf_pci).join("net");
    sysfs::single_dir_entry(&dir).context(io_ctx(&dir))
}

/// Whether the VF's PCI device is currently bound to the `vfio-pci`
/// driver (no netdev will exist in that case). A missing/unreadable
/// `driver` symlink (unbound device) is treated as "not vfio", matching
/// the original implementation.
pub fn is_vfio(vf_pci: &str) -> bool {
    let driver_link = Path::new(SYS_BUS_PCI).join(vf_pci).join("driver");
    match sysfs::read_link_basename(&driver_link) {
        Ok(driver) => driver == VFIO_PCI_DRIVER,
        Err(_) => false,
    }
}

/// The PF's currently bound driver name, used by the driver-rebind step to
/// know which driver to bind the VF back to.
pub fn pf_driver(pf_name: &str) -> Result<String, ProbeError> {
    let driver_link = Path::new(SYS_CLASS_NET)
        .join(pf_name)
        .join("device")
        .join("driver");
    sysfs::read_link_basename(&driver_link).context(io_ctx(&driver_link))
}

/// List the RDMA device names associated with a VF's PCI address, by
/// scanning `/sys/class/infiniband/*/device` and comparing the resolved
/// symlink's basename. Equivalent to the Go source's
/// `rdmamap.GetRdmaDevicesForPcidev`, which is itself plain sysfs, not
/// netlink.
pub fn rdma_devices_for_pci(vf_pci: &str) -> Result<Vec<String>, ProbeError> {
    let class_dir = Path::new("/sys/class/infiniband");
    let entries = match sysfs::list_dir_entries(class_dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(source) => return Err(source).context(io_ctx(class_dir)),
    };

    let mut matches = Vec::new();
    for name in entries {
        let device_link = class_dir.join(&name).join("device");
        if let Ok(target) = sysfs::read_link_basename(&device_link) {
            if target == vf_pci {
                matches.push(name);
            }
        }
    }
    matches.sort();
    Ok(matches)
}

/// sysfs path to a PCI device directory, exposed for the driver-rebind
/// step and RDMA mode query which both write/read raw files directly.
pub fn pci_device_dir(pci_address: &str) -> PathBuf {
    Path::new(SYS_BUS_PCI).join(pci_address)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::os::unix::fs::symlink;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct FakeSysfs {
        root: PathBuf,
    }

    impl FakeSysfs {
        fn new() -> FakeSysfs {
            static COUNTER: AtomicU32 = AtomicU32::new(0);
            let n = COUNTER.fetch_add(1, Ordering::Relaxed);
            let root = std::env::temp_dir().join(format!(
                "ib-sriov-probe-test-{}-{}",
                std::process::id(),
                n
            ));
            let _ = fs::remove_dir_all(&root);
            fs::create_dir_all(&root).unwrap();
            FakeSysfs { root }
        }
    }

    impl Drop for FakeSysfs {
        fn drop(&mut self) {
            let _ = fs::remove_dir_all(&self.root);
        }
    }

    // probe.rs hardcodes absolute sysfs paths (matching the real kernel
    // layout exactly, per spec §4.4), so these tests exercise the
    // dir-scanning helpers from `sysfs` directly against a synthetic tree
    // rather than redirecting probe's own constants.

    #[test]
    fn single_dir_entry_finds_pf_name() {
        let fake = FakeSysfs::new();
        let net_dir = fake.root.join("physfn").join("net");
        fs::create_dir_all(&net_dir).unwrap();
        fs::write(net_dir.join("ib0"), "").unwrap();
        assert_eq!(sysfs::single_dir_entry(&net_dir).unwrap(), "ib0");
    }

    #[test]
    fn virtfn_scan_matches_pci_address() {
        let fake = FakeSysfs::new();
        let device_dir = fake.root.join("device");
        fs::create_dir_all(&device_dir).unwrap();
        fs::write(device_dir.join("sriov_numvfs"), "2\n").unwrap();
        symlink("../../devices/pci0000:00/0000:af:00.0", device_dir.join("virtfn0")).unwrap();
        symlink("../../devices/pci0000:00/0000:af:06.0", device_dir.join("virtfn1")).unwrap();

        let num_vfs: u32 = sysfs::parse_value(&device_dir, "sriov_numvfs").unwrap();
        assert_eq!(num_vfs, 2);

        let mut found = None;
        for i in 0..num_vfs {
            let target =
                sysfs::read_link_basename(&device_dir.join(format!("virtfn{}", i))).unwrap();
            if target == "0000:af:06.0" {
                found = Some(i);
            }
        }
        assert_eq!(found, Some(1));
    }

    #[test]
    fn rdma_devices_for_pci_returns_empty_when_class_dir_absent() {
        // /sys/class/infiniband is not expected to exist on a non-IB host;
        // the real function treats that as "no RDMA devices", not an error.
        let result = rdma_devices_for_pci("0000:00:00.0-definitely-not-present");
        assert!(result.is_ok());
    }
}
