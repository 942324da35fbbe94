//! Netlink abstractions used by the VF manager (spec §9: the engine talks
//! to the kernel only through the [`NetlinkOps`] trait, so tests can swap
//! in an in-memory fake instead of touching real kernel state).

mod rtnl;
pub mod wire;

pub use rtnl::RealNetlink;

/// The three states `IFLA_VF_LINK_STATE` accepts, mirroring
/// `struct ifla_vf_link_state`'s `IFLA_VF_LINK_STATE_{AUTO,ENABLE,DISABLE}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VfLinkState {
    Auto,
    Enable,
    Disable,
}

/// VF policy knobs the engine sets/resets, grouped as they are applied in
/// a single `RTM_SETLINK` carrying a nested `IFLA_VF_INFO`.
#[derive(Debug, Clone, Default)]
pub struct VfConfig {
    pub link_state: Option<VfLinkState>,
    pub node_guid: Option<[u8; 8]>,
    pub port_guid: Option<[u8; 8]>,
    pub spoofchk: Option<bool>,
    pub trust: Option<bool>,
    pub min_tx_rate: Option<u32>,
}

use crate::error::NetlinkError;

/// Everything the VF manager needs from rtnetlink, abstracted so unit
/// tests can substitute an in-memory fake (spec §9).
pub trait NetlinkOps {
    /// Resolve a netdev name to its kernel ifindex.
    fn link_index(&self, name: &str) -> Result<u32, NetlinkError>;

    /// Bring a link up or down.
    fn set_link_up(&self, ifindex: u32, up: bool) -> Result<(), NetlinkError>;

    /// Rename a link.
    fn rename_link(&self, ifindex: u32, new_name: &str) -> Result<(), NetlinkError>;

    /// Move a link into the network namespace identified by an open fd.
    fn move_to_netns(&self, ifindex: u32, netns_fd: i32) -> Result<(), NetlinkError>;

    /// Apply VF policy attributes to the given VF index on its PF link.
    fn set_vf_config(
        &self,
        pf_ifindex: u32,
        vf_index: u32,
        config: &VfConfig,
    ) -> Result<(), NetlinkError>;

    /// Read a link's hardware address (`IFLA_ADDRESS`), used to extract a
    /// pre-existing GUID from a 20-byte IPoIB address (spec §4.2/§9).
    fn link_hwaddr(&self, name: &str) -> Result<Vec<u8>, NetlinkError>;

    /// Remove an alternate-name alias equal to `name`, freeing it for reuse
    /// by a subsequent rename (spec §4.2 step 4, GLOSSARY "Alt name"). Best
    /// effort: kernels without `RTM_DELLINKPROP` support (pre-5.x) simply
    /// have no alt names to remove, so callers should not treat failure
    /// here as fatal.
    fn remove_alt_name(&self, ifindex: u32, name: &str) -> Result<(), NetlinkError>;
}

#[cfg(test)]
pub mod fake {
    use super::*;
    use std::cell::RefCell;
    use std::collections::HashMap;

    /// In-memory [`NetlinkOps`] fake: tracks link names/state and the last
    /// VF config applied per `(pf_ifindex, vf_index)`, with no real syscalls.
    #[derive(Default)]
    pub struct FakeNetlink {
        pub links: RefCell<HashMap<String, u32>>,
        pub up: RefCell<HashMap<u32, bool>>,
        pub vf_configs: RefCell<HashMap<(u32, u32), VfConfig>>,
        pub hwaddrs: RefCell<HashMap<String, Vec<u8>>>,
        pub alt_names_removed: RefCell<Vec<String>>,
        pub fail_next: RefCell<Option<String>>,
    }

    impl FakeNetlink {
        pub fn with_link(name: &str, ifindex: u32) -> FakeNetlink {
            let fake = FakeNetlink::default();
            fake.links.borrow_mut().insert(name.to_string(), ifindex);
            fake
        }

        pub fn set_hwaddr(&self, name: &str, hwaddr: Vec<u8>) {
            self.hwaddrs.borrow_mut().insert(name.to_string(), hwaddr);
        }

        fn maybe_fail(&self) -> Result<(), NetlinkError> {
            if let Some(reason) = self.fail_next.borrow_mut().take() {
                return crate::error::OperationSnafu {
                    op: "fake",
                    name: "fake",
                    reason,
                }
                .fail();
            }
            Ok(())
        }
    }

    impl NetlinkOps for FakeNetlink {
        fn link_index(&self, name: &str) -> Result<u32, NetlinkError> {
            self.maybe_fail()?;
            self.links.borrow().get(name).copied().ok_or_else(|| {
                crate::error::LinkLookupSnafu {
                    name: name.to_string(),
                    reason: "no such link".to_string(),
                }
                .build()
            })
        }

        fn set_link_up(&self, ifindex: u32, up: bool) -> Result<(), NetlinkError> {
            self.maybe_fail()?;
            self.up.borrow_mut().insert(ifindex, up);
            Ok(())
        }

        fn rename_link(&self, ifindex: u32, new_name: &str) -> Result<(), NetlinkError> {
            self.maybe_fail()?;
            let mut links = self.links.borrow_mut();
            if let Some((old_name, _)) = links.iter().find(|(_, v)| **v == ifindex) {
                let old_name = old_name.clone();
                links.remove(&old_name);
            }
            links.insert(new_name.to_string(), ifindex);
            Ok(())
        }

        fn move_to_netns(&self, _ifindex: u32, _netns_fd: i32) -> Result<(), NetlinkError> {
            self.maybe_fail()
        }

        fn set_vf_config(
            &self,
            pf_ifindex: u32,
            vf_index: u32,
            config: &VfConfig,
        ) -> Result<(), NetlinkError> {
            self.maybe_fail()?;
            self.vf_configs
                .borrow_mut()
                .insert((pf_ifindex, vf_index), config.clone());
            Ok(())
        }

        fn link_hwaddr(&self, name: &str) -> Result<Vec<u8>, NetlinkError> {
            self.maybe_fail()?;
            self.hwaddrs.borrow().get(name).cloned().ok_or_else(|| {
                crate::error::LinkLookupSnafu {
                    name: name.to_string(),
                    reason: "no hwaddr recorded".to_string(),
                }
                .build()
            })
        }

        fn remove_alt_name(&self, _ifindex: u32, name: &str) -> Result<(), NetlinkError> {
            self.maybe_fail()?;
            self.alt_names_removed.borrow_mut().push(name.to_string());
            Ok(())
        }
    }

    #[test]
    fn rename_updates_name_keeping_ifindex() {
        let fake = FakeNetlink::with_link("ib0", 7);
        fake.rename_link(7, "ib0v0").unwrap();
        assert_eq!(fake.link_index("ib0v0").unwrap(), 7);
        assert!(fake.link_index("ib0").is_err());
    }

    #[test]
    fn set_vf_config_records_last_write() {
        let fake = FakeNetlink::default();
        let config = VfConfig {
            spoofchk: Some(true),
            trust: Some(false),
            min_tx_rate: Some(0),
            ..Default::default()
        };
        fake.set_vf_config(3, 1, &config).unwrap();
        let recorded = fake.vf_configs.borrow();
        let applied = recorded.get(&(3, 1)).unwrap();
        assert_eq!(applied.spoofchk, Some(true));
        assert_eq!(applied.trust, Some(false));
    }

    #[test]
    fn injected_failure_surfaces_as_netlink_error() {
        let fake = FakeNetlink::default();
        *fake.fail_next.borrow_mut() = Some("EBUSY".to_string());
        assert!(fake.link_index("anything").is_err());
    }
}
