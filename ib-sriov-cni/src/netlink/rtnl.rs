//! `RealNetlink`: [`super::NetlinkOps`] implemented against a raw
//! `NETLINK_ROUTE` socket via `netlink-sys`, using the hand-rolled wire
//! encoding in [`super::wire`] for the attributes that have no typed
//! wrapper crate (`IFLA_VFINFO_LIST`, `IFLA_VF_IB_NODE_GUID`,
//! `IFLA_VF_IB_PORT_GUID`).

use super::wire::{self, NlaBuilder};
use super::{NetlinkOps, VfConfig, VfLinkState};
use crate::error::{LinkLookupSnafu, NetlinkError, OperationSnafu};
use netlink_sys::{protocols::NETLINK_ROUTE, Socket, SocketAddr};
use snafu::ResultExt;
use std::cell::Cell;

const RTM_GETLINK: u16 = 18;
const RTM_SETLINK: u16 = 19;
const RTM_DELLINKPROP: u16 = 109;

const IFLA_ADDRESS: u16 = 1;
const IFLA_IFNAME: u16 = 3;
const IFLA_NET_NS_FD: u16 = 28;
const IFLA_PROP_LIST: u16 = 52;
const IFLA_ALT_IFNAME: u16 = 53;
const IFLA_VFINFO_LIST: u16 = 22;
const IFLA_VF_INFO: u16 = 1;
const IFLA_VF_LINK_STATE: u16 = 5;
const IFLA_VF_SPOOFCHK: u16 = 4;
const IFLA_VF_TRUST: u16 = 9;
const IFLA_VF_RATE: u16 = 6;
const IFLA_VF_IB_NODE_GUID: u16 = 10;
const IFLA_VF_IB_PORT_GUID: u16 = 11;

const IFF_UP: u32 = 0x1;

/// `struct ifinfomsg` is 16 bytes: family(1) + pad(1) + type(2) + index(4)
/// + flags(4) + change(4).
fn ifinfomsg(ifindex: i32, flags: u32, change: u32) -> Vec<u8> {
    let mut buf = Vec::with_capacity(16);
    buf.push(libc::AF_UNSPEC as u8);
    buf.push(0);
    buf.extend_from_slice(&0u16.to_ne_bytes());
    buf.extend_from_slice(&ifindex.to_ne_bytes());
    buf.extend_from_slice(&flags.to_ne_bytes());
    buf.extend_from_slice(&change.to_ne_bytes());
    buf
}

/// `struct ifla_vf_link_state { __u32 vf; __u32 link_state; }`.
fn vf_link_state_payload(vf_index: u32, state: VfLinkState) -> [u8; 8] {
    let state_val: u32 = match state {
        VfLinkState::Auto => 0,
        VfLinkState::Enable => 1,
        VfLinkState::Disable => 2,
    };
    let mut buf = [0u8; 8];
    buf[0..4].copy_from_slice(&vf_index.to_ne_bytes());
    buf[4..8].copy_from_slice(&state_val.to_ne_bytes());
    buf
}

/// `struct ifla_vf_rate { __u32 vf; __u32 min_tx_rate; __u32 max_tx_rate; }`.
fn vf_rate_payload(vf_index: u32, min_tx_rate: u32) -> [u8; 12] {
    let mut buf = [0u8; 12];
    buf[0..4].copy_from_slice(&vf_index.to_ne_bytes());
    buf[4..8].copy_from_slice(&min_tx_rate.to_ne_bytes());
    // max_tx_rate left at 0 (unlimited)
    buf
}

/// `struct ifla_vf_spoofchk`/`ifla_vf_trust { __u32 vf; __u32 setting; }`.
fn vf_flag_payload(vf_index: u32, setting: bool) -> [u8; 8] {
    let mut buf = [0u8; 8];
    buf[0..4].copy_from_slice(&vf_index.to_ne_bytes());
    buf[4..8].copy_from_slice(&(setting as u32).to_ne_bytes());
    buf
}

pub struct RealNetlink {
    seq: Cell<u32>,
}

impl RealNetlink {
    pub fn new() -> RealNetlink {
        RealNetlink { seq: Cell::new(1) }
    }

    fn next_seq(&self) -> u32 {
        let seq = self.seq.get();
        self.seq.set(seq.wrapping_add(1));
        seq
    }

    /// Send a single request and collect the kernel's reply messages,
    /// surfacing an `NLMSG_ERROR` payload as `Err`.
    fn transact(&self, payload: Vec<u8>) -> Result<Vec<(u16, Vec<u8>)>, String> {
        let mut socket = Socket::new(NETLINK_ROUTE).map_err(|e| e.to_string())?;
        socket
            .bind(&SocketAddr::new(0, 0))
            .map_err(|e| e.to_string())?;
        socket
            .connect(&SocketAddr::new(0, 0))
            .map_err(|e| e.to_string())?;
        socket.send(&payload, 0).map_err(|e| e.to_string())?;

        let mut reply = vec![0u8; 32 * 1024];
        let n = socket.recv(&mut reply, 0).map_err(|e| e.to_string())?;
        wire::parse_response(&reply[..n]).map_err(|errno| format!("errno {}", errno))
    }

    fn request(
        &self,
        msg_type: u16,
        flags: u16,
        body: Vec<u8>,
        op: &str,
        name: &str,
    ) -> Result<Vec<(u16, Vec<u8>)>, NetlinkError> {
        let seq = self.next_seq();
        let msg = wire::build_message(msg_type, flags, seq, &body);
        self.transact(msg).map_err(|reason| {
            OperationSnafu {
                op: op.to_string(),
                name: name.to_string(),
                reason,
            }
            .build()
        })
    }
}

impl RealNetlink {
    /// `RTM_GETLINK` by name, returning the raw `ifinfomsg` + attributes
    /// payload so callers can pull out whichever attribute they need
    /// (ifindex from the fixed header, `IFLA_ADDRESS` from the TLVs).
    fn get_link(&self, name: &str) -> Result<Vec<u8>, NetlinkError> {
        let mut body = ifinfomsg(0, 0, 0);
        let mut nla = NlaBuilder::new();
        nla.push_str(IFLA_IFNAME, name);
        body.extend_from_slice(&nla.into_bytes());

        let replies = self.request(RTM_GETLINK, wire::NLM_F_REQUEST, body, "GETLINK", name)?;
        let (_, payload) = replies.into_iter().next().ok_or_else(|| {
            LinkLookupSnafu {
                name: name.to_string(),
                reason: "empty reply".to_string(),
            }
            .build()
        })?;
        if payload.len() < 16 {
            return LinkLookupSnafu {
                name: name.to_string(),
                reason: "short ifinfomsg".to_string(),
            }
            .fail();
        }
        Ok(payload)
    }
}

impl NetlinkOps for RealNetlink {
    fn link_index(&self, name: &str) -> Result<u32, NetlinkError> {
        let payload = self.get_link(name)?;
        let ifindex = i32::from_ne_bytes([payload[4], payload[5], payload[6], payload[7]]);
        Ok(ifindex as u32)
    }

    fn set_link_up(&self, ifindex: u32, up: bool) -> Result<(), NetlinkError> {
        let flags = if up { IFF_UP } else { 0 };
        let body = ifinfomsg(ifindex as i32, flags, IFF_UP);
        self.request(
            RTM_SETLINK,
            wire::NLM_F_REQUEST | wire::NLM_F_ACK,
            body,
            "SETLINK(up)",
            &ifindex.to_string(),
        )?;
        Ok(())
    }

    fn rename_link(&self, ifindex: u32, new_name: &str) -> Result<(), NetlinkError> {
        let mut body = ifinfomsg(ifindex as i32, 0, 0);
        let mut nla = NlaBuilder::new();
        nla.push_str(IFLA_IFNAME, new_name);
        body.extend_from_slice(&nla.into_bytes());
        self.request(
            RTM_SETLINK,
            wire::NLM_F_REQUEST | wire::NLM_F_ACK,
            body,
            "SETLINK(rename)",
            new_name,
        )?;
        Ok(())
    }

    fn move_to_netns(&self, ifindex: u32, netns_fd: i32) -> Result<(), NetlinkError> {
        let mut body = ifinfomsg(ifindex as i32, 0, 0);
        let mut nla = NlaBuilder::new();
        nla.push_u32(IFLA_NET_NS_FD, netns_fd as u32);
        body.extend_from_slice(&nla.into_bytes());
        self.request(
            RTM_SETLINK,
            wire::NLM_F_REQUEST | wire::NLM_F_ACK,
            body,
            "SETLINK(netns)",
            &ifindex.to_string(),
        )?;
        Ok(())
    }

    fn set_vf_config(
        &self,
        pf_ifindex: u32,
        vf_index: u32,
        config: &VfConfig,
    ) -> Result<(), NetlinkError> {
        let mut body = ifinfomsg(pf_ifindex as i32, 0, 0);
        let mut top = NlaBuilder::new();
        top.push_nested(IFLA_VFINFO_LIST, |list| {
            list.push_nested(IFLA_VF_INFO, |info| {
                if let Some(state) = config.link_state {
                    info.push_bytes(IFLA_VF_LINK_STATE, &vf_link_state_payload(vf_index, state));
                }
                if let Some(spoofchk) = config.spoofchk {
                    info.push_bytes(IFLA_VF_SPOOFCHK, &vf_flag_payload(vf_index, spoofchk));
                }
                if let Some(trust) = config.trust {
                    info.push_bytes(IFLA_VF_TRUST, &vf_flag_payload(vf_index, trust));
                }
                if let Some(rate) = config.min_tx_rate {
                    info.push_bytes(IFLA_VF_RATE, &vf_rate_payload(vf_index, rate));
                }
                if let Some(guid) = config.node_guid {
                    info.push_bytes(IFLA_VF_IB_NODE_GUID, &wire::encode_vf_guid(vf_index, &guid));
                }
                if let Some(guid) = config.port_guid {
                    info.push_bytes(IFLA_VF_IB_PORT_GUID, &wire::encode_vf_guid(vf_index, &guid));
                }
            });
        });
        body.extend_from_slice(&top.into_bytes());

        self.request(
            RTM_SETLINK,
            wire::NLM_F_REQUEST | wire::NLM_F_ACK,
            body,
            "SETLINK(vf)",
            &format!("vf{} on ifindex {}", vf_index, pf_ifindex),
        )?;
        Ok(())
    }

    fn link_hwaddr(&self, name: &str) -> Result<Vec<u8>, NetlinkError> {
        let payload = self.get_link(name)?;
        wire::parse_nlas(&payload[16..])
            .into_iter()
            .find(|nla| nla.attr_type == IFLA_ADDRESS)
            .map(|nla| nla.value.to_vec())
            .ok_or_else(|| {
                LinkLookupSnafu {
                    name: name.to_string(),
                    reason: "no IFLA_ADDRESS attribute in reply".to_string(),
                }
                .build()
            })
    }

    fn remove_alt_name(&self, ifindex: u32, name: &str) -> Result<(), NetlinkError> {
        let mut body = ifinfomsg(ifindex as i32, 0, 0);
        let mut top = NlaBuilder::new();
        top.push_nested(IFLA_PROP_LIST, |list| {
            list.push_str(IFLA_ALT_IFNAME, name);
        });
        body.extend_from_slice(&top.into_bytes());

        self.request(
            RTM_DELLINKPROP,
            wire::NLM_F_REQUEST | wire::NLM_F_ACK,
            body,
            "DELLINKPROP(altname)",
            name,
        )?;
        Ok(())
    }
}
