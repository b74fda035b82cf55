// Wire protocol surface
//
// Every gossip message is a one-byte kind tag followed by a bincode body.
// Bodies stick to primitive fields (IP bytes + port, never SocketAddr) so
// the encoding is stable across platforms. Compound, compression, CRC and
// encryption wrappers are layered around these by the codec.

pub mod codec;
pub mod transport;

use crate::error::{MeshError, Result};
use crate::node::{Incarnation, MemberState, VersionTuple};
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

/// One-byte message kind tags
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageKind {
    Ping = 0,
    IndirectPing = 1,
    AckResp = 2,
    Suspect = 3,
    Alive = 4,
    Dead = 5,
    User = 6,
    Compound = 7,
    Compress = 8,
    NackResp = 9,
    PushPull = 10,
    HasCrc = 11,
    Encrypted = 12,
}

impl MessageKind {
    pub fn from_u8(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(Self::Ping),
            1 => Some(Self::IndirectPing),
            2 => Some(Self::AckResp),
            3 => Some(Self::Suspect),
            4 => Some(Self::Alive),
            5 => Some(Self::Dead),
            6 => Some(Self::User),
            7 => Some(Self::Compound),
            8 => Some(Self::Compress),
            9 => Some(Self::NackResp),
            10 => Some(Self::PushPull),
            11 => Some(Self::HasCrc),
            12 => Some(Self::Encrypted),
            _ => None,
        }
    }
}

/// Direct probe
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Ping {
    pub seq_num: u32,
    /// Target node name; receivers drop pings addressed to someone else
    pub node: String,
}

/// Ask a peer to probe `node` on our behalf
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IndirectPing {
    pub seq_num: u32,
    pub node: String,
    pub addr: Vec<u8>,
    pub port: u16,
    /// Requester wants a nack if the relay cannot reach the target
    pub nack: bool,
}

/// Probe acknowledgment, carries the original sequence number
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AckResp {
    pub seq_num: u32,
    pub payload: Vec<u8>,
}

/// Negative ack from an indirect-probe relay that could not reach the target
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NackResp {
    pub seq_num: u32,
}

/// Rumor: `node` is suspected dead, asserted by `from`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Suspect {
    pub incarnation: Incarnation,
    pub node: String,
    pub from: String,
}

/// Rumor: `node` is alive at the given incarnation and address
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Alive {
    pub incarnation: Incarnation,
    pub node: String,
    pub addr: Vec<u8>,
    pub port: u16,
    pub meta: Vec<u8>,
    pub vsn: VersionTuple,
}

/// Rumor: `node` is dead, asserted by `from`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Dead {
    pub incarnation: Incarnation,
    pub node: String,
    pub from: String,
}

/// Header of a push/pull stream exchange
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PushPullHeader {
    pub nodes: u32,
    pub user_state_len: u32,
    pub join: bool,
}

/// One membership record in a push/pull exchange
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PushNodeState {
    pub name: String,
    pub addr: Vec<u8>,
    pub port: u16,
    pub meta: Vec<u8>,
    pub incarnation: Incarnation,
    pub state: MemberState,
    pub vsn: VersionTuple,
}

pub fn ip_to_bytes(addr: IpAddr) -> Vec<u8> {
    match addr {
        IpAddr::V4(ip) => ip.octets().to_vec(),
        IpAddr::V6(ip) => ip.octets().to_vec(),
    }
}

pub fn bytes_to_ip(bytes: &[u8]) -> Result<IpAddr> {
    match bytes.len() {
        4 => {
            let octets: [u8; 4] = bytes.try_into().expect("length checked");
            Ok(IpAddr::V4(Ipv4Addr::from(octets)))
        }
        16 => {
            let octets: [u8; 16] = bytes.try_into().expect("length checked");
            Ok(IpAddr::V6(Ipv6Addr::from(octets)))
        }
        n => Err(MeshError::Serialization(format!(
            "invalid address length {}, expected 4 or 16",
            n
        ))),
    }
}
