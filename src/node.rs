// Member types for the cluster view
//
// A `Member` is one row of the local membership table: identity, network
// address, opaque metadata, lifecycle state and the incarnation number used
// to order contradictory rumors about the node.

use serde::{Deserialize, Serialize};
use std::net::{IpAddr, SocketAddr};
use std::time::Instant;

/// Incarnation number for the suspicion/refutation mechanism.
///
/// Monotonically increasing per node; only the subject node may increment
/// its own.
pub type Incarnation = u32;

/// Six-byte protocol version tuple: `[pmin, pmax, pcur, dmin, dmax, dcur]`.
pub type VersionTuple = [u8; 6];

/// Member state in the cluster
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Hash)]
pub enum MemberState {
    /// Member is alive and healthy
    Alive,
    /// Member is suspected of failure and has time to refute
    Suspect,
    /// Member is confirmed dead (failed or left voluntarily)
    Dead,
}

/// Member information
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Member {
    /// Unique member name
    pub name: String,
    /// Network address
    pub addr: IpAddr,
    /// Gossip port (UDP and TCP)
    pub port: u16,
    /// Opaque user metadata, bounded by `META_MAX_SIZE`
    pub meta: Vec<u8>,
    /// Current state
    pub state: MemberState,
    /// Incarnation number
    pub incarnation: Incarnation,
    /// Protocol version tuple advertised by the node
    pub vsn: VersionTuple,
    /// When the state last changed
    #[serde(skip, default = "Instant::now")]
    pub state_change: Instant,
}

impl Member {
    pub fn new(
        name: String,
        addr: IpAddr,
        port: u16,
        meta: Vec<u8>,
        incarnation: Incarnation,
        vsn: VersionTuple,
    ) -> Self {
        Self {
            name,
            addr,
            port,
            meta,
            state: MemberState::Alive,
            incarnation,
            vsn,
            state_change: Instant::now(),
        }
    }

    /// Full socket address of the member's gossip endpoint
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.addr, self.port)
    }

    /// Check if the member counts toward the live cluster (alive or suspect)
    pub fn is_active(&self) -> bool {
        matches!(self.state, MemberState::Alive | MemberState::Suspect)
    }

    pub fn is_dead(&self) -> bool {
        self.state == MemberState::Dead
    }
}
