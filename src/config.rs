// Membership configuration
//
// All tunables for the gossip protocol in one struct, with conservative
// LAN defaults and a `local()` preset with tightened timers for
// single-machine clusters.

use crate::delegate::{Delegate, EventDelegate};
use crate::error::{MeshError, Result};
use crate::node::VersionTuple;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

/// Lowest protocol version this implementation can speak
pub const PROTOCOL_VERSION_MIN: u8 = 0;
/// Highest protocol version this implementation can speak
pub const PROTOCOL_VERSION_MAX: u8 = 2;

/// Maximum size of the opaque per-node metadata blob
pub const META_MAX_SIZE: usize = 512;

/// Required length of the shared symmetric key
pub const SECRET_KEY_LEN: usize = 16;

/// Membership configuration
#[derive(Clone)]
pub struct MembershipConfig {
    /// Unique node name within the cluster
    pub name: String,

    /// Address to bind the UDP and TCP listeners to
    pub bind_addr: IpAddr,

    /// Port for both listeners; 0 picks an ephemeral port
    pub bind_port: u16,

    /// Address advertised to peers; defaults to the bind address
    pub advertise_addr: Option<IpAddr>,

    /// Port advertised to peers; defaults to the bind port
    pub advertise_port: Option<u16>,

    /// Active protocol version, within
    /// `[PROTOCOL_VERSION_MIN, PROTOCOL_VERSION_MAX]`
    pub protocol_version: u8,

    /// Shared symmetric key; absent or exactly 16 bytes.
    /// Requires `protocol_version >= 1`.
    pub secret_key: Option<Vec<u8>>,

    /// Interval between failure-detector probes
    pub probe_interval: Duration,

    /// Deadline for a direct probe ack; must be below `probe_interval`
    pub probe_timeout: Duration,

    /// Number of peers asked to probe indirectly on direct-probe timeout
    pub indirect_checks: usize,

    /// Retransmit multiplier for the broadcast queue limit
    pub retransmit_mult: u32,

    /// Suspicion multiplier for the suspect-to-dead timeout
    pub suspicion_mult: u32,

    /// Interval between anti-entropy push/pull exchanges
    pub push_pull_interval: Duration,

    /// Interval between gossip datagrams
    pub gossip_interval: Duration,

    /// Number of random peers gossiped to per interval
    pub gossip_nodes: usize,

    /// How long dead nodes keep receiving gossip and stay in the table
    pub gossip_to_the_dead_time: Duration,

    /// Compress gossip payloads; requires `protocol_version >= 1`
    pub enable_compression: bool,

    /// Probe nodes in suspect state as well as alive ones
    pub probe_suspect_nodes: bool,

    /// Deadline for a full push/pull stream exchange
    pub tcp_timeout: Duration,

    /// Upper bound for the awareness multiplier applied to probe deadlines
    pub awareness_max_multiplier: u8,

    /// User callback surface; `None` disables user gossip and metadata
    pub delegate: Option<Arc<dyn Delegate>>,

    /// Membership change notifications
    pub events: Option<Arc<dyn EventDelegate>>,

    /// Delegate protocol version tuple advertised in the `vsn` field
    pub delegate_protocol_min: u8,
    pub delegate_protocol_max: u8,
    pub delegate_protocol_version: u8,
}

impl MembershipConfig {
    /// LAN defaults: the timings the protocol was tuned for on a local
    /// network (probe every second, gossip every 200ms, push/pull every 30s)
    pub fn lan() -> Self {
        Self {
            name: format!("node-{}", uuid::Uuid::new_v4()),
            bind_addr: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            bind_port: 7946,
            advertise_addr: None,
            advertise_port: None,
            protocol_version: PROTOCOL_VERSION_MAX,
            secret_key: None,
            probe_interval: Duration::from_secs(1),
            probe_timeout: Duration::from_millis(500),
            indirect_checks: 3,
            retransmit_mult: 4,
            suspicion_mult: 5,
            push_pull_interval: Duration::from_secs(30),
            gossip_interval: Duration::from_millis(200),
            gossip_nodes: 3,
            gossip_to_the_dead_time: Duration::from_secs(30),
            enable_compression: true,
            probe_suspect_nodes: true,
            tcp_timeout: Duration::from_secs(10),
            awareness_max_multiplier: 8,
            delegate: None,
            events: None,
            delegate_protocol_min: 0,
            delegate_protocol_max: 0,
            delegate_protocol_version: 0,
        }
    }

    /// Loopback preset: aggressive timers for clusters confined to one
    /// machine, mostly useful in tests and demos
    pub fn local() -> Self {
        Self {
            bind_addr: IpAddr::V4(Ipv4Addr::LOCALHOST),
            probe_interval: Duration::from_millis(200),
            probe_timeout: Duration::from_millis(50),
            push_pull_interval: Duration::from_secs(5),
            gossip_interval: Duration::from_millis(50),
            gossip_to_the_dead_time: Duration::from_secs(5),
            tcp_timeout: Duration::from_secs(2),
            ..Self::lan()
        }
    }

    /// Protocol version tuple sent in alive messages and push/pull records
    pub fn version_tuple(&self) -> VersionTuple {
        [
            PROTOCOL_VERSION_MIN,
            PROTOCOL_VERSION_MAX,
            self.protocol_version,
            self.delegate_protocol_min,
            self.delegate_protocol_max,
            self.delegate_protocol_version,
        ]
    }

    /// Validate the configuration before any listener is opened
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(MeshError::Config("node name must not be empty".to_string()));
        }

        if self.protocol_version < PROTOCOL_VERSION_MIN
            || self.protocol_version > PROTOCOL_VERSION_MAX
        {
            return Err(MeshError::Config(format!(
                "protocol version {} outside [{}, {}]",
                self.protocol_version, PROTOCOL_VERSION_MIN, PROTOCOL_VERSION_MAX
            )));
        }

        if let Some(key) = &self.secret_key {
            if key.len() != SECRET_KEY_LEN {
                return Err(MeshError::Config(format!(
                    "secret key must be exactly {} bytes, got {}",
                    SECRET_KEY_LEN,
                    key.len()
                )));
            }
            if self.protocol_version < 1 {
                return Err(MeshError::Config(
                    "encryption requires protocol version >= 1".to_string(),
                ));
            }
        }

        if self.probe_timeout >= self.probe_interval {
            return Err(MeshError::Config(
                "probe timeout must be below the probe interval".to_string(),
            ));
        }

        Ok(())
    }

    /// Advertised address as seen by peers
    pub fn advertise(&self, bound_port: u16) -> SocketAddr {
        let addr = self.advertise_addr.unwrap_or(match self.bind_addr {
            // No interface enumeration: an unspecified bind advertises
            // loopback unless an advertise address is set.
            IpAddr::V4(ip) if ip.is_unspecified() => IpAddr::V4(Ipv4Addr::LOCALHOST),
            IpAddr::V6(ip) if ip.is_unspecified() => IpAddr::V4(Ipv4Addr::LOCALHOST),
            other => other,
        });
        SocketAddr::new(addr, self.advertise_port.unwrap_or(bound_port))
    }
}

impl fmt::Debug for MembershipConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MembershipConfig")
            .field("name", &self.name)
            .field("bind_addr", &self.bind_addr)
            .field("bind_port", &self.bind_port)
            .field("protocol_version", &self.protocol_version)
            .field("encrypted", &self.secret_key.is_some())
            .field("probe_interval", &self.probe_interval)
            .field("probe_timeout", &self.probe_timeout)
            .field("indirect_checks", &self.indirect_checks)
            .field("retransmit_mult", &self.retransmit_mult)
            .field("suspicion_mult", &self.suspicion_mult)
            .field("push_pull_interval", &self.push_pull_interval)
            .field("gossip_interval", &self.gossip_interval)
            .field("gossip_nodes", &self.gossip_nodes)
            .finish_non_exhaustive()
    }
}

impl Default for MembershipConfig {
    fn default() -> Self {
        Self::lan()
    }
}

/// Resolve a seed address string, appending the default port and re-parsing
/// once when the first parse fails (e.g. `"10.0.0.1"` vs `"10.0.0.1:7946"`).
pub fn resolve_seed_addr(seed: &str, default_port: u16) -> Result<SocketAddr> {
    match seed.parse::<SocketAddr>() {
        Ok(addr) => Ok(addr),
        Err(_) => {
            let retry = format!("{}:{}", seed, default_port);
            retry.parse::<SocketAddr>().map_err(|e| {
                MeshError::Config(format!("invalid seed address '{}': {}", seed, e))
            })
        }
    }
}

/// True for addresses that are routable beyond the local network, used to
/// warn when gossip would leave the host unencrypted.
pub fn is_global_ip(addr: IpAddr) -> bool {
    match addr {
        IpAddr::V4(ip) => {
            !(ip.is_loopback()
                || ip.is_private()
                || ip.is_link_local()
                || ip.is_unspecified()
                || ip.is_broadcast())
        }
        IpAddr::V6(ip) => !(ip.is_loopback() || ip.is_unspecified()),
    }
}
