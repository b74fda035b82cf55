// Membership handle and scheduler
//
// `Membership` is the per-instance handle owning every resource: sockets,
// node table, broadcast queue, timers and the background loops. There is
// no global state; drop or shut down the handle and everything stops.
//
// Background loops (probe, gossip, push/pull, ack reaper, two listeners)
// are spawned at create with a random startup jitter and exit at their
// next suspension point when the shutdown signal fires.

use crate::awareness::Awareness;
use crate::broadcast::TransmitLimitedQueue;
use crate::config::{is_global_ip, resolve_seed_addr, MembershipConfig};
use crate::error::{MeshError, Result};
use crate::net::codec::{
    decode_body, encode_user_msg, parse_compound, PacketCodec, UDP_RECV_BUF_SIZE,
};
use crate::net::transport::Transport;
use crate::net::{AckResp, Alive, Dead, IndirectPing, MessageKind, NackResp, Ping, Suspect};
use crate::node::Member;
use crate::probe::AckHandler;
use crate::state::NodeTable;
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;

/// Shared protocol state, owned by the `Membership` handle and referenced
/// by every background loop.
pub(crate) struct MembershipCore {
    pub(crate) config: MembershipConfig,
    pub(crate) transport: Transport,
    pub(crate) codec: PacketCodec,
    pub(crate) advertise: SocketAddr,
    pub(crate) nodes: RwLock<NodeTable>,
    pub(crate) num_nodes: Arc<AtomicUsize>,
    pub(crate) suspicion_timers: Mutex<HashMap<String, JoinHandle<()>>>,
    pub(crate) ack_handlers: Mutex<HashMap<u32, AckHandler>>,
    pub(crate) broadcasts: TransmitLimitedQueue,
    pub(crate) awareness: Awareness,
    pub(crate) sequence_num: AtomicU32,
    pub(crate) incarnation: AtomicU32,
    pub(crate) leave_flag: AtomicBool,
    pub(crate) shutdown_flag: AtomicBool,
    pub(crate) shutdown_tx: watch::Sender<bool>,
    pub(crate) malformed: AtomicU64,
}

impl MembershipCore {
    /// Bind the listeners and assemble the core. Loops are spawned by the
    /// handle, not here, so tests can drive the state machine directly.
    pub(crate) async fn new(config: MembershipConfig) -> Result<Arc<Self>> {
        let transport = Transport::bind(config.bind_addr, config.bind_port).await?;
        let advertise = config.advertise(transport.bound_port());
        let codec = PacketCodec::new(config.secret_key.as_deref())?;

        let num_nodes = Arc::new(AtomicUsize::new(0));
        let counter = num_nodes.clone();
        let broadcasts = TransmitLimitedQueue::new(
            config.retransmit_mult,
            Arc::new(move || counter.load(Ordering::Relaxed)),
        );

        let (shutdown_tx, _) = watch::channel(false);
        let awareness = Awareness::new(config.awareness_max_multiplier);

        Ok(Arc::new(Self {
            config,
            transport,
            codec,
            advertise,
            nodes: RwLock::new(NodeTable::new()),
            num_nodes,
            suspicion_timers: Mutex::new(HashMap::new()),
            ack_handlers: Mutex::new(HashMap::new()),
            broadcasts,
            awareness,
            sequence_num: AtomicU32::new(0),
            incarnation: AtomicU32::new(0),
            leave_flag: AtomicBool::new(false),
            shutdown_flag: AtomicBool::new(false),
            shutdown_tx,
            malformed: AtomicU64::new(0),
        }))
    }

    pub(crate) fn is_shutdown(&self) -> bool {
        self.shutdown_flag.load(Ordering::SeqCst)
    }

    /// Decode and dispatch one inbound datagram.
    pub(crate) async fn ingest_packet(self: &Arc<Self>, buf: &[u8], from: SocketAddr) {
        let raw = match self.codec.open(buf) {
            Ok(raw) => raw,
            Err(e) => {
                self.note_malformed(&format!("undecodable datagram from {}: {}", from, e));
                return;
            }
        };
        self.handle_raw(raw, from).await;
    }

    async fn handle_raw(self: &Arc<Self>, raw: Bytes, from: SocketAddr) {
        let raw = match self.unwrap_compress(raw) {
            Some(raw) => raw,
            None => return,
        };

        if raw.first() == Some(&(MessageKind::Compound as u8)) {
            let (parts, truncated) = match parse_compound(&raw[1..]) {
                Ok(parsed) => parsed,
                Err(e) => {
                    self.note_malformed(&format!("bad compound from {}: {}", from, e));
                    return;
                }
            };
            for _ in 0..truncated {
                self.note_malformed("truncated compound part");
            }
            for part in parts {
                let Some(part) = self.unwrap_compress(part) else {
                    continue;
                };
                if part.first() == Some(&(MessageKind::Compound as u8)) {
                    self.note_malformed("nested compound message");
                    continue;
                }
                self.handle_message(part, from).await;
            }
        } else {
            self.handle_message(raw, from).await;
        }
    }

    /// Strip compression envelopes; malformed payloads are counted and
    /// dropped.
    fn unwrap_compress(&self, raw: Bytes) -> Option<Bytes> {
        let mut raw = raw;
        for _ in 0..2 {
            if raw.first() != Some(&(MessageKind::Compress as u8)) {
                return Some(raw);
            }
            match crate::net::codec::decompress_payload(&raw[1..]) {
                Ok(inflated) => raw = Bytes::from(inflated),
                Err(e) => {
                    self.note_malformed(&format!("bad compressed payload: {}", e));
                    return None;
                }
            }
        }
        self.note_malformed("compression nesting too deep");
        None
    }

    async fn handle_message(self: &Arc<Self>, msg: Bytes, from: SocketAddr) {
        let Some((&tag, body)) = msg.split_first() else {
            self.note_malformed("empty message");
            return;
        };
        let Some(kind) = MessageKind::from_u8(tag) else {
            self.note_malformed(&format!("unknown message tag {}", tag));
            return;
        };

        match kind {
            MessageKind::Ping => match decode_body::<Ping>(body) {
                Ok(ping) => self.handle_ping(ping, from).await,
                Err(e) => self.note_malformed(&format!("bad ping: {}", e)),
            },
            MessageKind::IndirectPing => match decode_body::<IndirectPing>(body) {
                Ok(indirect) => self.handle_indirect_ping(indirect, from),
                Err(e) => self.note_malformed(&format!("bad indirect ping: {}", e)),
            },
            MessageKind::AckResp => match decode_body::<AckResp>(body) {
                Ok(ack) => self.invoke_ack_handler(ack),
                Err(e) => self.note_malformed(&format!("bad ack: {}", e)),
            },
            MessageKind::NackResp => match decode_body::<NackResp>(body) {
                Ok(nack) => self.invoke_nack_handler(nack),
                Err(e) => self.note_malformed(&format!("bad nack: {}", e)),
            },
            MessageKind::Suspect => match decode_body::<Suspect>(body) {
                Ok(suspect) => self.suspect_node(suspect),
                Err(e) => self.note_malformed(&format!("bad suspect: {}", e)),
            },
            MessageKind::Alive => match decode_body::<Alive>(body) {
                Ok(alive) => self.alive_node(alive, false),
                Err(e) => self.note_malformed(&format!("bad alive: {}", e)),
            },
            MessageKind::Dead => match decode_body::<Dead>(body) {
                Ok(dead) => self.dead_node(dead, None),
                Err(e) => self.note_malformed(&format!("bad dead: {}", e)),
            },
            MessageKind::User => {
                if let Some(delegate) = &self.config.delegate {
                    delegate.notify_msg(body);
                }
            }
            other => {
                self.note_malformed(&format!("unexpected datagram kind {:?}", other));
            }
        }
    }
}

/// Cluster membership handle.
///
/// Created with [`Membership::create`], joined to a cluster with
/// [`Membership::join`], torn down with [`Membership::leave`] and
/// [`Membership::shutdown`].
pub struct Membership {
    core: Arc<MembershipCore>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    lifecycle: tokio::sync::Mutex<()>,
}

impl Membership {
    /// Validate the configuration, bind the listeners, register the local
    /// node and start the protocol loops.
    pub async fn create(mut config: MembershipConfig) -> Result<Membership> {
        config.validate()?;

        if config.enable_compression && config.protocol_version == 0 {
            tracing::warn!("compression requires protocol version >= 1, disabling");
            config.enable_compression = false;
        }

        let core = MembershipCore::new(config).await?;

        if is_global_ip(core.advertise.ip()) && core.config.secret_key.is_none() {
            tracing::warn!(
                addr = %core.advertise,
                "gossiping on a public address without encryption"
            );
        }

        core.set_alive()?;

        let membership = Membership {
            core,
            tasks: Mutex::new(Vec::new()),
            lifecycle: tokio::sync::Mutex::new(()),
        };
        membership.spawn_loops();

        tracing::info!(
            name = %membership.core.config.name,
            addr = %membership.core.advertise,
            "membership started"
        );
        Ok(membership)
    }

    fn spawn_loops(&self) {
        let mut tasks = self.tasks.lock();

        tasks.push(spawn_udp_listener(self.core.clone()));
        tasks.push(spawn_stream_listener(self.core.clone()));

        let probe_interval = self.core.config.probe_interval;
        tasks.push(spawn_periodic(self.core.clone(), probe_interval, |core| async move {
            core.probe_tick().await;
        }));

        let gossip_interval = self.core.config.gossip_interval;
        tasks.push(spawn_periodic(self.core.clone(), gossip_interval, |core| async move {
            core.gossip_tick().await;
        }));

        let push_pull_interval = self.core.config.push_pull_interval;
        tasks.push(spawn_periodic(
            self.core.clone(),
            push_pull_interval,
            |core| async move {
                core.push_pull_tick().await;
            },
        ));

        // Bounded reaper for ack handlers orphaned by cancelled probes
        tasks.push(spawn_periodic(self.core.clone(), probe_interval, |core| async move {
            core.reap_ack_handlers();
        }));
    }

    /// Best-effort push/pull with each seed. Returns how many seeds
    /// answered; errors only if none did.
    pub async fn join<S: AsRef<str>>(&self, seeds: &[S]) -> Result<usize> {
        if self.core.is_shutdown() {
            return Err(MeshError::Internal("join called after shutdown".to_string()));
        }

        let default_port = self.core.transport.bound_port();
        let mut successes = 0;
        let mut last_error = None;

        for seed in seeds {
            let seed = seed.as_ref();
            let addr = match resolve_seed_addr(seed, default_port) {
                Ok(addr) => addr,
                Err(e) => {
                    tracing::warn!(seed, "skipping unresolvable seed: {}", e);
                    last_error = Some(e);
                    continue;
                }
            };

            match self.core.push_pull_node(addr, true).await {
                Ok(()) => successes += 1,
                Err(e) => {
                    tracing::warn!(seed, "failed to join via seed: {}", e);
                    last_error = Some(e);
                }
            }
        }

        if successes == 0 {
            let cause = last_error
                .map(|e| e.to_string())
                .unwrap_or_else(|| "no seeds given".to_string());
            return Err(MeshError::Join(format!("unable to reach any seed: {}", cause)));
        }
        Ok(successes)
    }

    /// Snapshot of all members not known to be dead.
    pub fn members(&self) -> Vec<Member> {
        self.core.member_snapshot()
    }

    /// Number of members not known to be dead, without materializing the
    /// snapshot.
    pub fn num_members(&self) -> usize {
        self.core.active_member_count()
    }

    /// The local member record as currently advertised.
    pub fn local_member(&self) -> Member {
        self.core
            .nodes
            .read()
            .members
            .get(&self.core.config.name)
            .cloned()
            .expect("local node is always registered")
    }

    /// Address peers use to reach this node.
    pub fn advertise_addr(&self) -> SocketAddr {
        self.core.advertise
    }

    /// The currently active protocol version.
    pub fn protocol_version(&self) -> u8 {
        self.core.config.protocol_version
    }

    /// Broadcast a graceful departure and wait for it to be transmitted.
    ///
    /// Idempotent across repeated calls, but **panics** if invoked after
    /// [`Membership::shutdown`]: leaving a cluster the process is no longer
    /// part of is a programming error, not a runtime condition.
    ///
    /// The node keeps answering probes and gossip until shut down, so
    /// peers observe the departure as a death rumor rather than a timeout.
    pub async fn leave(&self, timeout: Duration) -> Result<()> {
        let _guard = self.lifecycle.lock().await;

        if self.core.is_shutdown() {
            panic!("leave called after shutdown");
        }
        if self.core.leave_flag.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let name = self.core.config.name.clone();
        let any_peers = {
            let table = self.core.nodes.read();
            table
                .members
                .values()
                .any(|m| m.name != name && !m.is_dead())
        };

        let (notify_tx, notify_rx) = oneshot::channel();
        let dead = Dead {
            incarnation: self.core.incarnation.load(Ordering::SeqCst),
            node: name.clone(),
            from: name,
        };
        self.core.dead_node(dead, Some(notify_tx));

        if !any_peers {
            return Ok(());
        }

        match tokio::time::timeout(timeout, notify_rx).await {
            Ok(_) => Ok(()),
            Err(_) => Err(MeshError::Timeout(
                "timed out waiting for leave broadcast to transmit".to_string(),
            )),
        }
    }

    /// Stop all protocol loops and close the listeners. Idempotent. Does
    /// not broadcast anything; peers detect the absence via probing.
    pub async fn shutdown(&self) -> Result<()> {
        let _guard = self.lifecycle.lock().await;

        if self.core.shutdown_flag.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        tracing::info!(name = %self.core.config.name, "membership shutting down");
        let _ = self.core.shutdown_tx.send(true);
        self.core.broadcasts.reset();

        for timer in self.core.suspicion_timers.lock().drain() {
            timer.1.abort();
        }
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        Ok(())
    }

    /// Send a raw user message as a single datagram; delivered to the
    /// remote delegate's `notify_msg`.
    pub async fn send_to(&self, addr: SocketAddr, msg: &[u8]) -> Result<()> {
        let raw = encode_user_msg(msg);
        self.core.send_raw(addr, raw).await
    }

    /// As [`Membership::send_to`], addressed by member record.
    pub async fn send_to_udp(&self, member: &Member, msg: &[u8]) -> Result<()> {
        self.send_to(member.socket_addr(), msg).await
    }
}

impl Drop for Membership {
    fn drop(&mut self) {
        let _ = self.core.shutdown_tx.send(true);
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }
}

fn spawn_udp_listener(core: Arc<MembershipCore>) -> JoinHandle<()> {
    let mut shutdown = core.shutdown_tx.subscribe();
    tokio::spawn(async move {
        let socket = core.transport.udp_socket();
        let mut buf = vec![0u8; UDP_RECV_BUF_SIZE];
        loop {
            tokio::select! {
                _ = shutdown.changed() => return,
                result = socket.recv_from(&mut buf) => match result {
                    Ok((len, from)) => core.ingest_packet(&buf[..len], from).await,
                    Err(e) => {
                        if core.is_shutdown() {
                            return;
                        }
                        tracing::warn!("UDP receive error: {}", e);
                    }
                },
            }
        }
    })
}

fn spawn_stream_listener(core: Arc<MembershipCore>) -> JoinHandle<()> {
    let mut shutdown = core.shutdown_tx.subscribe();
    tokio::spawn(async move {
        let listener = core.transport.take_listener();
        loop {
            tokio::select! {
                _ = shutdown.changed() => return,
                result = listener.accept() => match result {
                    Ok((stream, peer)) => {
                        let core = core.clone();
                        tokio::spawn(async move {
                            if let Err(e) = core.handle_stream(stream).await {
                                tracing::debug!(%peer, "stream handler error: {}", e);
                            }
                        });
                    }
                    Err(e) => {
                        if core.is_shutdown() {
                            return;
                        }
                        tracing::warn!("TCP accept error: {}", e);
                    }
                },
            }
        }
    })
}

/// Run a tick function on a fixed period, offset by a random startup
/// jitter so a fleet restarted together does not synchronize its traffic.
fn spawn_periodic<F, Fut>(
    core: Arc<MembershipCore>,
    period: Duration,
    tick: F,
) -> JoinHandle<()>
where
    F: Fn(Arc<MembershipCore>) -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send,
{
    let mut shutdown = core.shutdown_tx.subscribe();
    tokio::spawn(async move {
        let jitter = period.mul_f64(rand::random::<f64>());
        tokio::select! {
            _ = tokio::time::sleep(jitter) => {}
            _ = shutdown.changed() => return,
        }

        let mut ticker = tokio::time::interval(period);
        loop {
            tokio::select! {
                _ = ticker.tick() => tick(core.clone()).await,
                _ = shutdown.changed() => return,
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::MemberState;

    fn test_config(name: &str) -> MembershipConfig {
        let mut config = MembershipConfig::local();
        config.name = name.to_string();
        config.bind_port = 0;
        config
    }

    #[tokio::test]
    async fn test_create_registers_self() {
        let m = Membership::create(test_config("solo")).await.unwrap();
        assert_eq!(m.num_members(), 1);

        let local = m.local_member();
        assert_eq!(local.name, "solo");
        assert_eq!(local.state, MemberState::Alive);
        assert_eq!(local.incarnation, 0);
        assert_eq!(local.port, m.advertise_addr().port());

        m.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_create_rejects_bad_config() {
        let mut config = test_config("bad");
        config.protocol_version = 42;
        assert!(Membership::create(config).await.is_err());

        let mut config = test_config("bad-key");
        config.secret_key = Some(vec![1, 2, 3]);
        assert!(Membership::create(config).await.is_err());
    }

    #[tokio::test]
    async fn test_compression_disabled_on_protocol_zero() {
        let mut config = test_config("old");
        config.protocol_version = 0;
        config.enable_compression = true;
        let m = Membership::create(config).await.unwrap();
        assert!(!m.core.config.enable_compression);
        m.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_leave_without_peers_returns_immediately() {
        let m = Membership::create(test_config("solo")).await.unwrap();
        m.leave(Duration::from_secs(5)).await.unwrap();
        // Idempotent
        m.leave(Duration::from_secs(5)).await.unwrap();

        // Self is now dead, so the reported member count drops
        assert_eq!(m.num_members(), 0);
        m.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_is_idempotent() {
        let m = Membership::create(test_config("solo")).await.unwrap();
        m.shutdown().await.unwrap();
        m.shutdown().await.unwrap();
    }

    #[tokio::test]
    #[should_panic(expected = "leave called after shutdown")]
    async fn test_leave_after_shutdown_panics() {
        let m = Membership::create(test_config("solo")).await.unwrap();
        m.shutdown().await.unwrap();
        let _ = m.leave(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_join_with_no_seeds_errors() {
        let m = Membership::create(test_config("solo")).await.unwrap();
        let empty: Vec<String> = Vec::new();
        assert!(m.join(&empty).await.is_err());
        m.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_join_unreachable_seed_errors() {
        let m = Membership::create(test_config("solo")).await.unwrap();
        let result = m.join(&["127.0.0.1:1".to_string()]).await;
        assert!(matches!(result, Err(MeshError::Join(_))));
        m.shutdown().await.unwrap();
    }
}
