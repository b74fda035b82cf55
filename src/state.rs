// Membership state machine
//
// The node table and the three rumor handlers (alive/suspect/dead) with
// incarnation-based conflict resolution. All decisions for a single node
// are made atomically under the table's write lock; broadcasts and event
// callbacks fire after the lock is released. Tie-break rules at equal
// incarnation: alive overrides suspect, suspect demotes alive, dead is
// sticky against both, and rumors about the local node are refuted with a
// strictly greater incarnation.

use crate::config::{META_MAX_SIZE, PROTOCOL_VERSION_MAX, PROTOCOL_VERSION_MIN};
use crate::error::Result;
use crate::membership::MembershipCore;
use crate::net::codec::encode_message;
use crate::net::{bytes_to_ip, ip_to_bytes, Alive, Dead, MessageKind, PushNodeState, Suspect};
use crate::node::{Member, MemberState, VersionTuple};
use bytes::Bytes;
use rand::seq::SliceRandom;
use rand::Rng;
use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::oneshot;

/// Local membership view. The `order` vec is a permutation of the map keys
/// and drives round-robin probe selection.
pub(crate) struct NodeTable {
    pub members: HashMap<String, Member>,
    pub order: Vec<String>,
    pub probe_index: usize,
}

impl NodeTable {
    pub fn new() -> Self {
        Self {
            members: HashMap::new(),
            order: Vec::new(),
            probe_index: 0,
        }
    }

    /// Insert a new member at a random position in the probe order so
    /// freshly joined nodes are not always probed last.
    pub fn insert(&mut self, member: Member) {
        let name = member.name.clone();
        self.members.insert(name.clone(), member);
        let idx = rand::rng().random_range(0..=self.order.len());
        self.order.insert(idx, name);
    }

    pub fn remove(&mut self, name: &str) {
        self.members.remove(name);
        if let Some(pos) = self.order.iter().position(|n| n == name) {
            self.order.remove(pos);
            if pos < self.probe_index {
                self.probe_index -= 1;
            }
        }
    }
}

/// Membership change queued under the table lock, delivered after it drops.
enum MemberEvent {
    Join(Member),
    Update(Member),
    Leave(Member),
}

fn protocol_compatible(vsn: &VersionTuple) -> bool {
    vsn[0] <= PROTOCOL_VERSION_MAX && vsn[1] >= PROTOCOL_VERSION_MIN
}

impl MembershipCore {
    /// Register the local node and broadcast its initial alive message.
    /// Called once during create, before any loop starts.
    pub(crate) fn set_alive(self: &Arc<Self>) -> Result<()> {
        let meta = self.local_meta();
        let alive = Alive {
            incarnation: self.incarnation.load(Ordering::SeqCst),
            node: self.config.name.clone(),
            addr: ip_to_bytes(self.advertise.ip()),
            port: self.advertise.port(),
            meta,
            vsn: self.config.version_tuple(),
        };
        self.alive_node(alive, true);
        Ok(())
    }

    /// Metadata for the local node, enforcing the delegate's size contract.
    pub(crate) fn local_meta(&self) -> Vec<u8> {
        match &self.config.delegate {
            Some(delegate) => {
                let meta = delegate.node_meta(META_MAX_SIZE);
                if meta.len() > META_MAX_SIZE {
                    // Delegate contract violation, not a recoverable error
                    panic!(
                        "delegate returned {} bytes of metadata, limit is {}",
                        meta.len(),
                        META_MAX_SIZE
                    );
                }
                meta
            }
            None => Vec::new(),
        }
    }

    /// Handle an alive rumor.
    pub(crate) fn alive_node(self: &Arc<Self>, alive: Alive, bootstrap: bool) {
        let Ok(addr) = bytes_to_ip(&alive.addr) else {
            self.note_malformed("alive message with invalid address");
            return;
        };

        let is_local = alive.node == self.config.name;
        if self.leave_flag.load(Ordering::SeqCst) && is_local && !bootstrap {
            return;
        }

        let mut broadcast = None;
        let mut event = None;
        let mut needs_refute = false;

        {
            let mut table = self.nodes.write();

            if !table.members.contains_key(&alive.node) {
                if !protocol_compatible(&alive.vsn) {
                    tracing::warn!(
                        node = %alive.node,
                        vsn = ?alive.vsn,
                        "ignoring alive from node with incompatible protocol"
                    );
                    return;
                }
                // Seed the entry as dead so the accept logic below treats
                // the incoming rumor as a fresh transition.
                let mut member = Member::new(
                    alive.node.clone(),
                    addr,
                    alive.port,
                    alive.meta.clone(),
                    alive.incarnation,
                    alive.vsn,
                );
                member.state = MemberState::Dead;
                table.insert(member);
                self.num_nodes.store(table.members.len(), Ordering::Relaxed);
            }

            let member = table
                .members
                .get_mut(&alive.node)
                .expect("entry inserted above");

            if is_local {
                if bootstrap {
                    member.addr = addr;
                    member.port = alive.port;
                    member.meta = alive.meta.clone();
                    member.vsn = alive.vsn;
                    member.incarnation = alive.incarnation;
                    member.state = MemberState::Alive;
                    member.state_change = Instant::now();
                    broadcast = Some(self.encode_alive_broadcast(&alive));
                } else {
                    // Someone is rumoring a stale or conflicting alive
                    // about us; ignore exact matches, refute the rest.
                    let matches = member.addr == addr
                        && member.port == alive.port
                        && member.meta == alive.meta
                        && member.vsn == alive.vsn;
                    if alive.incarnation <= member.incarnation && matches {
                        return;
                    }
                    needs_refute = true;
                }
            } else {
                let addr_changed = member.addr != addr || member.port != alive.port;
                let accept = if addr_changed {
                    alive.incarnation > member.incarnation
                } else {
                    alive.incarnation > member.incarnation
                        || (alive.incarnation == member.incarnation
                            && member.state != MemberState::Alive)
                };
                if !accept {
                    return;
                }

                let old_state = member.state;
                let meta_changed = member.meta != alive.meta;
                member.addr = addr;
                member.port = alive.port;
                member.meta = alive.meta.clone();
                member.vsn = alive.vsn;
                member.incarnation = alive.incarnation;
                if member.state != MemberState::Alive {
                    member.state = MemberState::Alive;
                    member.state_change = Instant::now();
                }

                broadcast = Some(self.encode_alive_broadcast(&alive));
                event = if old_state == MemberState::Dead {
                    Some(MemberEvent::Join(member.clone()))
                } else if meta_changed || addr_changed {
                    Some(MemberEvent::Update(member.clone()))
                } else {
                    None
                };
            }
        }

        if needs_refute {
            self.refute(alive.incarnation);
            return;
        }

        if let Some(Ok(payload)) = broadcast {
            self.cancel_suspicion(&alive.node);
            self.broadcasts
                .queue_broadcast(Some(alive.node.clone()), payload, None);
        }
        if let Some(event) = event {
            self.fire_event(event);
        }
    }

    /// Handle a suspect rumor.
    pub(crate) fn suspect_node(self: &Arc<Self>, suspect: Suspect) {
        let mut broadcast = None;
        let mut timer_incarnation = None;

        {
            let mut table = self.nodes.write();
            let Some(member) = table.members.get_mut(&suspect.node) else {
                return;
            };

            if suspect.incarnation < member.incarnation {
                return;
            }

            if suspect.node == self.config.name {
                drop(table);
                self.refute(suspect.incarnation);
                return;
            }

            // A suspect rumor only demotes a live node; it neither revives
            // the dead nor re-arms an existing suspicion.
            if member.state != MemberState::Alive {
                return;
            }

            member.state = MemberState::Suspect;
            member.incarnation = suspect.incarnation;
            member.state_change = Instant::now();

            broadcast = Some(encode_message(MessageKind::Suspect, &suspect));
            timer_incarnation = Some(suspect.incarnation);
        }

        tracing::info!(
            node = %suspect.node,
            from = %suspect.from,
            incarnation = suspect.incarnation,
            "marking node as suspect"
        );

        if let Some(Ok(payload)) = broadcast {
            self.broadcasts
                .queue_broadcast(Some(suspect.node.clone()), payload, None);
        }
        if let Some(incarnation) = timer_incarnation {
            self.start_suspicion(suspect.node, incarnation);
        }
    }

    /// Handle a dead rumor. `notify` fires once the resulting broadcast
    /// has drained from the queue (used by leave).
    pub(crate) fn dead_node(
        self: &Arc<Self>,
        dead: Dead,
        notify: Option<oneshot::Sender<()>>,
    ) {
        let mut broadcast = None;
        let mut event = None;

        {
            let mut table = self.nodes.write();
            let Some(member) = table.members.get_mut(&dead.node) else {
                return;
            };

            if dead.incarnation < member.incarnation {
                return;
            }

            if dead.node == self.config.name && !self.leave_flag.load(Ordering::SeqCst) {
                drop(table);
                self.refute(dead.incarnation);
                return;
            }

            if member.state == MemberState::Dead {
                return;
            }

            member.incarnation = dead.incarnation;
            member.state = MemberState::Dead;
            member.state_change = Instant::now();

            broadcast = Some(encode_message(MessageKind::Dead, &dead));
            event = Some(MemberEvent::Leave(member.clone()));
        }

        tracing::info!(
            node = %dead.node,
            from = %dead.from,
            incarnation = dead.incarnation,
            "marking node as dead"
        );

        self.cancel_suspicion(&dead.node);
        if let Some(Ok(payload)) = broadcast {
            self.broadcasts
                .queue_broadcast(Some(dead.node.clone()), payload, notify);
        }
        if let Some(event) = event {
            self.fire_event(event);
        }
    }

    /// Assert a strictly newer alive for the local node in response to a
    /// rumor claiming we are suspect, dead, or running stale attributes.
    pub(crate) fn refute(self: &Arc<Self>, rumored_incarnation: u32) {
        let incarnation = self.skip_incarnation(rumored_incarnation);

        let alive = {
            let mut table = self.nodes.write();
            let Some(member) = table.members.get_mut(&self.config.name) else {
                return;
            };
            member.incarnation = incarnation;
            member.state = MemberState::Alive;
            Alive {
                incarnation,
                node: member.name.clone(),
                addr: ip_to_bytes(member.addr),
                port: member.port,
                meta: member.meta.clone(),
                vsn: member.vsn,
            }
        };

        // Needing to refute means the cluster briefly believed a false
        // rumor about us; treat it as a sign of local degradation.
        self.awareness.apply_delta(1);

        tracing::warn!(incarnation, "refuting rumor about local node");
        if let Ok(payload) = self.encode_alive_broadcast(&alive) {
            self.broadcasts
                .queue_broadcast(Some(alive.node.clone()), payload, None);
        }
    }

    fn encode_alive_broadcast(&self, alive: &Alive) -> Result<Bytes> {
        encode_message(MessageKind::Alive, alive)
    }

    /// Bump the local incarnation strictly above a rumored value.
    pub(crate) fn skip_incarnation(&self, rumored: u32) -> u32 {
        let mut current = self.incarnation.load(Ordering::SeqCst);
        loop {
            let next = current.max(rumored) + 1;
            match self.incarnation.compare_exchange(
                current,
                next,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return next,
                Err(observed) => current = observed,
            }
        }
    }

    pub(crate) fn next_seq(&self) -> u32 {
        self.sequence_num.fetch_add(1, Ordering::SeqCst).wrapping_add(1)
    }

    /// Suspicion window before a suspect is declared dead.
    pub(crate) fn suspicion_timeout(&self) -> std::time::Duration {
        let n = self.num_nodes.load(Ordering::Relaxed);
        let scale = ((n.max(1) + 1) as f64).log10();
        self.config
            .probe_interval
            .mul_f64(self.config.suspicion_mult as f64 * scale)
    }

    fn start_suspicion(self: &Arc<Self>, name: String, incarnation: u32) {
        let timeout = self.suspicion_timeout();
        let core = self.clone();
        let mut shutdown = self.shutdown_tx.subscribe();
        let timer_name = name.clone();

        let handle = tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(timeout) => {}
                _ = shutdown.changed() => return,
            }

            let still_suspect = {
                let table = core.nodes.read();
                table
                    .members
                    .get(&timer_name)
                    .map(|m| m.state == MemberState::Suspect && m.incarnation == incarnation)
                    .unwrap_or(false)
            };
            if still_suspect {
                tracing::info!(node = %timer_name, "suspicion timeout elapsed without refutation");
                core.dead_node(
                    Dead {
                        incarnation,
                        node: timer_name.clone(),
                        from: core.config.name.clone(),
                    },
                    None,
                );
            }
            core.suspicion_timers.lock().remove(&timer_name);
        });

        if let Some(old) = self.suspicion_timers.lock().insert(name, handle) {
            old.abort();
        }
    }

    pub(crate) fn cancel_suspicion(&self, name: &str) {
        if let Some(handle) = self.suspicion_timers.lock().remove(name) {
            handle.abort();
        }
    }

    /// Remove members that have been dead longer than the gossip-to-the-dead
    /// window. The local entry survives even after leave so the handle can
    /// keep reporting it. Caller holds the write lock.
    pub(crate) fn reap_dead_locked(&self, table: &mut NodeTable) {
        let window = self.config.gossip_to_the_dead_time;
        let expired: Vec<String> = table
            .members
            .values()
            .filter(|m| {
                m.is_dead() && m.name != self.config.name && m.state_change.elapsed() > window
            })
            .map(|m| m.name.clone())
            .collect();

        for name in expired {
            tracing::debug!(node = %name, "reaping dead node");
            table.remove(&name);
        }
        self.num_nodes.store(table.members.len(), Ordering::Relaxed);
    }

    /// Pick up to `k` distinct random members passing `filter`.
    pub(crate) fn k_random_members<F>(&self, k: usize, filter: F) -> Vec<Member>
    where
        F: Fn(&Member) -> bool,
    {
        let table = self.nodes.read();
        let mut eligible: Vec<&Member> = table.members.values().filter(|m| filter(m)).collect();
        eligible.shuffle(&mut rand::rng());
        eligible.into_iter().take(k).cloned().collect()
    }

    /// Snapshot of every member that is not dead.
    pub(crate) fn member_snapshot(&self) -> Vec<Member> {
        let table = self.nodes.read();
        table
            .members
            .values()
            .filter(|m| !m.is_dead())
            .cloned()
            .collect()
    }

    pub(crate) fn active_member_count(&self) -> usize {
        let table = self.nodes.read();
        table.members.values().filter(|m| !m.is_dead()).count()
    }

    /// Full table as push/pull records, dead members included so peers can
    /// learn about deaths through anti-entropy as well.
    pub(crate) fn push_pull_records(&self) -> Vec<PushNodeState> {
        let table = self.nodes.read();
        table
            .members
            .values()
            .map(|m| PushNodeState {
                name: m.name.clone(),
                addr: ip_to_bytes(m.addr),
                port: m.port,
                meta: m.meta.clone(),
                incarnation: m.incarnation,
                state: m.state,
                vsn: m.vsn,
            })
            .collect()
    }

    pub(crate) fn note_malformed(&self, what: &str) {
        let total = self.malformed.fetch_add(1, Ordering::Relaxed) + 1;
        tracing::debug!(total, "dropped malformed message: {}", what);
    }

    fn fire_event(&self, event: MemberEvent) {
        let Some(events) = &self.config.events else {
            return;
        };
        match event {
            MemberEvent::Join(member) => events.notify_join(&member),
            MemberEvent::Update(member) => events.notify_update(&member),
            MemberEvent::Leave(member) => events.notify_leave(&member),
        }
    }
}
