// Failure detector
//
// Round-robin direct probe over UDP; on timeout, indirect probes through
// random peers plus a stream ping fallback for paths where UDP is dropped.
// A silent target is marked suspect, never immediately dead. The multi-way
// "ack or deadline" wait is a select over the ack channel installed in the
// handler table before the first ping leaves.

use crate::membership::MembershipCore;
use crate::net::codec::encode_message;
use crate::net::{
    bytes_to_ip, ip_to_bytes, AckResp, IndirectPing, MessageKind, NackResp, Ping, Suspect,
};
use crate::node::{Member, MemberState};
use bytes::Bytes;
use rand::seq::SliceRandom;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

/// Pending probe waiting for an ack. Entries self-expire: the prober
/// removes its own handler, and the reaper sweeps anything whose deadline
/// passed (e.g. when a probe task was cancelled mid-flight).
pub(crate) struct AckHandler {
    ack_tx: mpsc::Sender<AckResp>,
    nack_tx: Option<mpsc::Sender<()>>,
    deadline: Instant,
}

impl MembershipCore {
    pub(crate) fn install_ack_handler(
        &self,
        seq_num: u32,
        ack_tx: mpsc::Sender<AckResp>,
        nack_tx: Option<mpsc::Sender<()>>,
        timeout: Duration,
    ) {
        let handler = AckHandler {
            ack_tx,
            nack_tx,
            deadline: Instant::now() + timeout,
        };
        self.ack_handlers.lock().insert(seq_num, handler);
    }

    pub(crate) fn remove_ack_handler(&self, seq_num: u32) {
        self.ack_handlers.lock().remove(&seq_num);
    }

    /// Deliver an ack to whoever is waiting on this sequence number.
    pub(crate) fn invoke_ack_handler(&self, ack: AckResp) {
        let handler = self.ack_handlers.lock().remove(&ack.seq_num);
        if let Some(handler) = handler {
            let _ = handler.ack_tx.try_send(ack);
        }
    }

    /// Deliver a nack; the handler stays installed since an ack may still
    /// arrive from another relay.
    pub(crate) fn invoke_nack_handler(&self, nack: NackResp) {
        let handlers = self.ack_handlers.lock();
        if let Some(handler) = handlers.get(&nack.seq_num) {
            if let Some(nack_tx) = &handler.nack_tx {
                let _ = nack_tx.try_send(());
            }
        }
    }

    /// Drop handlers whose deadline passed without an ack.
    pub(crate) fn reap_ack_handlers(&self) {
        let now = Instant::now();
        self.ack_handlers.lock().retain(|_, h| h.deadline > now);
    }

    /// One failure-detector tick: maintain the table, pick the next
    /// round-robin target and probe it.
    pub(crate) async fn probe_tick(self: &Arc<Self>) {
        let target = {
            let mut table = self.nodes.write();
            self.reap_dead_locked(&mut table);

            let mut found = None;
            let mut checked = 0;
            let bound = table.order.len() + 1;
            while checked < bound {
                if table.probe_index >= table.order.len() {
                    if table.order.is_empty() {
                        break;
                    }
                    table.order.shuffle(&mut rand::rng());
                    table.probe_index = 0;
                }

                let name = table.order[table.probe_index].clone();
                table.probe_index += 1;
                checked += 1;

                let Some(member) = table.members.get(&name) else {
                    continue;
                };
                if name == self.config.name {
                    continue;
                }
                match member.state {
                    MemberState::Dead => continue,
                    MemberState::Suspect if !self.config.probe_suspect_nodes => continue,
                    _ => {
                        found = Some(member.clone());
                        break;
                    }
                }
            }
            found
        };

        if let Some(member) = target {
            self.probe_member(&member).await;
        }
    }

    /// Probe a single member: direct ping, then indirect pings and a stream
    /// fallback, then suspicion.
    pub(crate) async fn probe_member(self: &Arc<Self>, target: &Member) {
        let seq_num = self.next_seq();
        let (ack_tx, mut ack_rx) = mpsc::channel(self.config.indirect_checks + 2);
        let (nack_tx, mut nack_rx) = mpsc::channel(self.config.indirect_checks.max(1));
        self.install_ack_handler(seq_num, ack_tx, Some(nack_tx), self.config.probe_interval);

        let ping = Ping {
            seq_num,
            node: target.name.clone(),
        };
        if let Err(e) = self.send_encoded(target.socket_addr(), MessageKind::Ping, &ping).await {
            tracing::warn!(node = %target.name, "failed to send probe: {}", e);
        }

        let probe_timeout = self.awareness.scale(self.config.probe_timeout);
        if self.wait_for_ack(&mut ack_rx, probe_timeout).await {
            self.remove_ack_handler(seq_num);
            self.awareness.apply_delta(-1);
            return;
        }

        tracing::debug!(node = %target.name, seq_num, "direct probe timed out, going indirect");

        // Fan out through peers that can reach the target when we cannot
        let relays = self.k_random_members(self.config.indirect_checks, |m| {
            m.state == MemberState::Alive && m.name != self.config.name && m.name != target.name
        });
        let indirect = IndirectPing {
            seq_num,
            node: target.name.clone(),
            addr: ip_to_bytes(target.addr),
            port: target.port,
            nack: true,
        };
        for relay in &relays {
            if let Err(e) = self
                .send_encoded(relay.socket_addr(), MessageKind::IndirectPing, &indirect)
                .await
            {
                tracing::warn!(relay = %relay.name, "failed to send indirect probe: {}", e);
            }
        }

        // Stream fallback for partitions that only drop UDP
        let fallback_core = self.clone();
        let fallback_target = target.clone();
        tokio::spawn(async move {
            if fallback_core
                .send_stream_ping(&fallback_target, seq_num)
                .await
                .is_ok()
            {
                fallback_core.invoke_ack_handler(AckResp {
                    seq_num,
                    payload: Vec::new(),
                });
            }
        });

        let remaining = self
            .config
            .probe_interval
            .saturating_sub(probe_timeout)
            .max(self.config.probe_timeout);
        let acked = self.wait_for_ack(&mut ack_rx, remaining).await;
        self.remove_ack_handler(seq_num);

        if acked {
            self.awareness.apply_delta(-1);
            return;
        }

        // Count how many relays answered at all; total silence suggests we
        // are the degraded party.
        let mut nacks = 0;
        while nack_rx.try_recv().is_ok() {
            nacks += 1;
        }
        let awareness_delta = if !relays.is_empty() && nacks == 0 { 2 } else { 1 };
        self.awareness.apply_delta(awareness_delta);

        tracing::info!(
            node = %target.name,
            seq_num,
            relays = relays.len(),
            nacks,
            "probe failed, marking node as suspect"
        );
        self.suspect_node(Suspect {
            incarnation: target.incarnation,
            node: target.name.clone(),
            from: self.config.name.clone(),
        });
    }

    async fn wait_for_ack(&self, ack_rx: &mut mpsc::Receiver<AckResp>, wait: Duration) -> bool {
        matches!(
            tokio::time::timeout(wait, ack_rx.recv()).await,
            Ok(Some(_))
        )
    }

    /// Encode, seal and send a single message as a datagram.
    pub(crate) async fn send_encoded<T: serde::Serialize>(
        &self,
        addr: SocketAddr,
        kind: MessageKind,
        body: &T,
    ) -> crate::error::Result<()> {
        let raw = encode_message(kind, body)?;
        self.send_raw(addr, raw).await
    }

    pub(crate) async fn send_raw(
        &self,
        addr: SocketAddr,
        raw: Bytes,
    ) -> crate::error::Result<()> {
        let packet = self.codec.seal(&raw)?;
        self.transport.send_packet(addr, packet).await
    }

    /// Inbound direct ping: ack it, but only if it is addressed to us.
    pub(crate) async fn handle_ping(self: &Arc<Self>, ping: Ping, from: SocketAddr) {
        if ping.node != self.config.name {
            tracing::warn!(
                node = %ping.node,
                %from,
                "dropping ping addressed to another node"
            );
            self.note_malformed("misdirected ping");
            return;
        }

        let ack = AckResp {
            seq_num: ping.seq_num,
            payload: Vec::new(),
        };
        if let Err(e) = self.send_encoded(from, MessageKind::AckResp, &ack).await {
            tracing::warn!(%from, "failed to send ack: {}", e);
        }
    }

    /// Inbound indirect ping: run our own short probe against the target
    /// and relay the verdict back to the requester.
    pub(crate) fn handle_indirect_ping(self: &Arc<Self>, indirect: IndirectPing, from: SocketAddr) {
        let Ok(target_ip) = bytes_to_ip(&indirect.addr) else {
            self.note_malformed("indirect ping with invalid address");
            return;
        };
        let target_addr = SocketAddr::new(target_ip, indirect.port);

        let core = self.clone();
        tokio::spawn(async move {
            let relay_seq = core.next_seq();
            let (ack_tx, mut ack_rx) = mpsc::channel(1);
            let probe_timeout = core.awareness.scale(core.config.probe_timeout);
            core.install_ack_handler(relay_seq, ack_tx, None, probe_timeout);

            let ping = Ping {
                seq_num: relay_seq,
                node: indirect.node.clone(),
            };
            if let Err(e) = core.send_encoded(target_addr, MessageKind::Ping, &ping).await {
                tracing::debug!(peer = %target_addr, "relay probe send failed: {}", e);
            }

            let acked = core.wait_for_ack(&mut ack_rx, probe_timeout).await;
            core.remove_ack_handler(relay_seq);

            if acked {
                let ack = AckResp {
                    seq_num: indirect.seq_num,
                    payload: Vec::new(),
                };
                if let Err(e) = core.send_encoded(from, MessageKind::AckResp, &ack).await {
                    tracing::debug!(%from, "failed to relay ack: {}", e);
                }
            } else if indirect.nack {
                let nack = NackResp {
                    seq_num: indirect.seq_num,
                };
                if let Err(e) = core.send_encoded(from, MessageKind::NackResp, &nack).await {
                    tracing::debug!(%from, "failed to send nack: {}", e);
                }
            }
        });
    }
}
