// Gossip dissemination
//
// Every gossip interval, a handful of random peers each get one UDP
// datagram packed with pending broadcasts. Dead nodes keep receiving
// gossip for the gossip-to-the-dead window so they can learn of their own
// death and refute it if it was premature. User messages from the
// delegate piggyback after the protocol's own broadcasts.

use crate::membership::MembershipCore;
use crate::net::codec::{
    compress_payload, encode_user_msg, make_compound, UDP_PACKET_BUDGET,
};
use bytes::Bytes;
use std::sync::Arc;

/// Framing cost of one entry inside a compound datagram (u16 length).
const COMPOUND_OVERHEAD: usize = 2;

/// Headroom for the compound header and the outer CRC/encryption wrapper.
const PACKET_HEADROOM: usize = 64;

impl MembershipCore {
    /// One gossip tick: pick peers, pack a datagram for each, send.
    pub(crate) async fn gossip_tick(self: &Arc<Self>) {
        let dead_window = self.config.gossip_to_the_dead_time;
        let targets = self.k_random_members(self.config.gossip_nodes, |m| {
            if m.name == self.config.name {
                return false;
            }
            m.is_active() || m.state_change.elapsed() < dead_window
        });

        for target in targets {
            let msgs = self.gossip_payloads();
            if msgs.is_empty() {
                continue;
            }

            let packet = if msgs.len() == 1 {
                msgs.into_iter().next().expect("length checked")
            } else {
                match make_compound(&msgs) {
                    Ok(packet) => packet,
                    Err(e) => {
                        tracing::warn!("failed to build compound datagram: {}", e);
                        continue;
                    }
                }
            };

            let packet = self.maybe_compress(packet);
            if let Err(e) = self.send_raw(target.socket_addr(), packet).await {
                tracing::warn!(node = %target.name, "failed to gossip: {}", e);
            }
        }
    }

    /// Pending broadcasts plus delegate user messages, within the packet
    /// budget. Each call counts one transmission against the queue.
    fn gossip_payloads(&self) -> Vec<Bytes> {
        let limit = UDP_PACKET_BUDGET - PACKET_HEADROOM;
        let mut msgs = self.broadcasts.get_broadcasts(COMPOUND_OVERHEAD, limit);

        if let Some(delegate) = &self.config.delegate {
            let used: usize = msgs
                .iter()
                .map(|m| m.len() + COMPOUND_OVERHEAD)
                .sum();
            let remaining = limit.saturating_sub(used);
            if remaining > COMPOUND_OVERHEAD {
                // The user tag byte costs one on top of the compound framing
                for user in delegate.broadcasts(COMPOUND_OVERHEAD + 1, remaining) {
                    msgs.push(encode_user_msg(&user));
                }
            }
        }

        // A compound datagram addresses at most 255 parts
        msgs.truncate(u8::MAX as usize);
        msgs
    }

    /// Compress a payload when enabled and worthwhile.
    pub(crate) fn maybe_compress(&self, packet: Bytes) -> Bytes {
        if !self.config.enable_compression {
            return packet;
        }
        match compress_payload(&packet) {
            Ok(compressed) if compressed.len() < packet.len() => compressed,
            Ok(_) => packet,
            Err(e) => {
                tracing::warn!("compression failed, sending raw: {}", e);
                packet
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MembershipConfig;
    use crate::delegate::Delegate;
    use crate::membership::MembershipCore;
    use crate::net::MessageKind;

    struct ChattyDelegate;

    impl Delegate for ChattyDelegate {
        fn broadcasts(&self, _overhead: usize, _limit: usize) -> Vec<Vec<u8>> {
            vec![b"user-payload".to_vec()]
        }
    }

    async fn test_core(config: MembershipConfig) -> Arc<MembershipCore> {
        let core = MembershipCore::new(config).await.unwrap();
        core.set_alive().unwrap();
        core
    }

    #[tokio::test]
    async fn test_gossip_payloads_include_delegate_messages() {
        let mut config = MembershipConfig::local();
        config.name = "a".to_string();
        config.bind_port = 0;
        config.delegate = Some(Arc::new(ChattyDelegate));
        let core = test_core(config).await;
        core.broadcasts.reset();

        let msgs = core.gossip_payloads();
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0][0], MessageKind::User as u8);
        assert_eq!(&msgs[0][1..], b"user-payload");
    }

    #[tokio::test]
    async fn test_maybe_compress_skips_incompressible() {
        let mut config = MembershipConfig::local();
        config.name = "a".to_string();
        config.bind_port = 0;
        let core = test_core(config).await;

        // Tiny payloads grow under DEFLATE framing and are left alone
        let tiny = Bytes::from_static(&[1, 2, 3]);
        assert_eq!(core.maybe_compress(tiny.clone()), tiny);

        // Repetitive payloads shrink and come back wrapped
        let redundant = Bytes::from(vec![0u8; 600]);
        let packed = core.maybe_compress(redundant.clone());
        assert!(packed.len() < redundant.len());
        assert_eq!(packed[0], MessageKind::Compress as u8);
    }
}
