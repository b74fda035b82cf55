// Anti-entropy push/pull
//
// Periodic full-state exchange with one random peer over a stream:
// both sides swap their complete membership table plus opaque delegate
// state, and each merges the remote view through the state machine, whose
// conflict-resolution rules make the merge monotone. Join runs the same
// exchange once per seed. The stream also answers fallback pings.
//
// Exchange body layout after the frame tag:
//   [u16 header len][header][u16 record len][record]... [user state]

use crate::error::{MeshError, Result};
use crate::membership::MembershipCore;
use crate::net::transport::{read_frame, write_frame};
use crate::net::{
    AckResp, Alive, Dead, MessageKind, Ping, PushNodeState, PushPullHeader, Suspect,
};
use crate::node::{Member, MemberState};
use bytes::{BufMut, BytesMut};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpStream;

fn encode_chunk<T: serde::Serialize>(buf: &mut BytesMut, value: &T) -> Result<()> {
    let bytes = bincode::serde::encode_to_vec(value, bincode::config::standard())
        .map_err(|e| MeshError::Serialization(format!("failed to encode state chunk: {}", e)))?;
    if bytes.len() > u16::MAX as usize {
        return Err(MeshError::Serialization(format!(
            "state chunk of {} bytes exceeds frame limit",
            bytes.len()
        )));
    }
    buf.put_u16(bytes.len() as u16);
    buf.put_slice(&bytes);
    Ok(())
}

fn decode_chunk<T: serde::de::DeserializeOwned>(buf: &mut &[u8]) -> Result<T> {
    let data = std::mem::take(buf);
    if data.len() < 2 {
        return Err(MeshError::Serialization(
            "truncated state chunk length".to_string(),
        ));
    }
    let len = u16::from_be_bytes([data[0], data[1]]) as usize;
    if data.len() - 2 < len {
        return Err(MeshError::Serialization(
            "truncated state chunk body".to_string(),
        ));
    }

    let value = bincode::serde::decode_from_slice(&data[2..2 + len], bincode::config::standard())
        .map(|(value, _)| value)
        .map_err(|e| MeshError::Serialization(format!("failed to decode state chunk: {}", e)))?;
    *buf = &data[2 + len..];
    Ok(value)
}

pub(crate) fn build_push_pull_body(
    records: &[PushNodeState],
    user_state: &[u8],
    join: bool,
) -> Result<Vec<u8>> {
    let header = PushPullHeader {
        nodes: records.len() as u32,
        user_state_len: user_state.len() as u32,
        join,
    };

    let mut buf = BytesMut::new();
    encode_chunk(&mut buf, &header)?;
    for record in records {
        encode_chunk(&mut buf, record)?;
    }
    buf.put_slice(user_state);
    Ok(buf.to_vec())
}

pub(crate) fn parse_push_pull_body(
    body: &[u8],
) -> Result<(Vec<PushNodeState>, Vec<u8>, bool)> {
    let mut cursor = body;
    let header: PushPullHeader = decode_chunk(&mut cursor)?;

    // Grow as records decode; a forged count fails on the first truncated
    // chunk instead of reserving unbounded memory up front.
    let mut records = Vec::new();
    for _ in 0..header.nodes {
        records.push(decode_chunk::<PushNodeState>(&mut cursor)?);
    }

    if cursor.len() < header.user_state_len as usize {
        return Err(MeshError::Serialization(
            "truncated user state in push/pull exchange".to_string(),
        ));
    }
    let user_state = cursor[..header.user_state_len as usize].to_vec();

    Ok((records, user_state, header.join))
}

impl MembershipCore {
    /// One anti-entropy tick: full-state exchange with one random peer.
    pub(crate) async fn push_pull_tick(self: &Arc<Self>) {
        let peer = self
            .k_random_members(1, |m| {
                m.state == MemberState::Alive && m.name != self.config.name
            })
            .pop();

        let Some(peer) = peer else {
            return;
        };
        if let Err(e) = self.push_pull_node(peer.socket_addr(), false).await {
            tracing::warn!(node = %peer.name, "push/pull failed: {}", e);
        }
    }

    /// Full-state exchange with a specific address. Used by the periodic
    /// loop and once per seed during join.
    pub(crate) async fn push_pull_node(self: &Arc<Self>, addr: SocketAddr, join: bool) -> Result<()> {
        let deadline = self.config.tcp_timeout;
        let (records, user_state) = tokio::time::timeout(deadline, async {
            let mut stream = self.transport.connect(addr, deadline).await?;
            self.send_local_state(&mut stream, join).await?;
            self.read_remote_state(&mut stream).await
        })
        .await
        .map_err(|_| MeshError::Timeout(format!("push/pull with {} timed out", addr)))??;

        self.merge_remote_state(records);
        if let Some(delegate) = &self.config.delegate {
            if !user_state.is_empty() {
                delegate.merge_remote_state(&user_state, join);
            }
        }
        Ok(())
    }

    async fn send_local_state(&self, stream: &mut TcpStream, join: bool) -> Result<()> {
        let records = self.push_pull_records();
        let user_state = match &self.config.delegate {
            Some(delegate) => delegate.local_state(join),
            None => Vec::new(),
        };

        tracing::debug!(
            nodes = records.len(),
            user_state = user_state.len(),
            join,
            "sending local state"
        );

        let body = build_push_pull_body(&records, &user_state, join)?;
        let (tag, payload) = self.codec.seal_frame(MessageKind::PushPull, &body)?;
        write_frame(stream, tag, &payload).await
    }

    async fn read_remote_state(
        &self,
        stream: &mut TcpStream,
    ) -> Result<(Vec<PushNodeState>, Vec<u8>)> {
        let (tag, payload) = read_frame(stream).await?;
        let (kind, body) = self.codec.open_frame(tag, payload)?;
        if kind != MessageKind::PushPull {
            return Err(MeshError::Network(format!(
                "expected push/pull response, got {:?}",
                kind
            )));
        }
        let (records, user_state, _join) = parse_push_pull_body(&body)?;
        Ok((records, user_state))
    }

    /// Feed a remote membership table through the state machine.
    pub(crate) fn merge_remote_state(self: &Arc<Self>, records: Vec<PushNodeState>) {
        for record in records {
            match record.state {
                MemberState::Alive => {
                    self.alive_node(
                        Alive {
                            incarnation: record.incarnation,
                            node: record.name,
                            addr: record.addr,
                            port: record.port,
                            meta: record.meta,
                            vsn: record.vsn,
                        },
                        false,
                    );
                }
                MemberState::Suspect => {
                    self.suspect_node(Suspect {
                        incarnation: record.incarnation,
                        node: record.name,
                        from: self.config.name.clone(),
                    });
                }
                MemberState::Dead => {
                    self.dead_node(
                        Dead {
                            incarnation: record.incarnation,
                            node: record.name,
                            from: self.config.name.clone(),
                        },
                        None,
                    );
                }
            }
        }
    }

    /// Serve one inbound stream: a push/pull exchange or a fallback ping.
    pub(crate) async fn handle_stream(self: &Arc<Self>, mut stream: TcpStream) -> Result<()> {
        let deadline = self.config.tcp_timeout;
        tokio::time::timeout(deadline, async {
            let (tag, payload) = read_frame(&mut stream).await?;
            let (kind, body) = self.codec.open_frame(tag, payload)?;

            match kind {
                MessageKind::PushPull => {
                    let (records, user_state, join) = parse_push_pull_body(&body)?;
                    self.send_local_state(&mut stream, join).await?;
                    self.merge_remote_state(records);
                    if let Some(delegate) = &self.config.delegate {
                        if !user_state.is_empty() {
                            delegate.merge_remote_state(&user_state, join);
                        }
                    }
                    Ok(())
                }
                MessageKind::Ping => {
                    let ping: Ping = crate::net::codec::decode_body(&body)?;
                    if ping.node != self.config.name {
                        self.note_malformed("misdirected stream ping");
                        return Err(MeshError::Network(
                            "stream ping addressed to another node".to_string(),
                        ));
                    }
                    let ack = AckResp {
                        seq_num: ping.seq_num,
                        payload: Vec::new(),
                    };
                    let body = bincode::serde::encode_to_vec(&ack, bincode::config::standard())
                        .map_err(|e| {
                            MeshError::Serialization(format!("failed to encode ack: {}", e))
                        })?;
                    let (tag, payload) = self.codec.seal_frame(MessageKind::AckResp, &body)?;
                    write_frame(&mut stream, tag, &payload).await
                }
                other => Err(MeshError::Network(format!(
                    "unexpected stream message {:?}",
                    other
                ))),
            }
        })
        .await
        .map_err(|_| MeshError::Timeout("inbound stream timed out".to_string()))?
    }

    /// Fallback probe over the stream transport, used when UDP acks are
    /// not coming back.
    pub(crate) async fn send_stream_ping(self: &Arc<Self>, target: &Member, seq_num: u32) -> Result<()> {
        let deadline = self.config.tcp_timeout;
        tokio::time::timeout(deadline, async {
            let mut stream = self.transport.connect(target.socket_addr(), deadline).await?;

            let ping = Ping {
                seq_num,
                node: target.name.clone(),
            };
            let body = bincode::serde::encode_to_vec(&ping, bincode::config::standard())
                .map_err(|e| MeshError::Serialization(format!("failed to encode ping: {}", e)))?;
            let (tag, payload) = self.codec.seal_frame(MessageKind::Ping, &body)?;
            write_frame(&mut stream, tag, &payload).await?;

            let (tag, payload) = read_frame(&mut stream).await?;
            let (kind, body) = self.codec.open_frame(tag, payload)?;
            if kind != MessageKind::AckResp {
                return Err(MeshError::Network(format!(
                    "expected ack on stream ping, got {:?}",
                    kind
                )));
            }
            let ack: AckResp = crate::net::codec::decode_body(&body)?;
            if ack.seq_num != seq_num {
                return Err(MeshError::Network(format!(
                    "stream ack for wrong sequence: got {}, wanted {}",
                    ack.seq_num, seq_num
                )));
            }
            Ok(())
        })
        .await
        .map_err(|_| {
            MeshError::Timeout(format!("stream ping to {} timed out", target.name))
        })?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MembershipConfig;
    use crate::net::ip_to_bytes;

    fn record(name: &str, incarnation: u32, state: MemberState) -> PushNodeState {
        PushNodeState {
            name: name.to_string(),
            addr: ip_to_bytes("127.0.0.1".parse().unwrap()),
            port: 9000,
            meta: Vec::new(),
            incarnation,
            state,
            vsn: [0, 2, 2, 0, 0, 0],
        }
    }

    #[test]
    fn test_body_round_trip() {
        let records = vec![
            record("a", 3, MemberState::Alive),
            record("b", 1, MemberState::Suspect),
            record("c", 9, MemberState::Dead),
        ];
        let user_state = b"delegate state".to_vec();

        let body = build_push_pull_body(&records, &user_state, true).unwrap();
        let (decoded, decoded_state, join) = parse_push_pull_body(&body).unwrap();

        assert_eq!(decoded, records);
        assert_eq!(decoded_state, user_state);
        assert!(join);
    }

    #[test]
    fn test_body_truncation_rejected() {
        let records = vec![record("a", 3, MemberState::Alive)];
        let body = build_push_pull_body(&records, b"state", false).unwrap();
        assert!(parse_push_pull_body(&body[..body.len() - 2]).is_err());
    }

    #[tokio::test]
    async fn test_merge_feeds_state_machine() {
        let mut config = MembershipConfig::local();
        config.name = "local".to_string();
        config.bind_port = 0;
        let core = crate::membership::MembershipCore::new(config).await.unwrap();
        core.set_alive().unwrap();

        core.merge_remote_state(vec![
            record("a", 3, MemberState::Alive),
            record("b", 1, MemberState::Alive),
        ]);
        // A dead record about a known node is applied on a later exchange
        core.merge_remote_state(vec![record("b", 9, MemberState::Dead)]);

        let table = core.nodes.read();
        assert_eq!(table.members.get("a").unwrap().state, MemberState::Alive);
        assert_eq!(table.members.get("b").unwrap().state, MemberState::Dead);
        assert_eq!(table.members.get("b").unwrap().incarnation, 9);
    }

    #[tokio::test]
    async fn test_merge_suspect_record_starts_suspicion() {
        let mut config = MembershipConfig::local();
        config.name = "local".to_string();
        config.bind_port = 0;
        let core = crate::membership::MembershipCore::new(config).await.unwrap();
        core.set_alive().unwrap();

        core.merge_remote_state(vec![record("a", 3, MemberState::Alive)]);
        core.merge_remote_state(vec![record("a", 3, MemberState::Suspect)]);

        let table = core.nodes.read();
        assert_eq!(table.members.get("a").unwrap().state, MemberState::Suspect);
    }
}
