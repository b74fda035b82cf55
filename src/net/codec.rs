// Gossip wire codec
//
// Layered framing around the tagged bincode messages:
//
// - compound batching: `[Compound][count][len u16]*[messages]`
// - compression:       `[Compress][algo][deflated payload]`
// - integrity:         `[HasCrc][crc32 BE][payload]` on plaintext datagrams
// - encryption:        `[Encrypted][nonce][AES-128-GCM ciphertext]`
//
// Encryption and CRC are mutually exclusive outermost wrappers: AES-GCM
// already authenticates the payload, so the CRC trailer only guards
// unencrypted traffic.

use crate::error::{MeshError, Result};
use crate::net::MessageKind;
use aes_gcm::aead::Aead;
use aes_gcm::{Aes128Gcm, KeyInit, Nonce};
use bytes::{BufMut, Bytes, BytesMut};
use rand::RngCore;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::io::{Read, Write};

/// Send budget for a single gossip datagram, conservatively below the
/// common 1500-byte MTU.
pub const UDP_PACKET_BUDGET: usize = 1400;

/// Receive buffer for inbound datagrams.
pub const UDP_RECV_BUF_SIZE: usize = 65536;

/// Upper bound for a decompressed payload, guards against zip bombs.
const MAX_DECOMPRESSED_SIZE: u64 = 1024 * 1024;

/// Maximum body accepted on a stream frame.
pub const MAX_STREAM_FRAME_SIZE: usize = 16 * 1024 * 1024;

const NONCE_SIZE: usize = 12;
const CRC_SIZE: usize = 4;

/// DEFLATE is the only compression algorithm currently spoken.
const COMPRESSION_DEFLATE: u8 = 0;

/// Serialize a tagged message: `[kind][bincode body]`.
pub fn encode_message<T: Serialize>(kind: MessageKind, body: &T) -> Result<Bytes> {
    let payload = bincode::serde::encode_to_vec(body, bincode::config::standard())
        .map_err(|e| MeshError::Serialization(format!("failed to encode message: {}", e)))?;

    let mut buf = BytesMut::with_capacity(1 + payload.len());
    buf.put_u8(kind as u8);
    buf.put_slice(&payload);
    Ok(buf.freeze())
}

/// Deserialize a message body (the bytes after the kind tag).
pub fn decode_body<T: DeserializeOwned>(body: &[u8]) -> Result<T> {
    bincode::serde::decode_from_slice(body, bincode::config::standard())
        .map(|(value, _)| value)
        .map_err(|e| MeshError::Serialization(format!("failed to decode message: {}", e)))
}

/// Wrap a raw user payload: `[User][payload]`.
pub fn encode_user_msg(payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(1 + payload.len());
    buf.put_u8(MessageKind::User as u8);
    buf.put_slice(payload);
    buf.freeze()
}

/// Batch several encoded messages into one compound datagram.
///
/// The count is capped at 255 here; keeping the total under the packet
/// budget is the caller's job.
pub fn make_compound(msgs: &[Bytes]) -> Result<Bytes> {
    if msgs.len() > u8::MAX as usize {
        return Err(MeshError::Internal(format!(
            "compound overflow: {} messages",
            msgs.len()
        )));
    }

    let total: usize = msgs.iter().map(|m| m.len()).sum();
    let mut buf = BytesMut::with_capacity(2 + msgs.len() * 2 + total);
    buf.put_u8(MessageKind::Compound as u8);
    buf.put_u8(msgs.len() as u8);
    for msg in msgs {
        buf.put_u16(msg.len() as u16);
    }
    for msg in msgs {
        buf.put_slice(msg);
    }
    Ok(buf.freeze())
}

/// Split a compound body (the bytes after the tag) into its parts.
///
/// Returns the decoded parts and the number of truncated parts that were
/// dropped.
pub fn parse_compound(body: &[u8]) -> Result<(Vec<Bytes>, usize)> {
    if body.is_empty() {
        return Err(MeshError::Serialization(
            "compound message missing count".to_string(),
        ));
    }

    let count = body[0] as usize;
    let header_len = 1 + count * 2;
    if body.len() < header_len {
        return Err(MeshError::Serialization(
            "compound message truncated length table".to_string(),
        ));
    }

    let mut lengths = Vec::with_capacity(count);
    for i in 0..count {
        let offset = 1 + i * 2;
        lengths.push(u16::from_be_bytes([body[offset], body[offset + 1]]) as usize);
    }

    let mut parts = Vec::with_capacity(count);
    let mut truncated = 0;
    let mut cursor = header_len;
    for len in lengths {
        if cursor + len > body.len() {
            truncated += 1;
            continue;
        }
        parts.push(Bytes::copy_from_slice(&body[cursor..cursor + len]));
        cursor += len;
    }

    Ok((parts, truncated))
}

/// Wrap an encoded payload in a compression envelope.
pub fn compress_payload(payload: &[u8]) -> Result<Bytes> {
    let mut encoder =
        flate2::write::DeflateEncoder::new(Vec::new(), flate2::Compression::default());
    encoder
        .write_all(payload)
        .map_err(|e| MeshError::Serialization(format!("compression failed: {}", e)))?;
    let compressed = encoder
        .finish()
        .map_err(|e| MeshError::Serialization(format!("compression failed: {}", e)))?;

    let mut buf = BytesMut::with_capacity(2 + compressed.len());
    buf.put_u8(MessageKind::Compress as u8);
    buf.put_u8(COMPRESSION_DEFLATE);
    buf.put_slice(&compressed);
    Ok(buf.freeze())
}

/// Inflate a compression body (the bytes after the tag).
pub fn decompress_payload(body: &[u8]) -> Result<Vec<u8>> {
    let Some((&algo, data)) = body.split_first() else {
        return Err(MeshError::Serialization(
            "compress message missing algorithm".to_string(),
        ));
    };
    if algo != COMPRESSION_DEFLATE {
        return Err(MeshError::Serialization(format!(
            "unknown compression algorithm {}",
            algo
        )));
    }

    let mut out = Vec::new();
    flate2::read::DeflateDecoder::new(data)
        .take(MAX_DECOMPRESSED_SIZE)
        .read_to_end(&mut out)
        .map_err(|e| MeshError::Serialization(format!("decompression failed: {}", e)))?;
    Ok(out)
}

/// Outermost datagram and stream-frame sealing: encryption when a key is
/// configured, a CRC trailer otherwise.
pub struct PacketCodec {
    cipher: Option<Aes128Gcm>,
}

impl PacketCodec {
    pub fn new(secret_key: Option<&[u8]>) -> Result<Self> {
        let cipher = match secret_key {
            Some(key) => Some(Aes128Gcm::new_from_slice(key).map_err(|_| {
                MeshError::Config("secret key must be exactly 16 bytes".to_string())
            })?),
            None => None,
        };
        Ok(Self { cipher })
    }

    pub fn is_encrypted(&self) -> bool {
        self.cipher.is_some()
    }

    /// Seal an outbound datagram.
    pub fn seal(&self, raw: &[u8]) -> Result<Bytes> {
        match &self.cipher {
            Some(cipher) => {
                let sealed = encrypt(cipher, raw)?;
                let mut buf = BytesMut::with_capacity(1 + sealed.len());
                buf.put_u8(MessageKind::Encrypted as u8);
                buf.put_slice(&sealed);
                Ok(buf.freeze())
            }
            None => {
                let crc = crc32fast::hash(raw);
                let mut buf = BytesMut::with_capacity(1 + CRC_SIZE + raw.len());
                buf.put_u8(MessageKind::HasCrc as u8);
                buf.put_u32(crc);
                buf.put_slice(raw);
                Ok(buf.freeze())
            }
        }
    }

    /// Open an inbound datagram, verifying or decrypting the outer layer.
    ///
    /// With a key configured, plaintext traffic is rejected; without one,
    /// both CRC-framed and bare legacy datagrams are accepted.
    pub fn open(&self, buf: &[u8]) -> Result<Bytes> {
        let Some((&tag, rest)) = buf.split_first() else {
            return Err(MeshError::Serialization("empty datagram".to_string()));
        };

        match (MessageKind::from_u8(tag), &self.cipher) {
            (Some(MessageKind::Encrypted), Some(cipher)) => decrypt(cipher, rest).map(Bytes::from),
            (Some(MessageKind::Encrypted), None) => Err(MeshError::Network(
                "received encrypted datagram without a configured key".to_string(),
            )),
            (_, Some(_)) => Err(MeshError::Network(
                "rejected plaintext datagram, encryption is required".to_string(),
            )),
            (Some(MessageKind::HasCrc), None) => {
                if rest.len() < CRC_SIZE {
                    return Err(MeshError::Serialization("truncated CRC frame".to_string()));
                }
                let expected = u32::from_be_bytes([rest[0], rest[1], rest[2], rest[3]]);
                let payload = &rest[CRC_SIZE..];
                if crc32fast::hash(payload) != expected {
                    return Err(MeshError::Network("datagram CRC mismatch".to_string()));
                }
                Ok(Bytes::copy_from_slice(payload))
            }
            (Some(_), None) => Ok(Bytes::copy_from_slice(buf)),
            (None, None) => Err(MeshError::Serialization(format!(
                "unknown message tag {}",
                tag
            ))),
        }
    }

    /// Seal a stream frame body, returning the tag byte and payload to
    /// write after the length prefix.
    pub fn seal_frame(&self, kind: MessageKind, body: &[u8]) -> Result<(u8, Vec<u8>)> {
        match &self.cipher {
            Some(cipher) => {
                let mut plain = Vec::with_capacity(1 + body.len());
                plain.push(kind as u8);
                plain.extend_from_slice(body);
                Ok((MessageKind::Encrypted as u8, encrypt(cipher, &plain)?))
            }
            None => Ok((kind as u8, body.to_vec())),
        }
    }

    /// Reverse of `seal_frame`.
    pub fn open_frame(&self, tag: u8, payload: Vec<u8>) -> Result<(MessageKind, Vec<u8>)> {
        let kind = MessageKind::from_u8(tag)
            .ok_or_else(|| MeshError::Serialization(format!("unknown stream tag {}", tag)))?;

        match (kind, &self.cipher) {
            (MessageKind::Encrypted, Some(cipher)) => {
                let plain = decrypt(cipher, &payload)?;
                let Some((&inner, body)) = plain.split_first() else {
                    return Err(MeshError::Serialization("empty encrypted frame".to_string()));
                };
                let kind = MessageKind::from_u8(inner).ok_or_else(|| {
                    MeshError::Serialization(format!("unknown inner stream tag {}", inner))
                })?;
                Ok((kind, body.to_vec()))
            }
            (MessageKind::Encrypted, None) => Err(MeshError::Network(
                "received encrypted stream without a configured key".to_string(),
            )),
            (_, Some(_)) => Err(MeshError::Network(
                "rejected plaintext stream, encryption is required".to_string(),
            )),
            (kind, None) => Ok((kind, payload)),
        }
    }
}

fn encrypt(cipher: &Aes128Gcm, plaintext: &[u8]) -> Result<Vec<u8>> {
    let mut nonce_bytes = [0u8; NONCE_SIZE];
    rand::rng().fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);

    let ciphertext = cipher
        .encrypt(nonce, plaintext)
        .map_err(|_| MeshError::Network("encryption failed".to_string()))?;

    let mut out = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
    out.extend_from_slice(&nonce_bytes);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

fn decrypt(cipher: &Aes128Gcm, sealed: &[u8]) -> Result<Vec<u8>> {
    if sealed.len() < NONCE_SIZE {
        return Err(MeshError::Serialization(
            "encrypted payload shorter than nonce".to_string(),
        ));
    }
    let (nonce_bytes, ciphertext) = sealed.split_at(NONCE_SIZE);
    cipher
        .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
        .map_err(|_| MeshError::Network("decryption failed, wrong key or corrupt data".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::{AckResp, Ping};

    #[test]
    fn test_message_round_trip() {
        let ping = Ping {
            seq_num: 42,
            node: "node1".to_string(),
        };
        let encoded = encode_message(MessageKind::Ping, &ping).unwrap();
        assert_eq!(encoded[0], MessageKind::Ping as u8);

        let decoded: Ping = decode_body(&encoded[1..]).unwrap();
        assert_eq!(decoded, ping);
    }

    #[test]
    fn test_compound_round_trip() {
        let msgs: Vec<Bytes> = vec![
            encode_message(MessageKind::Ping, &Ping { seq_num: 1, node: "a".into() }).unwrap(),
            encode_message(MessageKind::AckResp, &AckResp { seq_num: 1, payload: vec![] }).unwrap(),
            encode_message(MessageKind::Ping, &Ping { seq_num: 2, node: "b".into() }).unwrap(),
        ];

        let compound = make_compound(&msgs).unwrap();
        assert_eq!(compound[0], MessageKind::Compound as u8);

        let (parts, truncated) = parse_compound(&compound[1..]).unwrap();
        assert_eq!(truncated, 0);
        assert_eq!(parts, msgs);
    }

    #[test]
    fn test_compound_truncation_counted() {
        let msgs = vec![
            encode_message(MessageKind::Ping, &Ping { seq_num: 1, node: "a".into() }).unwrap(),
            encode_message(MessageKind::Ping, &Ping { seq_num: 2, node: "b".into() }).unwrap(),
        ];
        let compound = make_compound(&msgs).unwrap();

        // Chop the tail off the second message
        let (parts, truncated) = parse_compound(&compound[1..compound.len() - 3]).unwrap();
        assert_eq!(parts.len(), 1);
        assert_eq!(truncated, 1);
    }

    #[test]
    fn test_compression_round_trip() {
        let payload = vec![7u8; 4096];
        let compressed = compress_payload(&payload).unwrap();
        assert_eq!(compressed[0], MessageKind::Compress as u8);
        assert!(compressed.len() < payload.len());

        let restored = decompress_payload(&compressed[1..]).unwrap();
        assert_eq!(restored, payload);
    }

    #[test]
    fn test_crc_seal_and_corruption() {
        let codec = PacketCodec::new(None).unwrap();
        let raw = encode_message(MessageKind::Ping, &Ping { seq_num: 9, node: "x".into() }).unwrap();

        let sealed = codec.seal(&raw).unwrap();
        assert_eq!(sealed[0], MessageKind::HasCrc as u8);
        assert_eq!(codec.open(&sealed).unwrap(), raw);

        let mut corrupted = sealed.to_vec();
        let last = corrupted.len() - 1;
        corrupted[last] ^= 0xFF;
        assert!(codec.open(&corrupted).is_err());
    }

    #[test]
    fn test_encryption_round_trip() {
        let key = [1u8; 16];
        let codec = PacketCodec::new(Some(key.as_slice())).unwrap();
        let raw = encode_message(MessageKind::Ping, &Ping { seq_num: 3, node: "n".into() }).unwrap();

        let sealed = codec.seal(&raw).unwrap();
        assert_eq!(sealed[0], MessageKind::Encrypted as u8);
        assert_eq!(codec.open(&sealed).unwrap(), raw);

        // A different key must fail authentication
        let other = PacketCodec::new(Some([2u8; 16].as_slice())).unwrap();
        assert!(other.open(&sealed).is_err());

        // Plaintext is rejected once a key is configured
        let plain = PacketCodec::new(None).unwrap().seal(&raw).unwrap();
        assert!(codec.open(&plain).is_err());
    }

    #[test]
    fn test_stream_frame_round_trip() {
        for key in [None, Some([5u8; 16])] {
            let codec = PacketCodec::new(key.as_ref().map(|k| k.as_slice())).unwrap();
            let body = b"push pull body".to_vec();
            let (tag, payload) = codec.seal_frame(MessageKind::PushPull, &body).unwrap();
            let (kind, opened) = codec.open_frame(tag, payload).unwrap();
            assert_eq!(kind, MessageKind::PushPull);
            assert_eq!(opened, body);
        }
    }
}
