// Datagram and stream transport
//
// One UDP socket and one TCP listener bound to the same port. Datagrams
// carry probes and gossip; streams carry push/pull state exchanges and
// fallback pings. Stream frames are `[tag][u32 BE length][payload]`.

use crate::error::{MeshError, Result};
use crate::net::codec::MAX_STREAM_FRAME_SIZE;
use bytes::Bytes;
use parking_lot::Mutex;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};

pub struct Transport {
    udp: Arc<UdpSocket>,
    listener: Mutex<Option<TcpListener>>,
    bound_port: u16,
}

impl Transport {
    /// Bind the TCP listener first, then the UDP socket on the same port.
    /// If either bind fails the other listener is closed before returning.
    /// An ephemeral request (port 0) retries a few times in case the port
    /// the kernel picked for TCP is already taken for UDP.
    pub async fn bind(addr: IpAddr, port: u16) -> Result<Self> {
        let attempts = if port == 0 { 3 } else { 1 };
        let mut last_err = None;

        for _ in 0..attempts {
            let listener = TcpListener::bind(SocketAddr::new(addr, port))
                .await
                .map_err(|e| MeshError::Network(format!("failed to bind TCP listener: {}", e)))?;

            let bound_port = listener
                .local_addr()
                .map_err(|e| MeshError::Network(format!("failed to read bound address: {}", e)))?
                .port();

            match UdpSocket::bind(SocketAddr::new(addr, bound_port)).await {
                Ok(udp) => {
                    tracing::info!(%addr, port = bound_port, "transport listening");
                    return Ok(Self {
                        udp: Arc::new(udp),
                        listener: Mutex::new(Some(listener)),
                        bound_port,
                    });
                }
                Err(e) => {
                    // Close the sibling listener before retrying or surfacing
                    drop(listener);
                    last_err = Some(MeshError::Network(format!(
                        "failed to bind UDP socket: {}",
                        e
                    )));
                }
            }
        }

        Err(last_err.expect("at least one bind attempt"))
    }

    pub fn bound_port(&self) -> u16 {
        self.bound_port
    }

    pub fn udp_socket(&self) -> Arc<UdpSocket> {
        self.udp.clone()
    }

    /// Hand the TCP listener to the accept loop. Panics if taken twice.
    pub fn take_listener(&self) -> TcpListener {
        self.listener
            .lock()
            .take()
            .expect("TCP listener already taken")
    }

    pub async fn send_packet(&self, addr: SocketAddr, packet: Bytes) -> Result<()> {
        self.udp
            .send_to(&packet, addr)
            .await
            .map_err(|e| MeshError::Network(format!("failed to send datagram to {}: {}", addr, e)))?;
        Ok(())
    }

    /// Open a stream to a peer within the given deadline.
    pub async fn connect(&self, addr: SocketAddr, deadline: Duration) -> Result<TcpStream> {
        let stream = tokio::time::timeout(deadline, TcpStream::connect(addr))
            .await
            .map_err(|_| MeshError::Timeout(format!("connection timeout to {}", addr)))?
            .map_err(|e| MeshError::Network(format!("failed to connect to {}: {}", addr, e)))?;

        stream
            .set_nodelay(true)
            .map_err(|e| MeshError::Network(format!("failed to set TCP_NODELAY: {}", e)))?;
        Ok(stream)
    }
}

/// Write one `[tag][u32 BE length][payload]` frame.
pub async fn write_frame(stream: &mut TcpStream, tag: u8, payload: &[u8]) -> Result<()> {
    let mut header = [0u8; 5];
    header[0] = tag;
    header[1..5].copy_from_slice(&(payload.len() as u32).to_be_bytes());

    stream
        .write_all(&header)
        .await
        .map_err(|e| MeshError::Network(format!("failed to write frame header: {}", e)))?;
    stream
        .write_all(payload)
        .await
        .map_err(|e| MeshError::Network(format!("failed to write frame payload: {}", e)))?;
    stream
        .flush()
        .await
        .map_err(|e| MeshError::Network(format!("failed to flush frame: {}", e)))?;
    Ok(())
}

/// Read one frame, enforcing the stream frame size bound.
pub async fn read_frame(stream: &mut TcpStream) -> Result<(u8, Vec<u8>)> {
    let mut header = [0u8; 5];
    stream
        .read_exact(&mut header)
        .await
        .map_err(|e| MeshError::Network(format!("failed to read frame header: {}", e)))?;

    let len = u32::from_be_bytes([header[1], header[2], header[3], header[4]]) as usize;
    if len > MAX_STREAM_FRAME_SIZE {
        return Err(MeshError::Network(format!(
            "stream frame of {} bytes exceeds limit",
            len
        )));
    }

    let mut payload = vec![0u8; len];
    stream
        .read_exact(&mut payload)
        .await
        .map_err(|e| MeshError::Network(format!("failed to read frame payload: {}", e)))?;
    Ok((header[0], payload))
}
