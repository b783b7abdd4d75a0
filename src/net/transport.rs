//! UDP transport: one bound socket, newline-terminated JSON frames.
//!
//! One envelope per datagram. The trailing newline is kept on the wire for
//! compatibility, but receive framing is per-datagram; the newline is
//! trimmed, never required. Peer addresses resolve once and are cached by
//! peer id. Send failures are logged and dropped; the periodic protocols
//! retry at their own cadence.

use super::envelope::Envelope;
use super::identity::Peer;
use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::Mutex;
use tokio::net::{lookup_host, UdpSocket};
use tracing::{debug, warn};

/// Receive buffers must hold the largest practical envelope (~60 KiB).
pub const RECV_BUFFER_SIZE: usize = 2 * 65536;

pub struct Transport {
    socket: UdpSocket,
    resolved: Mutex<HashMap<String, SocketAddr>>,
}

impl Transport {
    pub async fn bind(port: u16) -> io::Result<Self> {
        let socket = UdpSocket::bind(("0.0.0.0", port)).await?;
        Ok(Self {
            socket,
            resolved: Mutex::new(HashMap::new()),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Receive one datagram into `buf`, returning the payload slice length.
    pub async fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        let (len, _) = self.socket.recv_from(buf).await?;
        Ok(len)
    }

    /// Send an envelope to a raw `host:port` address.
    pub async fn send_to_address(&self, address: &str, env: &Envelope) {
        match self.resolve(address).await {
            Some(addr) => self.send_frame(addr, env).await,
            None => warn!("could not resolve {}", address),
        }
    }

    /// Send an envelope to a known peer, caching its resolved address.
    pub async fn send_to_peer(&self, peer: &Peer, env: &Envelope) {
        let cached = self.resolved.lock().unwrap().get(&peer.id()).copied();
        let addr = match cached {
            Some(addr) => addr,
            None => match self.resolve(&peer.address).await {
                Some(addr) => {
                    self.resolved.lock().unwrap().insert(peer.id(), addr);
                    addr
                }
                None => {
                    warn!("could not resolve peer address {}", peer.address);
                    return;
                }
            },
        };
        self.send_frame(addr, env).await;
    }

    async fn send_frame(&self, addr: SocketAddr, env: &Envelope) {
        let mut frame = match serde_json::to_vec(env) {
            Ok(frame) => frame,
            Err(err) => {
                warn!("envelope encode failed: {}", err);
                return;
            }
        };
        frame.push(b'\n');
        if let Err(err) = self.socket.send_to(&frame, addr).await {
            debug!("send to {} failed: {}", addr, err);
        }
    }

    async fn resolve(&self, address: &str) -> Option<SocketAddr> {
        if let Ok(addr) = address.parse() {
            return Some(addr);
        }
        match lookup_host(address).await {
            Ok(mut addrs) => addrs.next(),
            Err(_) => None,
        }
    }
}

/// Trim a received datagram to the envelope payload: drop the trailing
/// newline if present.
pub fn trim_frame(buf: &[u8]) -> &[u8] {
    match buf.last() {
        Some(b'\n') => &buf[..buf.len() - 1],
        _ => buf,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::envelope::EnvelopeKind;

    #[test]
    fn trim_frame_strips_single_newline() {
        assert_eq!(trim_frame(b"{}\n"), b"{}");
        assert_eq!(trim_frame(b"{}"), b"{}");
        assert_eq!(trim_frame(b""), b"");
    }

    #[tokio::test]
    async fn frames_roundtrip_over_loopback() {
        let a = Transport::bind(0).await.unwrap();
        let b = Transport::bind(0).await.unwrap();
        let b_addr = b.local_addr().unwrap();

        let env = Envelope::new(EnvelopeKind::Ping, "x.y".into(), String::new(), vec![9]);
        a.send_to_address(&format!("127.0.0.1:{}", b_addr.port()), &env)
            .await;

        let mut buf = vec![0u8; RECV_BUFFER_SIZE];
        let len = b.recv(&mut buf).await.unwrap();
        let got: Envelope = serde_json::from_slice(trim_frame(&buf[..len])).unwrap();
        assert_eq!(got.kind, "ping");
        assert_eq!(got.data, vec![9]);
    }
}
