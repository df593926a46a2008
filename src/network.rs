// Copyright (c) Anza Technology, Inc.
// SPDX-License-Identifier: Apache-2.0

//! UDP plumbing and deterministic port assignment.
//!
//! Every service port is derived from the node's public key, so any peer
//! can compute any other peer's addresses with zero coordination. Distinct
//! keys may collide within the 100-port window; a collision at bind time
//! falls back to the next port up and is counted.

use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use log::warn;
use thiserror::Error;
use tokio::net::UdpSocket;

use crate::NodeId;
use crate::crypto;
use crate::metrics::{inc, metrics};

/// Largest UDP payload we will send or accept.
pub const MAX_DATAGRAM_SIZE: usize = 65_507;
/// Receive buffer handed to the kernel for each listener.
pub const RECV_BUFFER_SIZE: usize = 65_536;
/// Budget for a single datagram send.
pub const SEND_TIMEOUT: Duration = Duration::from_millis(100);
/// Width of each service's port window.
pub const PORT_RANGE: u16 = 100;

/// The UDP services a node exposes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Service {
    /// Peer-to-peer gossip.
    Gossip,
    /// Leader-side transaction ingress.
    Tpu,
    /// Validator-side shred reception.
    Tvu,
    /// Fast transaction forwarding.
    Forwarder,
}

impl Service {
    #[must_use]
    pub const fn port_base(self) -> u16 {
        match self {
            Self::Gossip => 10_000,
            Self::Tpu => 13_000,
            Self::Tvu => 14_000,
            Self::Forwarder => 15_000,
        }
    }

    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Gossip => "gossip",
            Self::Tpu => "tpu",
            Self::Tvu => "tvu",
            Self::Forwarder => "forwarder",
        }
    }
}

/// Errors from socket setup and sends.
#[derive(Debug, Error)]
pub enum NetworkError {
    /// Fatal at startup.
    #[error("failed to bind {service} port {port}: {source}")]
    Bind {
        service: &'static str,
        port: u16,
        source: std::io::Error,
    },
    #[error("datagram send to {addr} failed: {source}")]
    Send {
        addr: SocketAddr,
        source: std::io::Error,
    },
    #[error("datagram send to {addr} timed out")]
    SendTimeout { addr: SocketAddr },
    #[error("datagram of {size} bytes exceeds the {MAX_DATAGRAM_SIZE}-byte limit")]
    OversizedDatagram { size: usize },
}

/// Deterministic port offset for `node`: the first eight hex characters of
/// the key hash, mod the window width.
#[must_use]
pub fn port_offset(node: &NodeId) -> u16 {
    let digest = crypto::hash(node.as_bytes());
    let lead = u32::from_be_bytes(digest[..4].try_into().expect("hash is 32 bytes"));
    (lead % u32::from(PORT_RANGE)) as u16
}

/// The port `node` serves `service` on.
#[must_use]
pub fn service_port(service: Service, node: &NodeId) -> u16 {
    service.port_base() + port_offset(node)
}

/// The socket address `node` serves `service` on, given its host.
#[must_use]
pub fn service_addr(service: Service, node: &NodeId, host: IpAddr) -> SocketAddr {
    SocketAddr::new(host, service_port(service, node))
}

/// Binds this node's socket for `service`.
///
/// On an address conflict (a distinct key hashing to the same offset) the
/// bind retries once at the next port up; the conflict is counted.
///
/// # Errors
///
/// Returns [`NetworkError::Bind`], which is fatal at startup.
pub async fn bind_service(service: Service, node: &NodeId) -> Result<UdpSocket, NetworkError> {
    let port = service_port(service, node);
    match UdpSocket::bind(("0.0.0.0", port)).await {
        Ok(socket) => Ok(socket),
        Err(first) if first.kind() == std::io::ErrorKind::AddrInUse => {
            inc(&metrics().port_conflicts);
            warn!(
                "{} port {port} in use, falling back to {}",
                service.name(),
                port + 1
            );
            UdpSocket::bind(("0.0.0.0", port + 1))
                .await
                .map_err(|source| NetworkError::Bind {
                    service: service.name(),
                    port: port + 1,
                    source,
                })
        }
        Err(source) => Err(NetworkError::Bind {
            service: service.name(),
            port,
            source,
        }),
    }
}

/// Sends one datagram within the [`SEND_TIMEOUT`] budget. Failures are for
/// the caller to count; nothing retries at this layer.
///
/// # Errors
///
/// Returns [`NetworkError`] on oversize, I/O failure, or timeout.
pub async fn send_datagram(
    socket: &UdpSocket,
    addr: SocketAddr,
    payload: &[u8],
) -> Result<(), NetworkError> {
    if payload.len() > MAX_DATAGRAM_SIZE {
        return Err(NetworkError::OversizedDatagram {
            size: payload.len(),
        });
    }
    match tokio::time::timeout(SEND_TIMEOUT, socket.send_to(payload, addr)).await {
        Ok(Ok(_)) => Ok(()),
        Ok(Err(source)) => Err(NetworkError::Send { addr, source }),
        Err(_) => Err(NetworkError::SendTimeout { addr }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::generate_validators;

    #[test]
    fn offsets_are_stable_and_in_range() {
        let (sks, _) = generate_validators(8);
        for sk in &sks {
            let node = sk.public();
            let off = port_offset(&node);
            assert!(off < PORT_RANGE);
            assert_eq!(off, port_offset(&node));
        }
    }

    #[test]
    fn service_ports_follow_their_bases() {
        let (sks, _) = generate_validators(1);
        let node = sks[0].public();
        let off = port_offset(&node);
        assert_eq!(service_port(Service::Gossip, &node), 10_000 + off);
        assert_eq!(service_port(Service::Tpu, &node), 13_000 + off);
        assert_eq!(service_port(Service::Tvu, &node), 14_000 + off);
        assert_eq!(service_port(Service::Forwarder, &node), 15_000 + off);
    }

    #[test]
    fn offset_matches_first_eight_hex_chars() {
        let (sks, _) = generate_validators(1);
        let node = sks[0].public();
        let digest = crypto::hash(node.as_bytes());
        let first_8_hex = &hex::encode(digest)[..8];
        let expected = (u32::from_str_radix(first_8_hex, 16).unwrap() % 100) as u16;
        assert_eq!(port_offset(&node), expected);
    }

    #[tokio::test]
    async fn bind_falls_back_on_conflict() {
        let (sks, _) = generate_validators(1);
        let node = sks[0].public();
        let first = bind_service(Service::Gossip, &node).await.unwrap();
        let second = bind_service(Service::Gossip, &node).await.unwrap();
        let p1 = first.local_addr().unwrap().port();
        let p2 = second.local_addr().unwrap().port();
        assert_eq!(p2, p1 + 1);
    }

    #[tokio::test]
    async fn oversized_datagram_rejected() {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        let payload = vec![0u8; MAX_DATAGRAM_SIZE + 1];
        assert!(matches!(
            send_datagram(&socket, addr, &payload).await,
            Err(NetworkError::OversizedDatagram { .. })
        ));
    }

    #[tokio::test]
    async fn datagram_roundtrip() {
        let receiver = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let sender = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = receiver.local_addr().unwrap();
        send_datagram(&sender, addr, b"ping").await.unwrap();
        let mut buf = [0u8; 16];
        let (n, _) = receiver.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"ping");
    }
}
