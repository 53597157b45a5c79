//! UDP broadcast auto-discovery: workers and monitors find the coordinator
//! without configuration. Clients broadcast probes carrying a reply port;
//! the coordinator answers each probe with a unicast announce naming its
//! TCP service port.

use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use byteorder::{ByteOrder, LittleEndian};
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tokio::time::Instant;

use crate::DISCOVERY_PORT;

pub const DISCOVERY_MAGIC: [u8; 3] = *b"CBD";
pub const DISCOVERY_VERSION: u8 = 1;

/// Wire size of a discovery packet: magic, version, type and an i32 port.
pub const DISC_PACKET_LEN: usize = 9;

/// How long a read waits before the loop re-checks its stop condition, and
/// the cadence of client probes.
const DISCOVERY_WAIT: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PacketType {
    /// The coordinator advertising its service port.
    ServerAnnounce = 0,
    /// A peer searching for the coordinator; the port is its reply port.
    ClientProbe = 1,
}

impl PacketType {
    fn from_u8(value: u8) -> Option<PacketType> {
        match value {
            0 => Some(PacketType::ServerAnnounce),
            1 => Some(PacketType::ClientProbe),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiscoveryPacket {
    pub ptype: PacketType,
    pub port: u16,
}

impl DiscoveryPacket {
    pub fn new(ptype: PacketType, port: u16) -> DiscoveryPacket {
        DiscoveryPacket { ptype, port }
    }

    pub fn encode(&self) -> [u8; DISC_PACKET_LEN] {
        let mut buf = [0u8; DISC_PACKET_LEN];
        buf[..3].copy_from_slice(&DISCOVERY_MAGIC);
        buf[3] = DISCOVERY_VERSION;
        buf[4] = self.ptype as u8;
        LittleEndian::write_i32(&mut buf[5..], i32::from(self.port));
        buf
    }

    pub fn decode(data: &[u8]) -> crate::Result<DiscoveryPacket> {
        if data.len() < DISC_PACKET_LEN {
            return Err(crate::Error::InvalidPacket("short packet"));
        }
        if !validate(data) {
            return Err(crate::Error::InvalidPacket("bad magic or version"));
        }
        let ptype = PacketType::from_u8(data[4])
            .ok_or(crate::Error::InvalidPacket("unknown packet type"))?;
        let port = LittleEndian::read_i32(&data[5..DISC_PACKET_LEN]);
        if port <= 0 || port > i32::from(u16::MAX) {
            return Err(crate::Error::InvalidPacket("port out of range"));
        }
        Ok(DiscoveryPacket {
            ptype,
            port: port as u16,
        })
    }
}

/// True iff the packet carries our magic and version.
pub fn validate(data: &[u8]) -> bool {
    data.len() >= 4 && data[..3] == DISCOVERY_MAGIC && data[3] == DISCOVERY_VERSION
}

/// Answers auto-discovery probes with the coordinator's service port.
pub struct DiscoveryServer {
    socket: UdpSocket,
    service_port: u16,
}

impl DiscoveryServer {
    /// Binds the discovery socket. Pass `discovery_port` 0 to let the OS
    /// choose (used by tests); production uses [`DISCOVERY_PORT`].
    pub async fn bind(service_port: u16, discovery_port: u16) -> crate::Result<DiscoveryServer> {
        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, discovery_port)).await?;
        Ok(DiscoveryServer {
            socket,
            service_port,
        })
    }

    pub fn local_port(&self) -> crate::Result<u16> {
        Ok(self.socket.local_addr()?.port())
    }

    /// Runs until the stop flag fires. Malformed packets and send failures
    /// are logged and the loop keeps serving.
    pub async fn run(self, mut stop: watch::Receiver<bool>) -> crate::Result<()> {
        let mut buf = [0u8; 64];
        loop {
            tokio::select! {
                _ = stop.changed() => {
                    log::debug!("Discovery server stopping");
                    return Ok(());
                }
                received = self.socket.recv_from(&mut buf) => {
                    let (read, remote) = match received {
                        Ok(received) => received,
                        Err(e) => {
                            log::error!("Discovery read error: {}", e);
                            continue;
                        }
                    };
                    let packet = match DiscoveryPacket::decode(&buf[..read]) {
                        Ok(packet) => packet,
                        Err(e) => {
                            log::debug!("Dropping packet from {}: {}", remote, e);
                            continue;
                        }
                    };
                    if packet.ptype != PacketType::ClientProbe {
                        continue;
                    }
                    let reply = DiscoveryPacket::new(PacketType::ServerAnnounce, self.service_port);
                    let target = SocketAddr::new(remote.ip(), packet.port);
                    if let Err(e) = self.socket.send_to(&reply.encode(), target).await {
                        log::error!("Error sending discovery response to {}: {}", target, e);
                    }
                }
            }
        }
    }
}

/// Searches for the coordinator by broadcasting probes, returning the first
/// announced address. Gives up with `Timeout` after `deadline`.
pub async fn discover_server(deadline: Duration) -> crate::Result<SocketAddr> {
    search_at(
        SocketAddr::from((Ipv4Addr::BROADCAST, DISCOVERY_PORT)),
        deadline,
    )
    .await
}

/// Like [`discover_server`] with an explicit probe target, so tests can run
/// the exchange over loopback.
pub async fn search_at(discovery_addr: SocketAddr, deadline: Duration) -> crate::Result<SocketAddr> {
    match tokio::time::timeout(deadline, search(discovery_addr)).await {
        Ok(result) => result,
        Err(_) => Err(crate::Error::Timeout),
    }
}

async fn search(discovery_addr: SocketAddr) -> crate::Result<SocketAddr> {
    let probe_socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).await?;
    probe_socket.set_broadcast(true)?;

    let listener = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).await?;
    let reply_port = listener.local_addr()?.port();

    let probe = DiscoveryPacket::new(PacketType::ClientProbe, reply_port).encode();
    let mut buf = [0u8; 64];

    loop {
        if let Err(e) = probe_socket.send_to(&probe, discovery_addr).await {
            log::error!("Could not send discovery probe: {}", e);
        }

        // Listen for announces until it is time for the next probe
        let window_end = Instant::now() + DISCOVERY_WAIT;
        loop {
            let now = Instant::now();
            if now >= window_end {
                break;
            }
            let received =
                match tokio::time::timeout(window_end - now, listener.recv_from(&mut buf)).await {
                    Ok(received) => received,
                    Err(_) => break,
                };
            let (read, remote) = match received {
                Ok(received) => received,
                Err(e) => {
                    log::error!("Discovery read error: {}", e);
                    continue;
                }
            };
            match DiscoveryPacket::decode(&buf[..read]) {
                Ok(packet) if packet.ptype == PacketType::ServerAnnounce => {
                    return Ok(SocketAddr::new(remote.ip(), packet.port));
                }
                Ok(_) => {}
                Err(e) => log::debug!("Dropping packet from {}: {}", remote, e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::net::{Ipv4Addr, SocketAddr};
    use std::time::Duration;

    use tokio::net::UdpSocket;
    use tokio::sync::watch;

    use super::{
        search_at, validate, DiscoveryPacket, DiscoveryServer, PacketType, DISC_PACKET_LEN,
    };

    #[test]
    fn packet_round_trip() {
        let packet = DiscoveryPacket::new(PacketType::ClientProbe, 123);
        let data = packet.encode();
        assert_eq!(data.len(), DISC_PACKET_LEN);
        assert!(validate(&data));
        assert_eq!(DiscoveryPacket::decode(&data).unwrap(), packet);
    }

    #[test]
    fn malformed_packets_rejected() {
        let good = DiscoveryPacket::new(PacketType::ServerAnnounce, 4567).encode();

        let mut bad_magic = good;
        bad_magic[0] = b'X';
        assert!(!validate(&bad_magic));
        assert!(DiscoveryPacket::decode(&bad_magic).is_err());

        let mut bad_version = good;
        bad_version[3] = 99;
        assert!(!validate(&bad_version));
        assert!(DiscoveryPacket::decode(&bad_version).is_err());

        let mut bad_type = good;
        bad_type[4] = 7;
        assert!(DiscoveryPacket::decode(&bad_type).is_err());

        assert!(DiscoveryPacket::decode(&good[..5]).is_err());
        assert!(DiscoveryPacket::decode(&[]).is_err());

        let mut bad_port = good;
        bad_port[5..].copy_from_slice(&(-5i32).to_le_bytes());
        assert!(DiscoveryPacket::decode(&bad_port).is_err());
    }

    #[test]
    fn decode_never_panics_on_garbage() {
        let mut data = Vec::new();
        for len in 0..32 {
            data.resize(len, 0);
            for byte in 0..=255u8 {
                data.fill(byte);
                let _ = DiscoveryPacket::decode(&data);
            }
        }
    }

    #[tokio::test]
    async fn server_answers_probes() {
        let server = DiscoveryServer::bind(4567, 0).await.unwrap();
        let server_port = server.local_port().unwrap();
        let (stop_tx, stop_rx) = watch::channel(false);
        let handle = tokio::spawn(server.run(stop_rx));

        let client = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
        let reply_port = client.local_addr().unwrap().port();
        let probe = DiscoveryPacket::new(PacketType::ClientProbe, reply_port).encode();
        client
            .send_to(&probe, (Ipv4Addr::LOCALHOST, server_port))
            .await
            .unwrap();

        let mut buf = [0u8; 64];
        let (read, _) = tokio::time::timeout(Duration::from_secs(5), client.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        let packet = DiscoveryPacket::decode(&buf[..read]).unwrap();
        assert_eq!(packet.ptype, PacketType::ServerAnnounce);
        assert_eq!(packet.port, 4567);

        stop_tx.send(true).unwrap();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn search_finds_server_over_loopback() {
        let server = DiscoveryServer::bind(4567, 0).await.unwrap();
        let server_port = server.local_port().unwrap();
        let (stop_tx, stop_rx) = watch::channel(false);
        let handle = tokio::spawn(server.run(stop_rx));

        let found = search_at(
            SocketAddr::from((Ipv4Addr::LOCALHOST, server_port)),
            Duration::from_secs(5),
        )
        .await
        .unwrap();
        assert_eq!(found.port(), 4567);
        assert_eq!(found.ip(), Ipv4Addr::LOCALHOST);

        stop_tx.send(true).unwrap();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn search_gives_up_after_deadline() {
        // Nothing is listening on this socket's port
        let unused = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
        let target = unused.local_addr().unwrap();
        match search_at(target, Duration::from_millis(50)).await {
            Err(crate::Error::Timeout) => {}
            other => panic!("Unexpected result: {:?}", other),
        }
    }
}
