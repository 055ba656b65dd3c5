// Optional UDP mirror of every inspected, forwarded message. Each datagram
// carries a fixed little-endian header:
//   u32 csid, u32 connection_id, u32 msg_id, u16 msg_len, u8 side
// followed by msg_len payload bytes. side is 1 for client-originated traffic
// and 0 for server-originated traffic.

use crate::rules;
use anyhow::Context as _;
use std::net::{self, ToSocketAddrs as _};

pub const HEADER: usize = 15;
// Keeps header + payload under the UDP datagram ceiling.
const MAX_PAYLOAD: usize = 65520;

#[derive(Debug)]
pub struct Tap {
  socket: net::UdpSocket,
  target: net::SocketAddr,
  csid: u32,
  max_payload: usize,
}

impl Tap {
  pub fn open(host: &str, port: u16, csid: u32) -> anyhow::Result<Self> {
    let target = (host, port)
      .to_socket_addrs()?
      .next()
      .with_context(|| format!("couldn't resolve {host}:{port}"))?;
    let socket = net::UdpSocket::bind((net::Ipv4Addr::UNSPECIFIED, 0))?;
    Ok(Self {
      socket,
      target,
      csid,
      max_payload: MAX_PAYLOAD,
    })
  }

  /// Emits one datagram per payload slice, splitting oversized payloads.
  /// Every datagram consumes one msg_id; send failures never affect
  /// forwarding.
  pub fn emit(&self, connection: u32, msg_id: &mut u32, side: rules::Side, payload: &[u8]) {
    let mut rest = payload;
    loop {
      let (part, tail) = rest.split_at(rest.len().min(self.max_payload));
      let datagram = encode(self.csid, connection, *msg_id, side, part);
      if let Err(error) = self.socket.send_to(&datagram, self.target) {
        log::debug!("packet tap send to {} failed: {error}", self.target);
      }
      *msg_id = msg_id.wrapping_add(1);
      if tail.is_empty() {
        break;
      }
      rest = tail;
    }
  }
}

fn encode(csid: u32, connection: u32, msg_id: u32, side: rules::Side, payload: &[u8]) -> Vec<u8> {
  let mut datagram = Vec::with_capacity(HEADER + payload.len());
  datagram.extend_from_slice(&csid.to_le_bytes());
  datagram.extend_from_slice(&connection.to_le_bytes());
  datagram.extend_from_slice(&msg_id.to_le_bytes());
  datagram.extend_from_slice(&(payload.len() as u16).to_le_bytes());
  datagram.push(match side {
    rules::Side::Client => 1,
    rules::Side::Server => 0,
  });
  datagram.extend_from_slice(payload);
  datagram
}
