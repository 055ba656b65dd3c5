// One thread per direction per connection over blocking sockets. Both
// directions share the Inspector (and the tap msg_id) behind a mutex held for
// the duration of one ingest, so rule firings for a chunk always precede any
// byte of the next chunk. Backpressure comes for free: a stalled peer write
// stalls that direction's reader.

use crate::{inspect, rules, tap};
use anyhow::Context as _;
use std::{
  io::{Read as _, Write as _},
  net, sync, thread,
};

pub struct Proxy {
  pub rules: sync::Arc<Vec<rules::Rule>>,
  pub upstream: net::SocketAddr,
  pub negotiate: bool,
  pub window: usize,
  pub max_connections: Option<u32>,
  pub tap: Option<tap::Tap>,
}

// Log lines spell the peer the way the deployment's harness expects:
// ('127.0.0.1', 41234).
fn peer_tuple(address: &net::SocketAddr) -> String {
  format!("('{}', {})", address.ip(), address.port())
}

fn escape(bytes: &[u8]) -> String {
  let mut string = String::new();
  for byte in bytes {
    string += &std::ascii::escape_default(*byte).to_string();
  }
  string
}

impl Proxy {
  pub fn serve(self: sync::Arc<Self>, listener: net::TcpListener) -> anyhow::Result<()> {
    let slots = sync::Arc::new((sync::Mutex::new(0u32), sync::Condvar::new()));
    for connection_id in 0u32.. {
      if let Some(limit) = self.max_connections {
        let (count, released) = &*slots;
        let mut active = count.lock().unwrap();
        while *active >= limit {
          active = released.wait(active).unwrap();
        }
        *active += 1;
      }
      let (client, peer) = listener.accept().context("accept failed")?;
      let proxy = self.clone();
      let slots = slots.clone();
      thread::spawn(move || {
        if let Err(error) = proxy.relay_connection(connection_id, &client, peer) {
          log::debug!(
            "connection {connection_id} from {} failed: {error:?}",
            peer_tuple(&peer)
          );
        }
        log::info!("closed connection from {}", peer_tuple(&peer));
        if proxy.max_connections.is_some() {
          let (count, released) = &*slots;
          *count.lock().unwrap() -= 1;
          released.notify_one();
        }
      });
    }
    Ok(())
  }

  fn relay_connection(
    &self,
    id: u32,
    client: &net::TcpStream,
    peer: net::SocketAddr,
  ) -> anyhow::Result<()> {
    let server = net::TcpStream::connect(self.upstream)
      .with_context(|| format!("couldn't reach upstream {}", self.upstream))?;
    client.set_nodelay(true)?;
    server.set_nodelay(true)?;
    log::info!("proxying connection from {}", peer_tuple(&peer));
    let connection = Connection {
      proxy: self,
      id,
      shared: sync::Mutex::new(Shared {
        inspector: inspect::Inspector::new(self.rules.clone(), self.window),
        msg_id: 0,
      }),
      gate: (sync::Mutex::new(Gate::default()), sync::Condvar::new()),
    };
    crossbeam_utils::thread::scope(|scope| {
      scope.spawn(|_| connection.relay(client, &server, rules::Side::Client));
      connection.relay(&server, client, rules::Side::Server);
    })
    .map_err(|_| anyhow::anyhow!("relay thread panicked"))?;
    Ok(())
  }
}

struct Shared {
  inspector: inspect::Inspector,
  msg_id: u32,
}

#[derive(Default)]
struct Gate {
  client_ready: bool,
  dead: bool,
}

enum Preamble {
  /// Accumulating the client's little-endian length prefix.
  Length { bytes: [u8; 4], have: usize },
  /// Forwarding the client's uninspected negotiation blob.
  Body { remaining: u64 },
  /// Forwarding the server's fixed status prefix.
  Status { remaining: usize },
  Done,
}

struct Connection<'a> {
  proxy: &'a Proxy,
  id: u32,
  shared: sync::Mutex<Shared>,
  gate: (sync::Mutex<Gate>, sync::Condvar),
}

impl Connection<'_> {
  fn relay(&self, from: &net::TcpStream, to: &net::TcpStream, side: rules::Side) {
    if let Err(error) = self.shuttle(from, to, side) {
      log::debug!("connection {} {side:?} relay ended: {error:?}", self.id);
      from.shutdown(net::Shutdown::Both).ok();
      to.shutdown(net::Shutdown::Both).ok();
    }
    // Wake a peer thread still parked on the negotiate gate.
    let (gate, opened) = &self.gate;
    gate.lock().unwrap().dead = true;
    opened.notify_all();
  }

  fn shuttle(
    &self,
    from: &net::TcpStream,
    to: &net::TcpStream,
    side: rules::Side,
  ) -> anyhow::Result<()> {
    let mut preamble = match (self.proxy.negotiate, side) {
      (false, _) => Preamble::Done,
      (true, rules::Side::Client) => Preamble::Length { bytes: [0; 4], have: 0 },
      (true, rules::Side::Server) => Preamble::Status { remaining: 4 },
    };
    // Nothing from the server moves before the client's preamble is through;
    // a connection whose client stays silent just idles here.
    if matches!(preamble, Preamble::Status { .. }) && !self.client_preamble_done() {
      return Ok(());
    }
    let mut buffer = [0; 32 * 1024];
    loop {
      let length = match (&mut &*from).read(&mut buffer) {
        Ok(0) => break,
        Ok(length) => length,
        Err(error) => return Err(error).context("read failed"),
      };
      log::debug!(
        "connection {} {side:?} > {}",
        self.id,
        escape(&buffer[..length])
      );
      let mut chunk = &buffer[..length];
      while !chunk.is_empty() {
        match &mut preamble {
          Preamble::Done => {
            if !self.forward_inspected(to, side, chunk)? {
              // No byte of a blocked chunk reaches the peer, in either
              // direction.
              from.shutdown(net::Shutdown::Both).ok();
              to.shutdown(net::Shutdown::Both).ok();
              return Ok(());
            }
            chunk = &[];
          }
          Preamble::Length { bytes, have } => {
            let take = chunk.len().min(4 - *have);
            bytes[*have..*have + take].copy_from_slice(&chunk[..take]);
            *have += take;
            (&mut &*to).write_all(&chunk[..take]).context("write failed")?;
            let done = *have == 4;
            let remaining = u32::from_le_bytes(*bytes) as u64;
            chunk = &chunk[take..];
            if done {
              log::debug!(
                "connection {}: skipping a {remaining} byte(s) negotiation blob",
                self.id
              );
              preamble = Preamble::Body { remaining };
              self.finish_client_preamble(&mut preamble);
            }
          }
          Preamble::Body { remaining } => {
            let take = chunk.len().min(usize::try_from(*remaining).unwrap_or(usize::MAX));
            (&mut &*to).write_all(&chunk[..take]).context("write failed")?;
            *remaining -= take as u64;
            chunk = &chunk[take..];
            self.finish_client_preamble(&mut preamble);
          }
          Preamble::Status { remaining } => {
            let take = chunk.len().min(*remaining);
            (&mut &*to).write_all(&chunk[..take]).context("write failed")?;
            *remaining -= take;
            chunk = &chunk[take..];
            if *remaining == 0 {
              preamble = Preamble::Done;
            }
          }
        }
      }
    }
    // Clean EOF: half-close the peer's write side, the opposite direction
    // may still be flowing.
    to.shutdown(net::Shutdown::Write).ok();
    Ok(())
  }

  /// Runs the chunk through the inspector and forwards what survives.
  /// Returns false when a rule blocked the connection.
  fn forward_inspected(
    &self,
    to: &net::TcpStream,
    side: rules::Side,
    chunk: &[u8],
  ) -> anyhow::Result<bool> {
    let verdict = {
      let mut shared = self.shared.lock().unwrap();
      let verdict = shared.inspector.ingest(side, chunk);
      if !verdict.blocked {
        if let Some(tap) = &self.proxy.tap {
          let Shared { msg_id, .. } = &mut *shared;
          tap.emit(self.id, msg_id, side, &verdict.payload);
        }
      }
      verdict
    };
    if !verdict.matched.is_empty() {
      log::debug!(
        "connection {} {side:?} fired {} rule(s)",
        self.id,
        verdict.matched.len()
      );
    }
    if verdict.blocked {
      return Ok(false);
    }
    (&mut &*to).write_all(&verdict.payload).context("write failed")?;
    Ok(true)
  }

  fn finish_client_preamble(&self, preamble: &mut Preamble) {
    if matches!(preamble, Preamble::Body { remaining: 0 }) {
      *preamble = Preamble::Done;
      let (gate, opened) = &self.gate;
      gate.lock().unwrap().client_ready = true;
      opened.notify_all();
    }
  }

  /// Parks until the client's negotiate preamble went through (true) or the
  /// connection died first (false).
  fn client_preamble_done(&self) -> bool {
    let (gate, opened) = &self.gate;
    let mut gate = gate.lock().unwrap();
    while !gate.client_ready && !gate.dead {
      gate = opened.wait(gate).unwrap();
    }
    gate.client_ready
  }
}
