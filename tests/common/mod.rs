use anyhow::Context as _;
use std::{
  fs,
  io::{self, BufRead as _, Read as _, Write as _},
  net, ops, process, sync, thread, time,
};

#[derive(Debug)]
pub struct Child(process::Child);

impl ops::Drop for Child {
  fn drop(&mut self) {
    if let Err(error) = self.0.kill() {
      log::warn!("couldn't kill {self:?} {error}")
    }
    self.0.wait().ok();
  }
}

pub fn command() -> process::Command {
  process::Command::new(env!("CARGO_BIN_EXE_strainer"))
}

/// Polls a process expected to die on its own (configuration errors); kills
/// it if it unexpectedly keeps serving.
pub fn wait_failure(mut child: process::Child) -> process::ExitStatus {
  let start = time::Instant::now();
  loop {
    if let Some(status) = child.try_wait().unwrap() {
      return status;
    }
    if start.elapsed() > time::Duration::from_secs(10) {
      child.kill().ok();
      child.wait().ok();
      panic!("the filter kept running");
    }
    thread::sleep(time::Duration::from_millis(10));
  }
}

#[derive(Clone)]
pub struct Setup {
  rules: String,
  negotiate: bool,
  buffer_size: Option<u32>,
  max_connections: Option<u32>,
  pcap_port: Option<u16>,
  csid: Option<u32>,
}

impl Setup {
  pub fn new(rules: &str) -> Self {
    Self {
      rules: rules.to_string(),
      negotiate: false,
      buffer_size: None,
      max_connections: None,
      pcap_port: None,
      csid: None,
    }
  }

  pub fn with_negotiate(&self) -> Self {
    Self {
      negotiate: true,
      ..self.clone()
    }
  }

  pub fn with_buffer_size(&self, size: u32) -> Self {
    Self {
      buffer_size: Some(size),
      ..self.clone()
    }
  }

  pub fn with_max_connections(&self, limit: u32) -> Self {
    Self {
      max_connections: Some(limit),
      ..self.clone()
    }
  }

  pub fn with_pcap_port(&self, port: u16) -> Self {
    Self {
      pcap_port: Some(port),
      ..self.clone()
    }
  }

  pub fn with_csid(&self, csid: u32) -> Self {
    Self {
      csid: Some(csid),
      ..self.clone()
    }
  }

  pub fn start(&self) -> anyhow::Result<Filter> {
    let directory = tempfile::tempdir()?;
    let rules = directory.path().join("test.rules");
    fs::write(&rules, &self.rules)?;
    let upstream_port = portpicker::pick_unused_port().with_context(|| "no free port")?;
    let upstream = net::TcpListener::bind((net::Ipv4Addr::LOCALHOST, upstream_port))?;
    let listen_port = portpicker::pick_unused_port().with_context(|| "no free port")?;
    let mut command = command();
    command
      .args(["--listen_port", &listen_port.to_string()])
      .args(["--host", "127.0.0.1"])
      .args(["--port", &upstream_port.to_string()])
      .arg("--rules")
      .arg(&rules)
      .stdout(process::Stdio::piped())
      .stderr(process::Stdio::null());
    if self.negotiate {
      command.arg("--negotiate");
    }
    if let Some(size) = self.buffer_size {
      command.args(["--buffer_size", &size.to_string()]);
    }
    if let Some(limit) = self.max_connections {
      command.args(["--max_connections", &limit.to_string()]);
    }
    if let Some(port) = self.pcap_port {
      command
        .args(["--pcap_host", "127.0.0.1"])
        .args(["--pcap_port", &port.to_string()]);
    }
    if let Some(csid) = self.csid {
      command.args(["--csid", &csid.to_string()]);
    }
    let mut child = command.spawn()?;
    let stdout = child.stdout.take().with_context(|| "no stdout")?;
    let lines = sync::Arc::new(sync::Mutex::new(Vec::new()));
    let sink = lines.clone();
    thread::spawn(move || {
      for line in io::BufReader::new(stdout).lines().map_while(Result::ok) {
        log::debug!("filter: {line}");
        sink.lock().unwrap().push(line);
      }
    });
    let filter = Filter {
      _directory: directory,
      _child: Child(child),
      upstream,
      listen_port,
      lines,
    };
    filter.probe()?;
    Ok(filter)
  }
}

pub struct Filter {
  _directory: tempfile::TempDir,
  _child: Child,
  upstream: net::TcpListener,
  listen_port: u16,
  lines: sync::Arc<sync::Mutex<Vec<String>>>,
}

impl Filter {
  /// Readiness check: one throwaway connection through the filter, then the
  /// captured log lines are reset so tests start from a clean slate.
  fn probe(&self) -> anyhow::Result<()> {
    log::debug!("waiting for the filter to be ready...");
    let start = time::Instant::now();
    let client = loop {
      match net::TcpStream::connect((net::Ipv4Addr::LOCALHOST, self.listen_port)) {
        Ok(stream) => break stream,
        Err(error) => {
          anyhow::ensure!(
            start.elapsed() < time::Duration::from_secs(10),
            "the filter never came up: {error}"
          );
          thread::sleep(time::Duration::from_millis(20));
        }
      }
    };
    let accepted = self.upstream.accept()?;
    drop(client);
    drop(accepted);
    self.wait_for("closed connection from")?;
    self.lines.lock().unwrap().clear();
    Ok(())
  }

  pub fn client(&self) -> anyhow::Result<net::TcpStream> {
    let stream = net::TcpStream::connect((net::Ipv4Addr::LOCALHOST, self.listen_port))?;
    stream.set_nodelay(true)?;
    stream.set_read_timeout(Some(time::Duration::from_secs(5)))?;
    Ok(stream)
  }

  /// The upstream's end of a proxied connection.
  pub fn accept(&self) -> anyhow::Result<net::TcpStream> {
    let (stream, _) = self.upstream.accept()?;
    stream.set_nodelay(true)?;
    stream.set_read_timeout(Some(time::Duration::from_secs(5)))?;
    Ok(stream)
  }

  pub fn logs(&self) -> Vec<String> {
    self.lines.lock().unwrap().clone()
  }

  pub fn wait_for(&self, needle: &str) -> anyhow::Result<()> {
    let start = time::Instant::now();
    while !self.logs().iter().any(|line| line.contains(needle)) {
      anyhow::ensure!(
        start.elapsed() < time::Duration::from_secs(5),
        "no {needle:?} in {:#?}",
        self.logs()
      );
      thread::sleep(time::Duration::from_millis(10));
    }
    Ok(())
  }

  /// Waits until all needles showed up in the captured lines, in order.
  pub fn assert_logged(&self, needles: &[&str]) {
    let start = time::Instant::now();
    loop {
      let logs = self.logs();
      let mut position = 0;
      let mut found = 0;
      for needle in needles {
        match logs[position..].iter().position(|line| line.contains(needle)) {
          Some(next) => {
            position += next + 1;
            found += 1;
          }
          None => break,
        }
      }
      if found == needles.len() {
        return;
      }
      assert!(
        start.elapsed() < time::Duration::from_secs(5),
        "expected {needles:?} in order, got {logs:#?}"
      );
      thread::sleep(time::Duration::from_millis(10));
    }
  }

  /// Lets in-flight log lines settle, then checks the needle never showed.
  pub fn assert_not_logged(&self, needle: &str) {
    thread::sleep(time::Duration::from_millis(300));
    let logs = self.logs();
    assert!(
      !logs.iter().any(|line| line.contains(needle)),
      "unexpected {needle:?} in {logs:#?}"
    );
  }
}

pub fn send(stream: &mut net::TcpStream, bytes: &[u8]) -> anyhow::Result<()> {
  Ok(stream.write_all(bytes)?)
}

pub fn recv(stream: &mut net::TcpStream, length: usize) -> anyhow::Result<Vec<u8>> {
  let mut bytes = vec![0; length];
  stream.read_exact(&mut bytes)?;
  Ok(bytes)
}

pub fn expect_eof(stream: &mut net::TcpStream) {
  let mut byte = [0; 1];
  match stream.read(&mut byte) {
    Ok(0) | Err(_) => (), // a reset counts as closed
    Ok(_) => panic!("expected the connection to be closed"),
  }
}

/// Deterministic pseudo-random payload, distinct per seed.
pub fn noise(seed: u64, length: usize) -> Vec<u8> {
  let mut state = seed.wrapping_mul(0x9e3779b97f4a7c15).wrapping_add(1);
  (0..length)
    .map(|_| {
      state = state
        .wrapping_mul(6364136223846793005)
        .wrapping_add(1442695040888963407);
      (state >> 33) as u8
    })
    .collect()
}
