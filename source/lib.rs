// An inline TCP filter: accepts clients, pairs each with one upstream
// connection, mirrors bytes both ways and runs a rule file over the streams.
// Rules can alert, rewrite bytes in flight, silently admit inspected data,
// or tear the connection down.

use anyhow::Context as _;
use std::{
  fs,
  net::{self, ToSocketAddrs as _},
  path, sync,
};

mod buffer;
mod inspect;
mod proxy;
pub mod rules;
mod tap;

#[derive(clap::Args)]
#[group(skip)]
pub struct Arguments {
  #[arg(long = "listen_port", help = "Local port to accept clients on")]
  pub listen_port: u16,
  #[arg(long = "host", help = "Upstream host")]
  pub host: String,
  #[arg(long = "port", help = "Upstream port")]
  pub port: u16,
  #[arg(long = "rules", help = "Rule file path (an empty file means no rules)")]
  pub rules: path::PathBuf,

  #[arg(long = "max_connections", help = "Cap on concurrent connections")]
  pub max_connections: Option<u32>,
  #[arg(
    long = "negotiate",
    help = "Pass an initial length-prefixed negotiation exchange through uninspected"
  )]
  pub negotiate: bool,
  #[arg(
    long = "buffer_size",
    help = "Inspection window per direction (in bytes)",
    default_value_t = 4096
  )]
  pub buffer_size: u32,

  #[arg(long = "pcap_host", help = "Packet tap host", requires = "pcap_port")]
  pub pcap_host: Option<String>,
  #[arg(long = "pcap_port", help = "Packet tap port", requires = "pcap_host")]
  pub pcap_port: Option<u16>,
  #[arg(
    long = "csid",
    help = "Channel id stamped into tap datagrams",
    default_value_t = 0
  )]
  pub csid: u32,

  #[arg(long = "debug", help = "Verbose logging")]
  pub debug: bool,
}

pub fn run(arguments: &Arguments) -> anyhow::Result<()> {
  let text = fs::read(&arguments.rules)
    .with_context(|| format!("couldn't read rule file {:?}", arguments.rules))?;
  let rules = rules::compile(rules::parse(&text)?)
    .with_context(|| format!("couldn't load rule file {:?}", arguments.rules))?;
  log::debug!("loaded {} rule(s) from {:?}", rules.len(), arguments.rules);

  let upstream = (arguments.host.as_str(), arguments.port)
    .to_socket_addrs()
    .ok()
    .and_then(|mut addresses| addresses.next())
    .with_context(|| format!("couldn't resolve {}:{}", arguments.host, arguments.port))?;
  let tap = match (&arguments.pcap_host, arguments.pcap_port) {
    (Some(host), Some(port)) => Some(tap::Tap::open(host, port, arguments.csid)?),
    _ => None,
  };
  let listener = net::TcpListener::bind((net::Ipv4Addr::UNSPECIFIED, arguments.listen_port))
    .with_context(|| format!("couldn't bind port {}", arguments.listen_port))?;

  sync::Arc::new(proxy::Proxy {
    rules: sync::Arc::new(rules),
    upstream,
    negotiate: arguments.negotiate,
    window: arguments.buffer_size as usize,
    max_connections: arguments.max_connections,
    tap,
  })
  .serve(listener)
}
