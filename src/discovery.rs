//! Server discovery
//!
//! Finds the media server the local player is already talking to, then asks
//! it for its JSON-RPC port.
//!
//! 1. Passive scan: the player keeps a slimproto TCP session to the server on
//!    port 3483, so an ESTABLISHED row with that remote port in
//!    `/proc/net/tcp` gives the server address.
//! 2. Active probe: a TLV discovery request goes to the server's UDP port
//!    3483; the `JSON` record of the reply carries the control port.
//!
//! Example probe with socat:
//! ```bash
//! echo -ne "eIPAD\x00NAME\x00JSON\x00UUID\x00\x00\x00" | socat -t5 - udp-datagram:192.168.1.10:3483 | od -Ax -bc
//! ```

use serde::Serialize;
use std::fs;
use std::io;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, ToSocketAddrs, UdpSocket};
use std::path::PathBuf;
use tracing::{debug, info, warn};

/// Remote port of the player's slimproto session.
pub const SLIMPROTO_PORT: u16 = 3483;
/// UDP port the server answers discovery requests on.
pub const DISCOVERY_PORT: u16 = 3483;
/// Control port assumed when a reply carries no `JSON` record.
pub const DEFAULT_JSON_PORT: u16 = 9000;
/// Passive scan cadence.
pub const SCAN_INTERVAL_MS: u64 = 3000;
/// Silent polls before the discovery request is sent again.
pub const PROBE_RETRY_POLLS: u32 = 30;

/// Asks for address, name, JSON port and UUID. Two trailing pad bytes.
pub const DISCOVERY_REQUEST: &[u8; 23] = b"eIPAD\0NAME\0JSON\0UUID\0\0\0";

const TCP_ESTABLISHED: u8 = 0x01;
const RECV_BUFFER: usize = 1600;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub enum DiscoveryStatus {
    Unresolved,
    HostKnown,
    FullyResolved,
}

/// Where commands go. Status only ever moves forward.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServerLocation {
    host: Option<String>,
    port: Option<u16>,
    status: DiscoveryStatus,
}

impl ServerLocation {
    pub fn new(host: Option<String>, port: Option<u16>) -> Self {
        let status = match (&host, port) {
            (Some(_), Some(_)) => DiscoveryStatus::FullyResolved,
            (Some(_), None) => DiscoveryStatus::HostKnown,
            (None, _) => DiscoveryStatus::Unresolved,
        };
        ServerLocation { host, port, status }
    }

    pub fn host(&self) -> Option<&str> {
        self.host.as_deref()
    }

    pub fn port(&self) -> Option<u16> {
        self.port
    }

    pub fn status(&self) -> DiscoveryStatus {
        self.status
    }

    pub fn is_resolved(&self) -> bool {
        self.status == DiscoveryStatus::FullyResolved
    }

    fn set_host(&mut self, host: String) {
        self.host = Some(host);
        self.advance();
    }

    fn set_port(&mut self, port: u16) {
        self.port = Some(port);
        self.advance();
    }

    fn advance(&mut self) {
        let next = ServerLocation::new(self.host.clone(), self.port).status;
        self.status = self.status.max(next);
    }
}

/// Source of the live TCP connection listing.
pub trait ConnectionTable {
    fn snapshot(&mut self) -> io::Result<String>;
}

pub struct ProcNetTcp {
    path: PathBuf,
}

impl Default for ProcNetTcp {
    fn default() -> Self {
        ProcNetTcp {
            path: PathBuf::from("/proc/net/tcp"),
        }
    }
}

impl ConnectionTable for ProcNetTcp {
    fn snapshot(&mut self) -> io::Result<String> {
        fs::read_to_string(&self.path)
    }
}

/// Parses a `/proc/net/tcp` address field (`0100007F:0D9B`).
///
/// The address is the kernel's hex dump of a network-order `u32`, so the
/// bytes come out reversed.
fn parse_address(field: &str) -> Option<(Ipv4Addr, u16)> {
    let (addr, port) = field.split_once(':')?;
    let addr = u32::from_str_radix(addr, 16).ok()?;
    let port = u16::from_str_radix(port, 16).ok()?;
    Some((Ipv4Addr::from(addr.to_le_bytes()), port))
}

/// Finds the remote address of an established slimproto session.
pub fn find_server(table: &str) -> Option<Ipv4Addr> {
    for line in table.lines().skip(1) {
        let mut fields = line.split_whitespace();
        let (Some(remote), Some(state)) = (fields.nth(2), fields.next()) else {
            debug!(line, "Skipping short connection table line");
            continue;
        };
        let Some((addr, port)) = parse_address(remote) else {
            continue;
        };
        let Ok(state) = u8::from_str_radix(state, 16) else {
            continue;
        };
        if port == SLIMPROTO_PORT && state == TCP_ESTABLISHED {
            return Some(addr);
        }
    }
    None
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TlvType {
    Name,
    Json,
    Uuid,
    Unknown,
}

impl TlvType {
    fn from_tag(tag: &[u8]) -> Self {
        match tag {
            b"NAME" => TlvType::Name,
            b"JSON" => TlvType::Json,
            b"UUID" => TlvType::Uuid,
            _ => TlvType::Unknown,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveryReply {
    pub json_port: u16,
    pub name: Option<String>,
    pub uuid: Option<String>,
}

/// Parses a discovery reply: `'E'` then tag(4) + length(1) + value records.
///
/// Anything malformed (wrong marker, truncated record, non-numeric or zero
/// port) gives `None`, the same as no reply at all.
pub fn parse_reply(data: &[u8]) -> Option<DiscoveryReply> {
    let (&marker, mut rest) = data.split_first()?;
    if marker != b'E' {
        debug!(marker, "Server discovery: not a reply");
        return None;
    }

    let mut reply = DiscoveryReply {
        json_port: DEFAULT_JSON_PORT,
        name: None,
        uuid: None,
    };
    while !rest.is_empty() {
        if rest.len() < 5 {
            debug!(remaining = rest.len(), "Server discovery: trailing bytes in reply");
            return None;
        }
        let (tag, len) = (&rest[..4], rest[4] as usize);
        let Some(value) = rest.get(5..5 + len) else {
            debug!(len, "Server discovery: truncated record");
            return None;
        };
        let text = String::from_utf8_lossy(value).into_owned();
        match TlvType::from_tag(tag) {
            TlvType::Json => reply.json_port = text.trim().parse::<u16>().ok().filter(|&port| port != 0)?,
            TlvType::Name => reply.name = Some(text),
            TlvType::Uuid => reply.uuid = Some(text),
            TlvType::Unknown => {}
        }
        rest = &rest[5 + len..];
    }
    Some(reply)
}

/// An outstanding discovery request.
struct Probe {
    target: SocketAddrV4,
    socket: UdpSocket,
    retry_countdown: u32,
}

impl Probe {
    fn open(host: Ipv4Addr, port: u16) -> io::Result<Self> {
        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))?;
        socket.set_nonblocking(true)?;
        socket.set_broadcast(true)?;
        let probe = Probe {
            target: SocketAddrV4::new(host, port),
            socket,
            retry_countdown: PROBE_RETRY_POLLS,
        };
        probe.send()?;
        Ok(probe)
    }

    fn send(&self) -> io::Result<()> {
        self.socket.send_to(DISCOVERY_REQUEST, self.target)?;
        debug!(server = %self.target, "Sent server discovery request");
        Ok(())
    }

    /// Non-blocking check for a reply.
    fn poll(&mut self) -> Option<DiscoveryReply> {
        let mut buf = [0u8; RECV_BUFFER];
        loop {
            match self.socket.recv_from(&mut buf) {
                Ok((len, from)) => {
                    debug!(%from, len, "Server discovery: packet found");
                    if let Some(reply) = parse_reply(&buf[..len]) {
                        return Some(reply);
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    debug!("Server discovery receive failed: {}", e);
                    break;
                }
            }
        }

        self.retry_countdown = self.retry_countdown.saturating_sub(1);
        if self.retry_countdown == 0 {
            self.retry_countdown = PROBE_RETRY_POLLS;
            if let Err(e) = self.send() {
                warn!(server = %self.target, "Could not resend discovery request: {}", e);
            }
        } else {
            debug!("Server discovery: no reply, yet");
        }
        None
    }
}

/// Two-phase discovery state machine. Call `poll` once per loop cycle.
pub struct Discovery {
    location: ServerLocation,
    scan_host: bool,
    probe_port: bool,
    table: Box<dyn ConnectionTable + Send>,
    discovery_port: u16,
    scan_interval_ms: u64,
    last_scan_ms: Option<u64>,
    last_probe_attempt_ms: Option<u64>,
    candidate: Option<Ipv4Addr>,
    probe: Option<Probe>,
}

impl Discovery {
    /// `host` and `port` are the externally configured values; whichever is
    /// given is never searched for.
    pub fn new(host: Option<String>, port: Option<u16>) -> Self {
        let candidate = match port {
            None => host.as_deref().and_then(resolve_ipv4),
            Some(_) => None,
        };
        Discovery {
            scan_host: host.is_none(),
            probe_port: port.is_none(),
            location: ServerLocation::new(host, port),
            table: Box::new(ProcNetTcp::default()),
            discovery_port: DISCOVERY_PORT,
            scan_interval_ms: SCAN_INTERVAL_MS,
            last_scan_ms: None,
            last_probe_attempt_ms: None,
            candidate,
            probe: None,
        }
    }

    pub fn with_table(mut self, table: impl ConnectionTable + Send + 'static) -> Self {
        self.table = Box::new(table);
        self
    }

    pub fn with_discovery_port(mut self, port: u16) -> Self {
        self.discovery_port = port;
        self
    }

    pub fn location(&self) -> &ServerLocation {
        &self.location
    }

    pub fn status(&self) -> DiscoveryStatus {
        self.location.status()
    }

    pub fn poll(&mut self, now_ms: u64) {
        if self.location.is_resolved() {
            return;
        }
        if self.scan_host && self.due(self.last_scan_ms, now_ms) {
            self.last_scan_ms = Some(now_ms);
            self.scan();
        }
        if self.probe_port {
            self.probe(now_ms);
        }
    }

    fn due(&self, last: Option<u64>, now_ms: u64) -> bool {
        last.is_none_or(|last| now_ms.saturating_sub(last) >= self.scan_interval_ms)
    }

    fn scan(&mut self) {
        let table = match self.table.snapshot() {
            Ok(table) => table,
            Err(e) => {
                debug!("Connection table not readable: {}", e);
                return;
            }
        };
        let Some(addr) = find_server(&table) else {
            debug!("New or changed server address not found");
            return;
        };
        if self.candidate == Some(addr) {
            debug!(%addr, "Found server, same as before");
            return;
        }
        info!(%addr, "Server address found");
        self.candidate = Some(addr);
        self.location.set_host(addr.to_string());
        // a new host invalidates any request sent to the old one
        self.probe = None;
        self.last_probe_attempt_ms = None;
    }

    fn probe(&mut self, now_ms: u64) {
        let Some(candidate) = self.candidate else {
            return;
        };
        if self.probe.is_none() && self.due(self.last_probe_attempt_ms, now_ms) {
            self.last_probe_attempt_ms = Some(now_ms);
            match Probe::open(candidate, self.discovery_port) {
                Ok(probe) => self.probe = Some(probe),
                Err(e) => warn!(%candidate, "Could not send discovery request: {}", e),
            }
        }
        let Some(reply) = self.probe.as_mut().and_then(Probe::poll) else {
            return;
        };
        info!(
            port = reply.json_port,
            name = reply.name.as_deref().unwrap_or(""),
            uuid = reply.uuid.as_deref().unwrap_or(""),
            "Server control port found"
        );
        self.location.set_port(reply.json_port);
        self.probe = None;
    }
}

fn resolve_ipv4(host: &str) -> Option<Ipv4Addr> {
    let addrs = match (host, DISCOVERY_PORT).to_socket_addrs() {
        Ok(addrs) => addrs,
        Err(e) => {
            warn!(host, "Could not resolve configured server: {}", e);
            return None;
        }
    };
    addrs
        .filter_map(|addr| match addr {
            SocketAddr::V4(v4) => Some(*v4.ip()),
            SocketAddr::V6(_) => None,
        })
        .next()
}
