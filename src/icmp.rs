//! Shared ICMP listener and the keyed rendezvous map that correlates
//! asynchronous replies back to the probe that caused them.
//!
//! The kernel delivers every inbound ICMP datagram to one raw socket, no
//! matter which outbound flow triggered it, so correlation has to happen
//! in user space: the listener parses the original IP header echoed in
//! each reply body, derives a `proto:src_port:dst_ip:dst_port` key, and
//! parks the reply in the map until a waiting probe claims it or it ages
//! out.

use std::collections::HashMap;
use std::mem::MaybeUninit;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use pnet::packet::icmp::IcmpPacket;
use pnet::packet::ip::IpNextHeaderProtocols;
use pnet::packet::ipv4::Ipv4Packet;
use pnet::packet::Packet;
use socket2::{Domain, Protocol as SockProtocol, Socket, Type};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::ProbeError;
use crate::probe::Protocol;

/// How long a lookup waits for its reply to arrive.
pub const PROBE_LOOKUP_TIMEOUT: Duration = Duration::from_secs(2);

/// Cadence at which a waiting lookup re-checks the map.
const LOOKUP_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Replies older than this are fair game for the sweeper.
pub const STALE_THRESHOLD: Duration = Duration::from_secs(60);

/// How often the sweeper runs.
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Ethernet MTU plus a little slack; an ICMP error is far smaller.
const RECV_BUFFER_LEN: usize = 1514;

/// The original IPv4 header (plus the ports from its first payload bytes)
/// that a router echoes back inside an ICMP error message.
#[derive(Debug, Clone)]
pub struct EchoedHeader {
    pub protocol: Protocol,
    pub source: Ipv4Addr,
    pub destination: Ipv4Addr,
    pub src_port: u16,
    pub dst_port: u16,
}

/// One parsed inbound ICMP message waiting to be claimed.
#[derive(Debug, Clone)]
pub struct IcmpReply {
    pub icmp_type: u8,
    pub icmp_code: u8,
    pub original_header: EchoedHeader,
    /// Address the reply itself came from (the router, or the target).
    pub source: IpAddr,
    pub timestamp: Instant,
}

/// Correlation key for one outbound probe packet. The embedded header's
/// destination is used, not the reply source, so concurrent probes toward
/// different targets never collide.
pub fn response_key(protocol: Protocol, src_port: u16, dst: Ipv4Addr, dst_port: u16) -> String {
    format!("{protocol}:{src_port}:{dst}:{dst_port}")
}

/// Keyed rendezvous map shared by the listener and every in-flight probe.
///
/// One entry per key; a claimed entry is removed on read so each reply has
/// at most one consumer.
#[derive(Debug, Clone, Default)]
pub struct ResponseMap {
    inner: Arc<Mutex<HashMap<String, IcmpReply>>>,
}

impl ResponseMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, key: String, reply: IcmpReply) {
        let mut map = self.inner.lock().unwrap();
        if map.insert(key.clone(), reply).is_some() {
            // colliding ephemeral ports in close succession, or stray noise
            warn!(%key, "overwriting unclaimed ICMP reply");
        }
    }

    /// Wait for the reply under `key`, polling until `timeout` elapses.
    /// A hit removes the entry from the map.
    pub async fn lookup(&self, key: &str, timeout: Duration) -> Result<IcmpReply, ProbeError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(reply) = self.inner.lock().unwrap().remove(key) {
                return Ok(reply);
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(ProbeError::ResponseLookupTimeout(key.to_string()));
            }
            tokio::time::sleep(LOOKUP_POLL_INTERVAL).await;
        }
    }

    /// Drop entries older than `threshold` so unsolicited or unclaimed
    /// replies cannot accumulate.
    pub fn remove_stale(&self, threshold: Duration) {
        let mut map = self.inner.lock().unwrap();
        map.retain(|key, reply| {
            let keep = reply.timestamp.elapsed() < threshold;
            if !keep {
                debug!(%key, "dropping stale ICMP reply");
            }
            keep
        });
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Periodically ages unclaimed replies out of the map.
pub fn spawn_sweeper(responses: ResponseMap) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            responses.remove_stale(STALE_THRESHOLD);
        }
    })
}

/// Process-wide listener owning the one raw ICMP socket.
pub struct IcmpListener {
    socket: Socket,
    responses: ResponseMap,
}

impl IcmpListener {
    /// Bind the raw socket. Needs elevated privileges on the host.
    pub fn bind(responses: ResponseMap) -> Result<Self, ProbeError> {
        let socket = Socket::new(Domain::IPV4, Type::RAW, Some(SockProtocol::ICMPV4))?;
        let any: SocketAddr = (Ipv4Addr::UNSPECIFIED, 0).into();
        socket.bind(&any.into())?;
        Ok(Self { socket, responses })
    }

    /// Run the receive loop forever on a blocking thread.
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::task::spawn_blocking(move || self.run())
    }

    fn run(self) {
        info!("starting ICMP listener thread");
        let mut recv_buffer = [MaybeUninit::<u8>::uninit(); RECV_BUFFER_LEN];
        let mut datagram = [0u8; RECV_BUFFER_LEN];
        loop {
            let (len, src) = match self.socket.recv_from(&mut recv_buffer) {
                Ok(pair) => pair,
                Err(err) => {
                    warn!(%err, "ICMP socket read failed");
                    continue;
                }
            };
            let timestamp = Instant::now();
            for i in 0..len {
                datagram[i] = unsafe { recv_buffer[i].assume_init() };
            }

            let Some(source) = src.as_socket().map(|addr| addr.ip()) else {
                warn!("ICMP datagram without a usable source address");
                continue;
            };

            match parse_reply(&datagram[..len], source, timestamp) {
                Ok((key, reply)) => {
                    debug!(%key, src = %reply.source, icmp_type = reply.icmp_type, "icmp reply received");
                    self.responses.insert(key, reply);
                }
                Err(err) => {
                    warn!(%err, src = %source, "skipping undecodable ICMP datagram");
                }
            }
        }
    }
}

/// Decode one inbound datagram into its correlation key and reply record.
///
/// The raw socket hands us the full IP packet; the ICMP body carries 4
/// unused bytes, then the echoed IPv4 header, then the first 8 bytes of
/// the original payload (which start with the src/dst ports for TCP and
/// UDP).
pub fn parse_reply(
    buf: &[u8],
    source: IpAddr,
    timestamp: Instant,
) -> Result<(String, IcmpReply), ProbeError> {
    let outer = Ipv4Packet::new(buf).ok_or(ProbeError::Parse("truncated IPv4 header"))?;
    let icmp =
        IcmpPacket::new(outer.payload()).ok_or(ProbeError::Parse("truncated ICMP message"))?;
    let body = icmp.payload();

    if body.len() < 24 {
        return Err(ProbeError::Parse("ICMP body too short for echoed header"));
    }
    let echoed =
        Ipv4Packet::new(&body[4..24]).ok_or(ProbeError::Parse("truncated echoed header"))?;

    let protocol = match echoed.get_next_level_protocol() {
        IpNextHeaderProtocols::Tcp => Protocol::Tcp,
        IpNextHeaderProtocols::Udp => Protocol::Udp,
        IpNextHeaderProtocols::Icmp => Protocol::Icmp,
        _ => return Err(ProbeError::Parse("unexpected embedded protocol")),
    };

    let (src_port, dst_port) = match protocol {
        Protocol::Tcp | Protocol::Udp => {
            if body.len() < 28 {
                return Err(ProbeError::Parse("ICMP body too short for echoed ports"));
            }
            (
                u16::from_be_bytes([body[24], body[25]]),
                u16::from_be_bytes([body[26], body[27]]),
            )
        }
        // echo probes would correlate on the echoed sequence number instead
        Protocol::Icmp => (0, 0),
    };

    let header = EchoedHeader {
        protocol,
        source: echoed.get_source(),
        destination: echoed.get_destination(),
        src_port,
        dst_port,
    };
    let key = response_key(protocol, src_port, header.destination, dst_port);

    let reply = IcmpReply {
        icmp_type: icmp.get_icmp_type().0,
        icmp_code: icmp.get_icmp_code().0,
        original_header: header,
        source,
        timestamp,
    };

    Ok((key, reply))
}
