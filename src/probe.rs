//! Probe data model and the TTL-sweep executor shared by the UDP and TCP
//! variants.
//!
//! A cycle sweeps TTL 1..=MAX_HOPS, firing `probe_count` packets per TTL
//! concurrently and collecting one [`ProbeResponse`] per packet. The sweep
//! terminates early once any response in a batch comes back from the
//! resolved target itself.

use std::net::Ipv4Addr;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::error::ProbeError;
use crate::icmp::{IcmpReply, ResponseMap};
use crate::tcp::TcpProber;
use crate::udp::UdpProber;

/// TTL sweep ceiling.
pub const MAX_HOPS: u8 = 20;

/// How long each packet waits for a reply (direct or via the rendezvous).
pub const RESPONSE_TIMEOUT: Duration = Duration::from_secs(2);

/// First destination port of the classical UDP traceroute port sweep.
pub const UDP_BASE_PORT: u16 = 33434;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Udp,
    Tcp,
    Icmp,
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Protocol::Udp => write!(f, "udp"),
            Protocol::Tcp => write!(f, "tcp"),
            Protocol::Icmp => write!(f, "icmp"),
        }
    }
}

/// Immutable snapshot of one probe assignment, as served by the controller.
///
/// Destinations are unique within a target set; the controller models any
/// field change as remove + add.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProbeTarget {
    pub destination: String,
    #[serde(rename = "probe_type")]
    pub protocol: Protocol,
    pub port: u16,
    /// Seconds between probe cycles.
    pub interval: u64,
    /// Parallel packets per TTL.
    pub probe_count: usize,
}

/// One recorded round-trip attempt at a specific TTL.
#[derive(Debug, Clone, Serialize)]
pub struct ProbeResponse {
    pub ip: Option<String>,
    pub dns_name: Option<String>,
    #[serde(rename = "response_time")]
    pub response_time_ms: i64,
    pub responded: bool,
    pub ttl: u8,
    #[serde(skip)]
    pub header_source: Option<Ipv4Addr>,
    #[serde(skip)]
    pub header_dest: Option<Ipv4Addr>,
}

impl ProbeResponse {
    pub fn unanswered(ttl: u8) -> Self {
        Self {
            ip: None,
            dns_name: None,
            response_time_ms: 0,
            responded: false,
            ttl,
            header_source: None,
            header_dest: None,
        }
    }

    /// Fill in a response from the ICMP reply a router sent back for the
    /// packet dispatched at `sent`.
    pub fn from_reply(ttl: u8, sent: Instant, reply: &IcmpReply) -> Self {
        let rtt = reply.timestamp.saturating_duration_since(sent);
        Self {
            ip: Some(reply.source.to_string()),
            dns_name: None,
            response_time_ms: rtt.as_millis() as i64,
            responded: true,
            ttl,
            header_source: Some(reply.original_header.source),
            header_dest: Some(reply.original_header.destination),
        }
    }
}

/// One completed probe cycle, as shipped to the ingestion API.
#[derive(Debug, Clone, Serialize)]
pub struct Probe {
    pub target: String,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub hops: Vec<ProbeResponse>,
}

/// Protocol-selected probe variant. The orchestrator builds one per cycle
/// and only ever calls [`execute`](Self::execute); it never branches on
/// the protocol itself.
#[derive(Debug, Clone)]
pub enum ProbeExecutor {
    Udp(UdpProber),
    Tcp(TcpProber),
}

impl ProbeExecutor {
    pub fn for_protocol(protocol: Protocol, responses: ResponseMap) -> Result<Self, ProbeError> {
        match protocol {
            Protocol::Udp => Ok(Self::Udp(UdpProber::new(responses))),
            Protocol::Tcp => Ok(Self::Tcp(TcpProber::new(responses))),
            // Echo-request probes need the sequence number of the echoed
            // header for correlation, which the listener does not extract
            // yet.
            Protocol::Icmp => Err(ProbeError::UnsupportedProtocol(protocol.to_string())),
        }
    }

    /// Run one full TTL sweep toward `target`, `count` packets per TTL.
    ///
    /// Responses are appended per batch, in completion order inside a
    /// batch. Per-packet failures are logged and recorded as unanswered;
    /// they never abort the sweep.
    pub async fn execute(&self, target: Ipv4Addr, port: u16, count: usize) -> Vec<ProbeResponse> {
        info!(%target, %port, "starting {} probes", self.protocol());
        let target_text = target.to_string();

        let mut hops: Vec<ProbeResponse> = Vec::new();
        let mut packet_index: u16 = 0;
        for ttl in 1..=MAX_HOPS {
            let mut batch = JoinSet::new();
            for _ in 0..count {
                match self {
                    Self::Udp(prober) => {
                        let prober = prober.clone();
                        let dst_port = UDP_BASE_PORT.wrapping_add(packet_index);
                        batch.spawn(async move { prober.probe_once(target, dst_port, ttl).await });
                    }
                    Self::Tcp(prober) => {
                        let prober = prober.clone();
                        batch.spawn(async move { prober.probe_once(target, port, ttl).await });
                    }
                }
                packet_index += 1;
            }

            let mut responses = Vec::with_capacity(count);
            while let Some(joined) = batch.join_next().await {
                match joined {
                    Ok(response) => responses.push(response),
                    Err(err) => {
                        warn!(%target, ttl, %err, "probe task panicked");
                        responses.push(ProbeResponse::unanswered(ttl));
                    }
                }
            }

            let reached = batch_reached(&responses, &target_text);
            hops.append(&mut responses);

            if reached {
                debug!(%target, ttl, "destination answered, stopping sweep");
                info!(%target, "probe complete");
                break;
            }
            if ttl == MAX_HOPS {
                info!(%target, "max hops exceeded");
            }
        }

        hops
    }

    fn protocol(&self) -> Protocol {
        match self {
            Self::Udp(_) => Protocol::Udp,
            Self::Tcp(_) => Protocol::Tcp,
        }
    }
}

/// A sweep is finished once any packet in the batch came back from the
/// resolved target itself.
fn batch_reached(batch: &[ProbeResponse], target: &str) -> bool {
    batch.iter().any(|r| r.ip.as_deref() == Some(target))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protocol_serde_lowercase() {
        assert_eq!(serde_json::to_string(&Protocol::Udp).unwrap(), "\"udp\"");
        assert_eq!(
            serde_json::from_str::<Protocol>("\"tcp\"").unwrap(),
            Protocol::Tcp
        );
    }

    #[test]
    fn test_probe_target_wire_format() {
        let json = r#"{
            "destination": "8.8.8.8",
            "interval": 10,
            "probe_count": 3,
            "probe_type": "udp",
            "port": 33434
        }"#;
        let target: ProbeTarget = serde_json::from_str(json).unwrap();
        assert_eq!(target.destination, "8.8.8.8");
        assert_eq!(target.protocol, Protocol::Udp);
        assert_eq!(target.port, 33434);
        assert_eq!(target.interval, 10);
        assert_eq!(target.probe_count, 3);
    }

    #[test]
    fn test_unanswered_response_carries_only_ttl() {
        let response = ProbeResponse::unanswered(7);
        assert_eq!(response.ttl, 7);
        assert!(!response.responded);
        assert!(response.ip.is_none());
        assert!(response.dns_name.is_none());
        assert_eq!(response.response_time_ms, 0);
    }

    #[test]
    fn test_probe_json_shape() {
        let probe = Probe {
            target: "8.8.8.8".to_string(),
            start_time: Utc::now(),
            end_time: Utc::now(),
            hops: vec![ProbeResponse {
                ip: Some("10.0.0.1".to_string()),
                dns_name: None,
                response_time_ms: 12,
                responded: true,
                ttl: 1,
                header_source: Some(Ipv4Addr::new(192, 168, 1, 10)),
                header_dest: Some(Ipv4Addr::new(8, 8, 8, 8)),
            }],
        };

        let value = serde_json::to_value(&probe).unwrap();
        let hop = &value["hops"][0];
        assert_eq!(hop["ip"], "10.0.0.1");
        assert_eq!(hop["dns_name"], serde_json::Value::Null);
        assert_eq!(hop["response_time"], 12);
        assert_eq!(hop["responded"], true);
        assert_eq!(hop["ttl"], 1);
        // the echoed header addresses are internal only
        assert!(hop.get("header_source").is_none());
        assert!(hop.get("header_dest").is_none());
        assert!(value["start_time"].is_string());
    }

    #[test]
    fn test_batch_reached_only_on_target_address() {
        let mut batch = vec![ProbeResponse::unanswered(3), ProbeResponse::unanswered(3)];
        assert!(!batch_reached(&batch, "8.8.8.8"));

        batch[1].ip = Some("10.0.0.1".to_string());
        batch[1].responded = true;
        assert!(!batch_reached(&batch, "8.8.8.8"));

        batch[0].ip = Some("8.8.8.8".to_string());
        batch[0].responded = true;
        assert!(batch_reached(&batch, "8.8.8.8"));
    }

    #[test]
    fn test_executor_rejects_icmp_for_now() {
        let err = ProbeExecutor::for_protocol(Protocol::Icmp, ResponseMap::new()).unwrap_err();
        assert!(matches!(err, ProbeError::UnsupportedProtocol(_)));
    }
}
