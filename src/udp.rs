//! UDP traceroute variant: classical high-port sweep with per-packet
//! connected sockets.

use std::net::Ipv4Addr;
use std::time::Instant;

use tokio::net::UdpSocket;
use tracing::{debug, warn};

use crate::error::ProbeError;
use crate::icmp::{response_key, ResponseMap};
use crate::probe::{ProbeResponse, Protocol, RESPONSE_TIMEOUT};

/// Payload carried by every probe datagram; routers drop the packet on
/// TTL expiry before anything reads it.
const PROBE_PAYLOAD: &[u8] = b"test";

#[derive(Debug, Clone)]
pub struct UdpProber {
    responses: ResponseMap,
}

impl UdpProber {
    pub fn new(responses: ResponseMap) -> Self {
        Self { responses }
    }

    /// Fire one datagram at `target:dst_port` with the given TTL and wait
    /// for the matching ICMP reply. Socket errors and reply timeouts both
    /// come back as an unanswered response.
    pub async fn probe_once(&self, target: Ipv4Addr, dst_port: u16, ttl: u8) -> ProbeResponse {
        match self.send_and_wait(target, dst_port, ttl).await {
            Ok(response) => response,
            Err(err) => {
                warn!(%target, dst_port, ttl, %err, "udp probe failed");
                ProbeResponse::unanswered(ttl)
            }
        }
    }

    async fn send_and_wait(
        &self,
        target: Ipv4Addr,
        dst_port: u16,
        ttl: u8,
    ) -> Result<ProbeResponse, ProbeError> {
        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).await?;
        socket.set_ttl(u32::from(ttl))?;
        socket.connect((target, dst_port)).await?;
        let src_port = socket.local_addr()?.port();

        let sent = Instant::now();
        socket.send(PROBE_PAYLOAD).await?;
        // a TTL sweep opens many of these; close before the reply wait
        drop(socket);

        let key = response_key(Protocol::Udp, src_port, target, dst_port);
        match self.responses.lookup(&key, RESPONSE_TIMEOUT).await {
            Ok(reply) => Ok(ProbeResponse::from_reply(ttl, sent, &reply)),
            Err(ProbeError::ResponseLookupTimeout(key)) => {
                debug!(%key, ttl, "no reply within timeout");
                Ok(ProbeResponse::unanswered(ttl))
            }
            Err(err) => Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::icmp::{EchoedHeader, IcmpReply};
    use std::net::IpAddr;

    #[tokio::test]
    async fn test_probe_once_correlates_parked_reply() {
        let map = ResponseMap::new();
        let prober = UdpProber::new(map.clone());
        let target = Ipv4Addr::new(127, 0, 0, 1);
        let router = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1));

        // the kernel picks the ephemeral source port, so park a reply for
        // every port it could choose
        for src_port in 1024..=u16::MAX {
            let key = response_key(Protocol::Udp, src_port, target, 33434);
            map.insert(
                key,
                IcmpReply {
                    icmp_type: 11,
                    icmp_code: 0,
                    original_header: EchoedHeader {
                        protocol: Protocol::Udp,
                        source: Ipv4Addr::new(192, 168, 1, 10),
                        destination: target,
                        src_port,
                        dst_port: 33434,
                    },
                    source: router,
                    timestamp: Instant::now(),
                },
            );
        }

        let response = prober.probe_once(target, 33434, 1).await;

        assert!(response.responded);
        assert_eq!(response.ttl, 1);
        assert_eq!(response.ip.as_deref(), Some("10.0.0.1"));
        assert_eq!(response.header_dest, Some(target));
    }

    #[tokio::test]
    async fn test_probe_once_times_out_to_unanswered() {
        let prober = UdpProber::new(ResponseMap::new());
        let response = prober
            .probe_once(Ipv4Addr::new(127, 0, 0, 1), 33434, 3)
            .await;

        assert!(!response.responded);
        assert_eq!(response.ttl, 3);
        assert!(response.ip.is_none());
        assert_eq!(response.response_time_ms, 0);
    }
}
