//! Per-target probe orchestration: one supervised task per destination,
//! ticking at the target's interval and spawning a detached cycle runner
//! on each tick.

use std::net::Ipv4Addr;
use std::time::Duration;

use anyhow::anyhow;
use chrono::Utc;
use futures::future::join_all;
use hickory_resolver::TokioAsyncResolver;
use tokio::sync::watch;
use tokio::time::{interval, interval_at, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::client::VoyagerClient;
use crate::icmp::ResponseMap;
use crate::probe::{Probe, ProbeExecutor, ProbeTarget};

/// Everything a worker needs besides its target; cheap to clone, shared
/// by all workers.
#[derive(Clone)]
pub struct WorkerContext {
    pub client: VoyagerClient,
    pub responses: ResponseMap,
    pub resolver: TokioAsyncResolver,
}

/// Supervised loop for one destination. Fires a cycle immediately on
/// start, then on every interval tick until cancelled. A long cycle never
/// delays the next tick: each cycle runs detached, so overlap is allowed.
///
/// Cancellation stops the scheduling of new cycles only; in-flight cycles
/// finish on their own (every wait inside a cycle is deadline-bounded).
pub async fn run(
    target_rx: watch::Receiver<ProbeTarget>,
    cancel: CancellationToken,
    ctx: WorkerContext,
) {
    let mut snapshot = target_rx.borrow().clone();
    info!(destination = %snapshot.destination, interval = snapshot.interval, "prober task started");

    let mut ticker = interval(tick_period(&snapshot));
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!(destination = %snapshot.destination, "halt requested, stopping prober task");
                return;
            }
            _ = ticker.tick() => {
                debug!(destination = %snapshot.destination, "ticked");
                let current = target_rx.borrow().clone();
                if current.interval != snapshot.interval {
                    info!(
                        destination = %current.destination,
                        from = snapshot.interval,
                        to = current.interval,
                        "interval update received"
                    );
                    let period = tick_period(&current);
                    ticker = interval_at(Instant::now() + period, period);
                }
                snapshot = current;

                let ctx = ctx.clone();
                let target = snapshot.clone();
                tokio::spawn(async move {
                    run_cycle(target, ctx).await;
                });
            }
        }
    }
}

fn tick_period(target: &ProbeTarget) -> Duration {
    Duration::from_secs(target.interval.max(1))
}

/// One full probe cycle: resolve, sweep, enrich, publish. Every failure
/// is terminal for this cycle only.
pub async fn run_cycle(target: ProbeTarget, ctx: WorkerContext) {
    let start_time = Utc::now();

    let executor = match ProbeExecutor::for_protocol(target.protocol, ctx.responses.clone()) {
        Ok(executor) => executor,
        Err(err) => {
            warn!(destination = %target.destination, %err, "skipping probe cycle");
            return;
        }
    };

    let address = match resolve_target(&ctx.resolver, &target.destination).await {
        Ok(address) => address,
        Err(err) => {
            warn!(destination = %target.destination, %err, "target unresolvable this round");
            return;
        }
    };

    let mut hops = executor
        .execute(address, target.port, target.probe_count.max(1))
        .await;

    // reverse lookups run concurrently, one per answered hop
    let pending: Vec<(usize, String)> = hops
        .iter()
        .enumerate()
        .filter_map(|(index, hop)| hop.ip.clone().map(|ip| (index, ip)))
        .collect();
    let names = join_all(
        pending
            .iter()
            .map(|(_, ip)| reverse_lookup(&ctx.resolver, ip)),
    )
    .await;
    for ((index, _), name) in pending.into_iter().zip(names) {
        hops[index].dns_name = name;
    }

    let probe = Probe {
        target: target.destination.clone(),
        start_time,
        end_time: Utc::now(),
        hops,
    };

    if let Err(err) = ctx.client.publish(&probe).await {
        warn!(destination = %target.destination, %err, "dropping unpublished probe");
    } else {
        debug!(destination = %target.destination, hops = probe.hops.len(), "probe published");
    }
}

/// A-record resolution, first address wins. Literal IPv4 destinations
/// skip the resolver.
async fn resolve_target(resolver: &TokioAsyncResolver, destination: &str) -> anyhow::Result<Ipv4Addr> {
    if let Ok(address) = destination.parse::<Ipv4Addr>() {
        return Ok(address);
    }
    let lookup = resolver.ipv4_lookup(destination).await?;
    lookup
        .iter()
        .next()
        .map(|a| a.0)
        .ok_or_else(|| anyhow!("no A records for {destination}"))
}

async fn reverse_lookup(resolver: &TokioAsyncResolver, ip: &str) -> Option<String> {
    let address: std::net::IpAddr = ip.parse().ok()?;
    match resolver.reverse_lookup(address).await {
        Ok(lookup) => lookup.iter().next().map(|name| name.to_string()),
        Err(err) => {
            debug!(%address, %err, "reverse lookup failed");
            None
        }
    }
}
