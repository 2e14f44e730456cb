use clap::Parser;
use hickory_resolver::config::{ResolverConfig, ResolverOpts};
use hickory_resolver::TokioAsyncResolver;
use tracing::info;
use voyager_probe::{
    control, icmp, Args, IcmpListener, ResponseMap, Result, TargetManager, VoyagerClient,
    VoyagerConfig, WorkerContext,
};

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = if args.debug {
        "voyager_probe=debug"
    } else {
        "voyager_probe=info"
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("starting voyager-probe v0.3.0");

    let config = VoyagerConfig::from_env()?;

    // one raw ICMP socket per host; listener and sweeper must be up
    // before the first worker fires a probe
    let responses = ResponseMap::new();
    IcmpListener::bind(responses.clone())?.spawn();
    icmp::spawn_sweeper(responses.clone());

    let resolver = TokioAsyncResolver::tokio(ResolverConfig::default(), ResolverOpts::default());
    let client = VoyagerClient::new(&config)?;
    let manager = TargetManager::new(WorkerContext {
        client,
        responses,
        resolver,
    });

    manager.reconcile(0).await;

    tokio::select! {
        _ = control::run(manager, config) => {}
        _ = tokio::signal::ctrl_c() => {
            info!("interrupt received, shutting down");
        }
    }

    Ok(())
}
