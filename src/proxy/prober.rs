use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio::sync::watch;
use tokio::time::{interval_at, timeout, Instant};
use tracing::{debug, info, warn};

use crate::bandwidth::BandwidthTester;
use crate::events::EventSink;
use crate::proxy::connector;
use crate::proxy::descriptor::ProxyDescriptor;
use crate::proxy::pool::ProxyPool;

pub const PROBE_INTERVAL: Duration = Duration::from_secs(30);
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(5);
pub const OPTIMIZATION_INTERVAL: Duration = Duration::from_secs(600);

// A fixed, reliably reachable target gives a cheap liveness signal.
const PROBE_HOST: &str = "1.1.1.1";
const PROBE_PORT: u16 = 53;

/// Periodic health loop: probes every configured upstream concurrently each
/// tick, and when auto-optimization is on also rewrites the active set once
/// per optimization interval. Runs until the shutdown signal fires.
pub async fn run(pool: Arc<ProxyPool>, auto_optimize: bool, mut shutdown: watch::Receiver<()>) {
    let mut tester = auto_optimize.then(|| BandwidthTester::new(EventSink::disabled()));
    let mut ticker = interval_at(Instant::now() + PROBE_INTERVAL, PROBE_INTERVAL);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                check_all(&pool).await;
                if let Some(tester) = tester.as_mut() {
                    if pool.optimization_due(OPTIMIZATION_INTERVAL).await {
                        optimize(&pool, tester).await;
                    }
                }
            }
            _ = shutdown.changed() => {
                debug!("health loop stopping");
                break;
            }
        }
    }
}

async fn check_all(pool: &ProxyPool) {
    let probes = pool
        .all()
        .iter()
        .cloned()
        .map(|proxy| probe_target(pool, proxy, PROBE_HOST, PROBE_PORT));
    let results = join_all(probes).await;
    let alive = results.into_iter().filter(|alive| *alive).count();
    info!(
        "health check completed: {}/{} proxies alive",
        alive,
        pool.all().len()
    );
}

async fn probe_target(pool: &ProxyPool, proxy: Arc<ProxyDescriptor>, host: &str, port: u16) -> bool {
    let started = Instant::now();
    match timeout(PROBE_TIMEOUT, connector::open_tunnel(&proxy, host, port)).await {
        Ok(Ok(stream)) => {
            // Dropping the stream closes it; nothing is sent over the tunnel.
            drop(stream);
            pool.record_success(&proxy, started.elapsed().as_secs_f64());
            debug!(proxy = %proxy, latency = proxy.latency_seconds(), "proxy is alive");
            true
        }
        Ok(Err(e)) => {
            pool.record_failure(&proxy);
            debug!(proxy = %proxy, "health check failed: {e}");
            false
        }
        Err(_) => {
            pool.record_failure(&proxy);
            debug!(proxy = %proxy, "health check timed out");
            false
        }
    }
}

/// The coarse optimizer pass. Skips (preserving the previous active set)
/// whenever a measurement comes back unusable.
async fn optimize(pool: &ProxyPool, tester: &mut BandwidthTester) {
    info!("optimizing active proxy set from measured bandwidth");

    let direct = tester.measure_direct().await;
    if direct <= 0.0 {
        warn!("could not measure direct bandwidth, keeping current active set");
        return;
    }

    let healthy = pool.healthy();
    if healthy.is_empty() {
        warn!("no healthy proxies available for optimization");
        return;
    }

    tester.measure_via_proxies(&healthy).await;
    let count = tester.optimal_count(&healthy);

    let mut by_latency = healthy.clone();
    by_latency.sort_by(|a, b| a.latency_seconds().total_cmp(&b.latency_seconds()));
    by_latency.truncate(count);

    info!(
        "optimized active set to {} of {} healthy proxies",
        by_latency.len(),
        healthy.len()
    );
    pool.set_active(by_latency).await;
}
