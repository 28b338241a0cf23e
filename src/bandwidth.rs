use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::sync::watch;
use tokio::time::{sleep, Instant};
use tracing::{error, info};

use crate::events::{EventSink, ProgressEvent};
use crate::proxy::descriptor::ProxyDescriptor;

// Large files on well-provisioned CDNs; one is picked at random per test.
pub const TEST_URLS: [&str; 3] = [
    "https://speed.cloudflare.com/100mb.bin",
    "https://proof.ovh.net/files/100Mb.dat",
    "https://speedtest.tele2.net/100MB.zip",
];

pub const DEFAULT_MAX_PROXIES: usize = 100;
pub const CONTINUOUS_INTERVAL: Duration = Duration::from_secs(60);

const TEST_DURATION: Duration = Duration::from_secs(5);
const TEST_TIMEOUT: Duration = Duration::from_secs(7);
const MAX_SAMPLED_PROXIES: usize = 5;
// Assumed per-proxy throughput when no proxy produced a usable sample.
const DEFAULT_PROXY_MBPS: f64 = 5.0;

/// Measures direct and via-proxy throughput and sizes the active proxy set
/// so the pool can saturate the local link without dispatching over more
/// upstreams than needed.
pub struct BandwidthTester {
    max_proxies: usize,
    sink: EventSink,
    pub user_bandwidth_mbps: f64,
    pub proxy_avg_bandwidth_mbps: f64,
}

impl BandwidthTester {
    pub fn new(sink: EventSink) -> Self {
        Self::with_max_proxies(DEFAULT_MAX_PROXIES, sink)
    }

    pub fn with_max_proxies(max_proxies: usize, sink: EventSink) -> Self {
        Self {
            max_proxies,
            sink,
            user_bandwidth_mbps: 0.0,
            proxy_avg_bandwidth_mbps: 0.0,
        }
    }

    /// Measure the direct connection speed in Mbps. Returns 0 when the
    /// measurement fails outright; a deadline mid-download is not a failure,
    /// whatever arrived before it still counts.
    pub async fn measure_direct(&mut self) -> f64 {
        let url = pick_test_url();
        self.sink
            .emit(ProgressEvent::StartUserBandwidthTest { url: url.to_string() });

        let client = match reqwest::Client::builder().timeout(TEST_TIMEOUT).build() {
            Ok(client) => client,
            Err(e) => {
                error!("error building HTTP client: {e}");
                self.user_bandwidth_mbps = 0.0;
                return 0.0;
            }
        };

        let sink = self.sink.clone();
        let mbps = match timed_read(&client, url, move |bytes, elapsed| {
            sink.emit(ProgressEvent::UserBandwidthProgress { bytes, elapsed });
        })
        .await
        {
            Ok((bytes, elapsed)) => mbps(bytes, elapsed),
            Err(e) => {
                error!("error measuring connection speed: {e}");
                self.user_bandwidth_mbps = 0.0;
                return 0.0;
            }
        };

        info!("direct connection speed: {:.2} Mbps", mbps);
        self.user_bandwidth_mbps = mbps;
        self.sink.emit(ProgressEvent::UserBandwidthDone { mbps });
        mbps
    }

    /// Measure the average bandwidth through a sample of proxies (the first
    /// five candidates). Proxies that error or produce nothing are sampled
    /// as 0 and excluded from the average.
    pub async fn measure_via_proxies(&mut self, proxies: &[Arc<ProxyDescriptor>]) -> f64 {
        let url = pick_test_url();
        let mut speeds = Vec::new();

        for (idx, proxy) in proxies.iter().take(MAX_SAMPLED_PROXIES).enumerate() {
            let label = proxy.to_string();
            let speed = match proxy_client(proxy) {
                Ok(client) => {
                    let sink = self.sink.clone();
                    let progress_label = label.clone();
                    match timed_read(&client, url, move |bytes, _| {
                        sink.emit(ProgressEvent::ProxyBandwidthProgress {
                            proxy: progress_label.clone(),
                            bytes,
                            idx,
                        });
                    })
                    .await
                    {
                        Ok((bytes, elapsed)) => mbps(bytes, elapsed),
                        Err(e) => {
                            error!("error testing proxy {label}: {e}");
                            0.0
                        }
                    }
                }
                Err(e) => {
                    error!("error building client for proxy {label}: {e}");
                    0.0
                }
            };
            self.sink.emit(ProgressEvent::ProxyBandwidthDone {
                proxy: label,
                mbps: speed,
                idx,
            });
            speeds.push(speed);
        }

        let avg = average_positive(&speeds);
        info!("average proxy speed: {:.2} Mbps", avg);
        self.proxy_avg_bandwidth_mbps = avg;
        self.sink.emit(ProgressEvent::ProxyBandwidthAvg { mbps: avg });
        avg
    }

    /// How many proxies are needed to saturate the direct link, with 20%
    /// headroom. Without usable measurements every candidate stays in play,
    /// capped by `max_proxies`.
    pub fn optimal_count(&self, candidates: &[Arc<ProxyDescriptor>]) -> usize {
        if self.user_bandwidth_mbps <= 0.0 || self.proxy_avg_bandwidth_mbps <= 0.0 {
            return candidates.len().min(self.max_proxies);
        }

        let needed = (self.user_bandwidth_mbps * 1.2 / self.proxy_avg_bandwidth_mbps) as usize;
        let count = needed.min(self.max_proxies).min(candidates.len()).max(1);

        info!(
            "optimal proxy count: {} (user: {:.2} Mbps, proxy avg: {:.2} Mbps)",
            count, self.user_bandwidth_mbps, self.proxy_avg_bandwidth_mbps
        );
        count
    }

    /// The user-facing optimization loop: measure, report a full cycle of
    /// events, sleep, repeat until shutdown.
    pub async fn run_continuous(
        mut self,
        proxies: Vec<Arc<ProxyDescriptor>>,
        interval: Duration,
        mut shutdown: watch::Receiver<()>,
    ) {
        loop {
            self.sink.emit(ProgressEvent::CycleStart);
            self.measure_direct().await;
            self.measure_via_proxies(&proxies).await;
            let optimal = self.optimal_count(&proxies);
            self.sink.emit(ProgressEvent::CycleDone {
                user_bandwidth_mbps: self.user_bandwidth_mbps,
                proxy_avg_bandwidth_mbps: self.proxy_avg_bandwidth_mbps,
                optimal_proxy_count: optimal,
                total_proxies: proxies.len(),
            });

            tokio::select! {
                _ = sleep(interval) => {}
                _ = shutdown.changed() => break,
            }
        }
    }
}

fn pick_test_url() -> &'static str {
    TEST_URLS[rand::thread_rng().gen_range(0..TEST_URLS.len())]
}

fn proxy_client(proxy: &ProxyDescriptor) -> Result<reqwest::Client, reqwest::Error> {
    reqwest::Client::builder()
        .timeout(TEST_TIMEOUT)
        .proxy(reqwest::Proxy::all(proxy.connection_string())?)
        .build()
}

/// Stream the response body for up to `TEST_DURATION`, reporting running
/// totals. The client's own 7 s timeout backstops a stalled read; hitting
/// either deadline keeps the bytes read so far.
async fn timed_read<F>(
    client: &reqwest::Client,
    url: &str,
    mut on_progress: F,
) -> Result<(u64, f64), reqwest::Error>
where
    F: FnMut(u64, f64),
{
    let started = Instant::now();
    let mut response = client.get(url).send().await?;
    let mut total: u64 = 0;

    while started.elapsed() < TEST_DURATION {
        match response.chunk().await {
            Ok(Some(chunk)) => {
                total += chunk.len() as u64;
                on_progress(total, started.elapsed().as_secs_f64());
            }
            Ok(None) => break,
            Err(e) if e.is_timeout() => break,
            Err(e) => return Err(e),
        }
    }

    Ok((total, started.elapsed().as_secs_f64()))
}

fn mbps(bytes: u64, elapsed_seconds: f64) -> f64 {
    if elapsed_seconds <= 0.0 {
        return 0.0;
    }
    (bytes as f64 * 8.0) / (elapsed_seconds * 1_000_000.0)
}

fn average_positive(speeds: &[f64]) -> f64 {
    let positive: Vec<f64> = speeds.iter().copied().filter(|s| *s > 0.0).collect();
    if positive.is_empty() {
        return DEFAULT_PROXY_MBPS;
    }
    positive.iter().sum::<f64>() / positive.len() as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::descriptor::SocksProtocol;

    fn candidates(n: usize) -> Vec<Arc<ProxyDescriptor>> {
        (0..n)
            .map(|i| {
                Arc::new(ProxyDescriptor::new(
                    SocksProtocol::Socks5,
                    format!("proxy{i}"),
                    1080,
                    None,
                    None,
                    1,
                ))
            })
            .collect()
    }

    fn tester(user: f64, proxy_avg: f64, max_proxies: usize) -> BandwidthTester {
        let mut tester = BandwidthTester::with_max_proxies(max_proxies, EventSink::disabled());
        tester.user_bandwidth_mbps = user;
        tester.proxy_avg_bandwidth_mbps = proxy_avg;
        tester
    }

    #[test]
    fn test_optimal_count_without_measurements_uses_everything() {
        assert_eq!(tester(0.0, 10.0, 100).optimal_count(&candidates(7)), 7);
        assert_eq!(tester(50.0, 0.0, 100).optimal_count(&candidates(7)), 7);
        // Still capped by max_proxies.
        assert_eq!(tester(0.0, 0.0, 3).optimal_count(&candidates(7)), 3);
    }

    #[test]
    fn test_optimal_count_formula_with_headroom() {
        // 100 Mbps direct, 20 Mbps per proxy: 100 * 1.2 / 20 = 6.
        assert_eq!(tester(100.0, 20.0, 100).optimal_count(&candidates(10)), 6);
    }

    #[test]
    fn test_optimal_count_saturates_at_both_caps() {
        assert_eq!(tester(1000.0, 1.0, 8).optimal_count(&candidates(20)), 8);
        assert_eq!(tester(1000.0, 1.0, 100).optimal_count(&candidates(4)), 4);
    }

    #[test]
    fn test_optimal_count_is_at_least_one() {
        // 1 * 1.2 / 50 rounds down to 0; never starve dispatch entirely.
        assert_eq!(tester(1.0, 50.0, 100).optimal_count(&candidates(5)), 1);
    }

    #[test]
    fn test_mbps_conversion() {
        // 1,250,000 bytes in one second is 10 Mbps.
        assert!((mbps(1_250_000, 1.0) - 10.0).abs() < 1e-9);
        assert_eq!(mbps(1_000_000, 0.0), 0.0);
        assert_eq!(mbps(0, 5.0), 0.0);
    }

    #[test]
    fn test_average_ignores_failed_samples() {
        assert!((average_positive(&[10.0, 0.0, 20.0]) - 15.0).abs() < 1e-9);
    }

    #[test]
    fn test_average_defaults_when_every_sample_failed() {
        assert_eq!(average_positive(&[0.0, 0.0]), DEFAULT_PROXY_MBPS);
        assert_eq!(average_positive(&[]), DEFAULT_PROXY_MBPS);
    }
}
