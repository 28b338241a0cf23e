use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::Rng;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::error::{ConfigError, SocksError};
use crate::proxy::descriptor::ProxyDescriptor;

/// State that selection and active-set rewrites serialize on. The active
/// sequence is replaced wholesale by `set_active`, never mutated in place,
/// so every selector sees a consistent snapshot.
struct Shared {
    active: Vec<Arc<ProxyDescriptor>>,
    cursor: usize,
    last_optimization: Option<Instant>,
}

/// Holds every configured upstream and the currently active subset, and
/// serves weighted selection with layered fallback.
pub struct ProxyPool {
    all: Vec<Arc<ProxyDescriptor>>,
    shared: Mutex<Shared>,
}

impl ProxyPool {
    pub fn new(proxies: Vec<ProxyDescriptor>) -> Result<Self, ConfigError> {
        if proxies.is_empty() {
            return Err(ConfigError::NoProxies);
        }
        let all: Vec<Arc<ProxyDescriptor>> = proxies.into_iter().map(Arc::new).collect();
        let active = all.clone();
        Ok(Self {
            all,
            shared: Mutex::new(Shared {
                active,
                cursor: 0,
                last_optimization: None,
            }),
        })
    }

    /// Every configured upstream, in configuration order. Membership never
    /// changes for the lifetime of the process.
    pub fn all(&self) -> &[Arc<ProxyDescriptor>] {
        &self.all
    }

    /// The configured upstreams that currently look healthy.
    pub fn healthy(&self) -> Vec<Arc<ProxyDescriptor>> {
        self.all.iter().filter(|p| p.is_alive()).cloned().collect()
    }

    pub async fn active_snapshot(&self) -> Vec<Arc<ProxyDescriptor>> {
        self.shared.lock().await.active.clone()
    }

    /// Pick an upstream for a new client connection.
    ///
    /// Falls back through progressively worse candidate sets: healthy active
    /// proxies, healthy proxies anywhere, any active proxy, any proxy at
    /// all. Within the chosen set the draw is weighted-random, degrading to
    /// round-robin when every weight is zero.
    pub async fn select(
        &self,
        dest_host: &str,
        dest_port: u16,
    ) -> Result<Arc<ProxyDescriptor>, SocksError> {
        let mut shared = self.shared.lock().await;

        let mut candidates: Vec<Arc<ProxyDescriptor>> = shared
            .active
            .iter()
            .filter(|p| p.is_alive())
            .cloned()
            .collect();

        if candidates.is_empty() {
            warn!("no healthy proxies in active set, checking all proxies");
            candidates = self.healthy();
        }
        if candidates.is_empty() {
            warn!("no healthy proxies available, trying any active proxy");
            candidates = shared.active.clone();
        }
        if candidates.is_empty() {
            warn!("no active proxies available, trying any proxy");
            candidates = self.all.clone();
        }
        if candidates.is_empty() {
            return Err(SocksError::NoProxies);
        }

        let total_weight: u64 = candidates.iter().map(|p| u64::from(p.weight)).sum();
        let selected = if total_weight == 0 {
            let picked = candidates[shared.cursor % candidates.len()].clone();
            shared.cursor = (shared.cursor + 1) % candidates.len();
            picked
        } else {
            let mut r = rand::thread_rng().gen_range(1..=total_weight);
            let mut picked = None;
            for proxy in &candidates {
                let weight = u64::from(proxy.weight);
                if weight >= r {
                    picked = Some(proxy.clone());
                    break;
                }
                r -= weight;
            }
            // The running total always reaches r; the fallback covers the
            // last candidate when rounding leaves r at the boundary.
            picked.unwrap_or_else(|| candidates[candidates.len() - 1].clone())
        };

        debug!(proxy = %selected, "selected proxy for {dest_host}:{dest_port}");
        Ok(selected)
    }

    /// Atomically replace the active subset. Only the optimizer calls this.
    pub async fn set_active(&self, subset: Vec<Arc<ProxyDescriptor>>) {
        let mut shared = self.shared.lock().await;
        shared.cursor = 0;
        shared.active = subset;
    }

    pub fn record_success(&self, proxy: &ProxyDescriptor, latency_sample: f64) {
        proxy.mark_successful();
        proxy.update_latency(latency_sample);
    }

    pub fn record_failure(&self, proxy: &ProxyDescriptor) {
        proxy.mark_failed();
    }

    /// True once per `interval`: checks whether an optimizer pass is due and
    /// stamps the attempt time when it is.
    pub async fn optimization_due(&self, interval: Duration) -> bool {
        let mut shared = self.shared.lock().await;
        let due = match shared.last_optimization {
            None => true,
            Some(at) => at.elapsed() >= interval,
        };
        if due {
            shared.last_optimization = Some(Instant::now());
        }
        due
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::descriptor::SocksProtocol;
    use std::collections::HashMap;

    fn proxy(host: &str, weight: u32) -> ProxyDescriptor {
        ProxyDescriptor::new(SocksProtocol::Socks5, host, 1080, None, None, weight)
    }

    #[test]
    fn test_empty_pool_is_a_config_error() {
        assert!(ProxyPool::new(Vec::new()).is_err());
    }

    #[tokio::test]
    async fn test_selects_from_healthy_active_proxies() {
        let pool = ProxyPool::new(vec![proxy("a", 1), proxy("b", 1)]).unwrap();
        let picked = pool.select("example.com", 80).await.unwrap();
        assert!(picked.is_alive());
    }

    #[tokio::test]
    async fn test_falls_back_to_all_when_active_set_is_dead() {
        let pool = ProxyPool::new(vec![proxy("a", 1), proxy("b", 1)]).unwrap();
        // Narrow the active set to "a", then kill it.
        let a = pool.all()[0].clone();
        pool.set_active(vec![a.clone()]).await;
        for _ in 0..3 {
            a.mark_failed();
        }

        let picked = pool.select("example.com", 80).await.unwrap();
        assert_eq!(picked.host, "b");
    }

    #[tokio::test]
    async fn test_falls_back_to_dead_proxies_as_a_last_resort() {
        let pool = ProxyPool::new(vec![proxy("a", 1)]).unwrap();
        for _ in 0..3 {
            pool.all()[0].mark_failed();
        }
        // Everything is dead, selection still returns something.
        let picked = pool.select("example.com", 80).await.unwrap();
        assert_eq!(picked.host, "a");
    }

    #[tokio::test]
    async fn test_zero_weights_round_robin() {
        let pool = ProxyPool::new(vec![proxy("a", 0), proxy("b", 0), proxy("c", 0)]).unwrap();
        let mut order = Vec::new();
        for _ in 0..6 {
            order.push(pool.select("example.com", 80).await.unwrap().host.clone());
        }
        assert_eq!(order, ["a", "b", "c", "a", "b", "c"]);
    }

    #[tokio::test]
    async fn test_weighted_selection_frequency() {
        let pool = ProxyPool::new(vec![proxy("light", 1), proxy("heavy", 9)]).unwrap();
        let mut counts: HashMap<String, u32> = HashMap::new();
        for _ in 0..2000 {
            let picked = pool.select("example.com", 80).await.unwrap();
            *counts.entry(picked.host.clone()).or_default() += 1;
        }
        let heavy = f64::from(counts["heavy"]);
        let light = f64::from(*counts.get("light").unwrap_or(&0));
        // Expect roughly 9:1; allow generous slack for randomness.
        assert!(heavy / (heavy + light) > 0.8);
        assert!(light > 0.0);
    }

    #[tokio::test]
    async fn test_set_active_is_visible_to_selection() {
        let pool = ProxyPool::new(vec![proxy("a", 1), proxy("b", 1)]).unwrap();
        let b = pool.all()[1].clone();
        pool.set_active(vec![b]).await;
        for _ in 0..10 {
            assert_eq!(pool.select("example.com", 80).await.unwrap().host, "b");
        }
        assert_eq!(pool.active_snapshot().await.len(), 1);
    }

    #[tokio::test]
    async fn test_optimization_due_respects_interval() {
        let pool = ProxyPool::new(vec![proxy("a", 1)]).unwrap();
        assert!(pool.optimization_due(Duration::from_secs(600)).await);
        assert!(!pool.optimization_due(Duration::from_secs(600)).await);
        assert!(pool.optimization_due(Duration::from_millis(0)).await);
    }
}
