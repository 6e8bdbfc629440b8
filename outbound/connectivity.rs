// Part of Keystone NVR, a venue recording appliance.
// SPDX-License-Identifier: GPL-3.0-or-later

//! Connectivity Monitor (§4.G): a cheap `is_online()` plus offline→online
//! transition detection that triggers an immediate queue dispatch cycle.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

const DEFAULT_PER_PROBE_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_OVERALL_BUDGET: Duration = Duration::from_secs(10);
const DEFAULT_PROBE_INTERVAL: Duration = Duration::from_secs(20);

/// Reachability probing, isolated behind a trait so the monitor's
/// transition logic can be tested without a real network.
#[async_trait]
pub trait Prober: Send + Sync + 'static {
    async fn probe(&self) -> bool;
}

/// HEADs a set of well-known endpoints in order, falling back to DNS
/// resolution of a well-known hostname; the first success wins.
pub struct HttpProber {
    http: reqwest::Client,
    probe_urls: Vec<String>,
    dns_hostname: String,
}

impl HttpProber {
    pub fn new(probe_urls: Vec<String>, dns_hostname: impl Into<String>) -> Self {
        HttpProber {
            http: reqwest::Client::builder()
                .timeout(DEFAULT_PER_PROBE_TIMEOUT)
                .build()
                .expect("reqwest client builds with static config"),
            probe_urls,
            dns_hostname: dns_hostname.into(),
        }
    }
}

#[async_trait]
impl Prober for HttpProber {
    async fn probe(&self) -> bool {
        let budget = async {
            for url in &self.probe_urls {
                let ok = tokio::time::timeout(DEFAULT_PER_PROBE_TIMEOUT, self.http.head(url).send())
                    .await
                    .map(|r| r.map(|resp| resp.status().is_success() || resp.status().is_redirection()).unwrap_or(false))
                    .unwrap_or(false);
                if ok {
                    return true;
                }
            }
            tokio::net::lookup_host((self.dns_hostname.as_str(), 80)).await.is_ok()
        };
        tokio::time::timeout(DEFAULT_OVERALL_BUDGET, budget).await.unwrap_or(false)
    }
}

pub struct ConnectivityMonitor<P: Prober> {
    prober: P,
    online: AtomicBool,
    probe_interval: Duration,
}

impl<P: Prober> ConnectivityMonitor<P> {
    pub fn new(prober: P) -> Self {
        ConnectivityMonitor { prober, online: AtomicBool::new(false), probe_interval: DEFAULT_PROBE_INTERVAL }
    }

    pub fn with_probe_interval(mut self, interval: Duration) -> Self {
        self.probe_interval = interval;
        self
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::Relaxed)
    }

    pub fn probe_interval(&self) -> Duration {
        self.probe_interval
    }

    /// Runs one probe and updates state, returning `true` iff this probe
    /// observed an offline→online transition (the dispatcher's cue to run
    /// an immediate cycle rather than waiting for its own tick).
    pub async fn probe_once(&self) -> bool {
        let now_online = self.prober.probe().await;
        let was_online = self.online.swap(now_online, Ordering::Relaxed);
        !was_online && now_online
    }

    /// Runs the periodic probe loop until `cancel` fires, invoking
    /// `on_transition` whenever `probe_once` reports offline→online.
    pub async fn run(self: Arc<Self>, cancel: tokio_util::sync::CancellationToken, on_transition: impl Fn() + Send + Sync) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(self.probe_interval) => {}
            }
            if self.probe_once().await {
                on_transition();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct ScriptedProber {
        results: std::sync::Mutex<std::collections::VecDeque<bool>>,
    }

    #[async_trait]
    impl Prober for ScriptedProber {
        async fn probe(&self) -> bool {
            self.results.lock().unwrap().pop_front().unwrap_or(false)
        }
    }

    fn scripted(results: &[bool]) -> ScriptedProber {
        ScriptedProber { results: std::sync::Mutex::new(results.iter().copied().collect()) }
    }

    #[tokio::test]
    async fn starts_offline_until_first_successful_probe() {
        let monitor = ConnectivityMonitor::new(scripted(&[false, true]));
        assert!(!monitor.is_online());
        assert!(!monitor.probe_once().await);
        assert!(!monitor.is_online());
        assert!(monitor.probe_once().await);
        assert!(monitor.is_online());
    }

    #[tokio::test]
    async fn repeated_online_probes_report_no_further_transition() {
        let monitor = ConnectivityMonitor::new(scripted(&[true, true, false]));
        assert!(monitor.probe_once().await);
        assert!(!monitor.probe_once().await);
        assert!(monitor.is_online());
        assert!(!monitor.probe_once().await);
        assert!(!monitor.is_online());
    }

    #[tokio::test]
    async fn run_invokes_callback_only_on_transition() {
        let monitor = Arc::new(ConnectivityMonitor::new(scripted(&[false, true, true])).with_probe_interval(Duration::from_millis(1)));
        let cancel = tokio_util::sync::CancellationToken::new();
        let transitions = Arc::new(AtomicUsize::new(0));
        let transitions_clone = transitions.clone();
        let cancel_clone = cancel.clone();
        let handle = tokio::spawn(async move {
            monitor.run(cancel_clone, move || { transitions_clone.fetch_add(1, Ordering::SeqCst); }).await;
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.cancel();
        handle.await.unwrap();
        assert_eq!(transitions.load(Ordering::SeqCst), 1);
    }
}
