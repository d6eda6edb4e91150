//! Metrics collection and exposition.
//!
//! # Responsibilities
//! - Keep the varz document: request/response counters, latency
//!   percentiles, per-component breakdown, top applications
//! - Mirror the same events into the `metrics` facade
//! - Expose a Prometheus scrape endpoint when enabled
//!
//! # Metrics
//! - `router_requests_total` (counter): requests routed to a backend, by component
//! - `router_responses_total` (counter): backend responses by status class
//! - `router_response_latency_seconds` (histogram): backend round-trip latency
//! - `router_bad_requests_total` (counter): requests with no matching route
//! - `router_registered_urls` / `router_registered_droplets` (gauges)

use std::collections::{BTreeMap, VecDeque};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use dashmap::DashMap;
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder};
use serde::Serialize;

use crate::registry::{Backend, Registry};
use crate::stats::{unix_secs, TopAppsEntry};

/// Latency samples kept per metric.
const LATENCY_SAMPLES: usize = 1028;

const PERCENTILES: [(&str, f64); 5] = [
    ("50", 0.50),
    ("75", 0.75),
    ("90", 0.90),
    ("95", 0.95),
    ("99", 0.99),
];

/// Rate windows in seconds: 1, 5 and 15 minutes.
const RATE_WINDOWS: [i64; 3] = [60, 300, 900];

/// Install the Prometheus exporter listening on `addr`.
pub fn init_metrics(addr: SocketAddr) -> Result<(), BuildError> {
    PrometheusBuilder::new().with_http_listener(addr).install()?;
    tracing::info!(address = %addr, "Prometheus exporter listening");
    Ok(())
}

/// Per-second request counts over the longest rate window.
#[derive(Debug, Default)]
struct RequestRate {
    buckets: VecDeque<(i64, u64)>,
}

impl RequestRate {
    fn mark(&mut self, t: i64) {
        match self.buckets.back_mut() {
            Some((last, n)) if *last == t => *n += 1,
            _ => self.buckets.push_back((t, 1)),
        }
        self.expire(t);
    }

    fn expire(&mut self, now: i64) {
        let horizon = now - RATE_WINDOWS[2];
        while matches!(self.buckets.front(), Some((t, _)) if *t <= horizon) {
            self.buckets.pop_front();
        }
    }

    /// Mean requests per second over the `window` seconds ending at `now`.
    fn rate(&self, now: i64, window: i64) -> f64 {
        let total: u64 = self
            .buckets
            .iter()
            .filter(|(t, _)| *t > now - window && *t <= now)
            .map(|(_, n)| n)
            .sum();
        total as f64 / window as f64
    }
}

/// Ring of the most recent latency samples, in nanoseconds.
#[derive(Debug, Default)]
struct LatencySamples {
    samples: VecDeque<u64>,
}

impl LatencySamples {
    fn update(&mut self, duration: Duration) {
        if self.samples.len() == LATENCY_SAMPLES {
            self.samples.pop_front();
        }
        self.samples.push_back(duration.as_nanos().min(u64::MAX as u128) as u64);
    }

    /// Percentiles in seconds, interpolated between neighbouring samples.
    fn percentiles(&self) -> BTreeMap<String, f64> {
        let mut sorted: Vec<u64> = self.samples.iter().copied().collect();
        sorted.sort_unstable();

        PERCENTILES
            .iter()
            .map(|(name, p)| (name.to_string(), percentile(&sorted, *p) / 1e9))
            .collect()
    }
}

fn percentile(sorted: &[u64], p: f64) -> f64 {
    let n = sorted.len();
    if n == 0 {
        return 0.0;
    }

    let pos = p * (n as f64 + 1.0);
    if pos < 1.0 {
        sorted[0] as f64
    } else if pos >= n as f64 {
        sorted[n - 1] as f64
    } else {
        let lower = sorted[pos as usize - 1] as f64;
        let upper = sorted[pos as usize] as f64;
        lower + (pos - pos.floor()) * (upper - lower)
    }
}

/// Request and response statistics for one slice of traffic.
#[derive(Debug, Default)]
pub struct HttpMetric {
    requests: AtomicU64,
    responses_2xx: AtomicU64,
    responses_3xx: AtomicU64,
    responses_4xx: AtomicU64,
    responses_5xx: AtomicU64,
    responses_xxx: AtomicU64,
    rate: Mutex<RequestRate>,
    latency: Mutex<LatencySamples>,
}

impl HttpMetric {
    fn capture_request(&self, now: i64) {
        self.requests.fetch_add(1, Ordering::Relaxed);
        self.rate.lock().expect("varz mutex poisoned").mark(now);
    }

    /// `status` is `None` when the backend produced no response.
    fn capture_response(&self, status: Option<u16>, duration: Duration) {
        let counter = match status.map(|s| s / 100) {
            Some(2) => &self.responses_2xx,
            Some(3) => &self.responses_3xx,
            Some(4) => &self.responses_4xx,
            Some(5) => &self.responses_5xx,
            _ => &self.responses_xxx,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        self.latency.lock().expect("varz mutex poisoned").update(duration);
    }

    fn requests_per_sec(&self, now: i64) -> f64 {
        self.rate.lock().expect("varz mutex poisoned").rate(now, RATE_WINDOWS[0])
    }

    fn snapshot(&self, now: i64) -> HttpMetricSnapshot {
        let rate = {
            let rate = self.rate.lock().expect("varz mutex poisoned");
            RATE_WINDOWS.map(|window| rate.rate(now, window))
        };

        HttpMetricSnapshot {
            requests: self.requests.load(Ordering::Relaxed),
            rate,
            responses_2xx: self.responses_2xx.load(Ordering::Relaxed),
            responses_3xx: self.responses_3xx.load(Ordering::Relaxed),
            responses_4xx: self.responses_4xx.load(Ordering::Relaxed),
            responses_5xx: self.responses_5xx.load(Ordering::Relaxed),
            responses_xxx: self.responses_xxx.load(Ordering::Relaxed),
            latency: self.latency.lock().expect("varz mutex poisoned").percentiles(),
        }
    }
}

/// Request and response counters for one traffic slice.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HttpMetricSnapshot {
    pub requests: u64,
    pub rate: [f64; 3],
    pub responses_2xx: u64,
    pub responses_3xx: u64,
    pub responses_4xx: u64,
    pub responses_5xx: u64,
    pub responses_xxx: u64,
    pub latency: BTreeMap<String, f64>,
}

/// One row of `top10_app_requests`: requests per second and per minute.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TopAppRate {
    pub application_id: String,
    pub rps: i64,
    pub rpm: i64,
}

impl TopAppRate {
    /// Rates for an entry whose count covers the last `window`.
    fn new(entry: TopAppsEntry, window: Duration) -> Self {
        let window_secs = i64::try_from(window.as_secs()).unwrap_or(i64::MAX).max(1);
        Self {
            application_id: entry.application_id,
            rps: entry.requests / window_secs,
            rpm: entry.requests,
        }
    }
}

/// Per-tag breakdowns of the varz counters.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VarzTags {
    pub component: BTreeMap<String, HttpMetricSnapshot>,
}

/// The `/varz` document. Aggregate counters sit at the top level.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VarzSnapshot {
    #[serde(flatten)]
    pub all: HttpMetricSnapshot,
    pub tags: VarzTags,
    pub urls: usize,
    pub droplets: usize,
    pub bad_requests: u64,
    pub requests_per_sec: f64,
    pub top10_app_requests: Vec<TopAppRate>,
}

/// Router-wide traffic statistics.
pub struct Varz {
    registry: Arc<Registry>,
    /// Counters over every backend.
    all: HttpMetric,
    /// Counters keyed by the backend's `component` tag.
    components: DashMap<String, HttpMetric>,
    /// Requests that matched no route.
    bad_requests: AtomicU64,
    /// Span the top apps report counts over.
    top_apps_window: Duration,
}

impl Varz {
    /// Statistics over `registry`. `top_apps_window` is the span the top
    /// apps report counts over, normally the top-apps entry lifetime.
    pub fn new(registry: Arc<Registry>, top_apps_window: Duration) -> Self {
        Self {
            registry,
            top_apps_window,
            all: HttpMetric::default(),
            components: DashMap::new(),
            bad_requests: AtomicU64::new(0),
        }
    }

    /// A request matched no route.
    pub fn capture_bad_request(&self) {
        self.bad_requests.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("router_bad_requests_total").increment(1);
    }

    /// A request is about to be forwarded to `backend`.
    pub fn capture_backend_request(&self, backend: &Backend) {
        let now = unix_secs(SystemTime::now());
        let component = backend.component().unwrap_or("");

        if !component.is_empty() {
            self.components
                .entry(component.to_string())
                .or_default()
                .capture_request(now);
        }
        self.all.capture_request(now);

        metrics::counter!("router_requests_total", "component" => component.to_string()).increment(1);
    }

    /// `backend` answered with `status` (or not at all) after `duration`.
    pub fn capture_backend_response(&self, backend: &Backend, status: Option<u16>, duration: Duration) {
        if let Some(component) = backend.component() {
            self.components
                .entry(component.to_string())
                .or_default()
                .capture_response(status, duration);
        }
        self.all.capture_response(status, duration);

        metrics::counter!("router_responses_total", "status_class" => status_class(status)).increment(1);
        metrics::histogram!("router_response_latency_seconds").record(duration.as_secs_f64());
    }

    /// Current varz document. Also refreshes the registry gauges.
    pub fn snapshot(&self) -> VarzSnapshot {
        let now = SystemTime::now();
        let secs = unix_secs(now);

        let urls = self.registry.num_uris();
        let droplets = self.registry.num_backends();
        metrics::gauge!("router_registered_urls").set(urls as f64);
        metrics::gauge!("router_registered_droplets").set(droplets as f64);

        let since = now.checked_sub(self.top_apps_window).unwrap_or(SystemTime::UNIX_EPOCH);
        let top = self
            .registry
            .top_apps()
            .top_since(since, 10)
            .into_iter()
            .map(|entry| TopAppRate::new(entry, self.top_apps_window))
            .collect();

        let component = self
            .components
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().snapshot(secs)))
            .collect();

        VarzSnapshot {
            all: self.all.snapshot(secs),
            tags: VarzTags { component },
            urls,
            droplets,
            bad_requests: self.bad_requests.load(Ordering::Relaxed),
            requests_per_sec: self.all.requests_per_sec(secs),
            top10_app_requests: top,
        }
    }
}

fn status_class(status: Option<u16>) -> &'static str {
    match status.map(|s| s / 100) {
        Some(2) => "2xx",
        Some(3) => "3xx",
        Some(4) => "4xx",
        Some(5) => "5xx",
        _ => "xxx",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RegistryConfig;
    use crate::mbus::LocalBus;
    use crate::registry::RegistryMessage;

    fn varz_with_window(window: Duration) -> (Arc<Registry>, Varz) {
        let registry = Arc::new(Registry::new(&RegistryConfig::default(), Arc::new(LocalBus::new())));
        let varz = Varz::new(registry.clone(), window);
        (registry, varz)
    }

    fn varz() -> (Arc<Registry>, Varz) {
        varz_with_window(Duration::from_secs(60))
    }

    fn register(registry: &Registry, component: Option<&str>) -> Arc<Backend> {
        let mut message = RegistryMessage {
            host: "10.0.0.1".to_string(),
            port: 1234,
            uris: vec!["varz.vcap.me".to_string()],
            app: "app-1".to_string(),
            ..Default::default()
        };
        if let Some(component) = component {
            message.tags.insert("component".to_string(), component.to_string());
        }
        registry.register(&message);
        registry.lookup("varz.vcap.me").unwrap()
    }

    #[test]
    fn test_varz_document_keys() {
        let (_registry, varz) = varz();
        let json = serde_json::to_value(varz.snapshot()).unwrap();

        for key in [
            "requests",
            "responses_2xx",
            "responses_3xx",
            "responses_4xx",
            "responses_5xx",
            "responses_xxx",
            "latency",
            "tags",
            "urls",
            "droplets",
            "bad_requests",
            "requests_per_sec",
            "top10_app_requests",
        ] {
            assert!(json.get(key).is_some(), "missing key {}", key);
        }
        for p in ["50", "75", "90", "95", "99"] {
            assert!(json["latency"].get(p).is_some(), "missing percentile {}", p);
        }
        assert!(json.get("all").is_none());
    }

    #[test]
    fn test_capture_counts_by_status_class() {
        let (registry, varz) = varz();
        let backend = register(&registry, None);

        varz.capture_backend_request(&backend);
        varz.capture_backend_request(&backend);
        varz.capture_backend_response(&backend, Some(200), Duration::from_millis(10));
        varz.capture_backend_response(&backend, Some(404), Duration::from_millis(10));
        varz.capture_backend_response(&backend, None, Duration::from_millis(10));
        varz.capture_bad_request();

        let snapshot = varz.snapshot();
        assert_eq!(snapshot.all.requests, 2);
        assert_eq!(snapshot.all.responses_2xx, 1);
        assert_eq!(snapshot.all.responses_4xx, 1);
        assert_eq!(snapshot.all.responses_xxx, 1);
        assert_eq!(snapshot.bad_requests, 1);
        assert_eq!(snapshot.urls, 1);
        assert_eq!(snapshot.droplets, 1);
        assert!(snapshot.requests_per_sec > 0.0);
        assert!(snapshot.tags.component.is_empty());
    }

    #[test]
    fn test_component_breakdown() {
        let (registry, varz) = varz();
        let backend = register(&registry, Some("dea-1"));

        varz.capture_backend_request(&backend);
        varz.capture_backend_response(&backend, Some(503), Duration::from_millis(1));

        let json = serde_json::to_value(varz.snapshot()).unwrap();
        assert_eq!(json["tags"]["component"]["dea-1"]["requests"], 1);
        assert_eq!(json["tags"]["component"]["dea-1"]["responses_5xx"], 1);
    }

    #[test]
    fn test_top_apps_report() {
        let (registry, varz) = varz();
        let backend = register(&registry, None);
        for _ in 0..120 {
            registry.capture_backend_request(&backend, SystemTime::now());
        }

        let top = varz.snapshot().top10_app_requests;
        assert_eq!(
            top,
            vec![TopAppRate {
                application_id: "app-1".to_string(),
                rps: 2,
                rpm: 120,
            }]
        );
    }

    #[test]
    fn test_top_apps_report_uses_configured_window() {
        let (registry, varz) = varz_with_window(Duration::from_secs(120));
        let backend = register(&registry, None);
        let now = SystemTime::now();
        for _ in 0..120 {
            registry.capture_backend_request(&backend, now - Duration::from_secs(90));
        }
        for _ in 0..120 {
            registry.capture_backend_request(&backend, now);
        }

        let top = varz.snapshot().top10_app_requests;
        assert_eq!(
            top,
            vec![TopAppRate {
                application_id: "app-1".to_string(),
                rps: 2,
                rpm: 240,
            }]
        );
    }

    #[test]
    fn test_top_apps_report_with_huge_window() {
        let (registry, varz) = varz_with_window(Duration::MAX);
        let backend = register(&registry, None);
        registry.capture_backend_request(&backend, SystemTime::now());

        let top = varz.snapshot().top10_app_requests;
        assert_eq!(top.len(), 1);
        assert_eq!(top[0].rps, 0);
        assert_eq!(top[0].rpm, 1);
    }

    #[test]
    fn test_latency_percentiles() {
        let mut samples = LatencySamples::default();
        for ms in 1..=100 {
            samples.update(Duration::from_millis(ms));
        }

        let p = samples.percentiles();
        assert!((p["50"] - 0.0505).abs() < 1e-9);
        assert!((p["99"] - 0.09999).abs() < 1e-9);
    }

    #[test]
    fn test_latency_reservoir_is_bounded() {
        let mut samples = LatencySamples::default();
        for _ in 0..(LATENCY_SAMPLES + 10) {
            samples.update(Duration::from_millis(1));
        }
        assert_eq!(samples.samples.len(), LATENCY_SAMPLES);
    }

    #[test]
    fn test_request_rate_windows() {
        let mut rate = RequestRate::default();
        for t in 0..60 {
            rate.mark(1000 + t);
            rate.mark(1000 + t);
        }

        assert!((rate.rate(1059, 60) - 2.0).abs() < 1e-9);
        assert!((rate.rate(1059, 300) - 0.4).abs() < 1e-9);
        assert_eq!(rate.rate(1200, 60), 0.0);

        rate.mark(3000);
        assert_eq!(rate.buckets.len(), 1);
    }
}
