use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, OnceLock};
use std::time::{Duration, Instant};

use salvo::prelude::*;

#[derive(Default)]
pub struct BridgeMetrics {
    inbound_requests_total: AtomicU64,
    outbound_forwards_total: AtomicU64,
    outbound_failures_total: AtomicU64,
    cache_hits_total: AtomicU64,
    cache_misses_total: AtomicU64,
    inbound_by_source: Mutex<HashMap<String, u64>>,
    outbound_by_target: Mutex<HashMap<String, u64>>,
    outbound_failures_by_target_status: Mutex<HashMap<String, u64>>,
    cache_hits_by_name: Mutex<HashMap<String, u64>>,
    cache_misses_by_name: Mutex<HashMap<String, u64>>,
    resolution_stats: Mutex<HashMap<String, ProcessingStats>>,
}

#[derive(Default, Clone, Copy)]
struct ProcessingStats {
    count: u64,
    sum_ms: u64,
}

static GLOBAL_METRICS: OnceLock<BridgeMetrics> = OnceLock::new();

pub fn global_metrics() -> &'static BridgeMetrics {
    GLOBAL_METRICS.get_or_init(BridgeMetrics::default)
}

impl BridgeMetrics {
    /// `source` is `"homeserver"` or `"bridge"`.
    pub fn record_inbound_request(&self, source: &str) {
        self.inbound_requests_total.fetch_add(1, Ordering::Relaxed);
        increment_map(&self.inbound_by_source, source.to_string());
    }

    /// `target` is the destination this multiplexer forwarded to: the
    /// resolved bridge, or the real homeserver.
    pub fn record_outbound_forward(&self, target: &str) {
        self.outbound_forwards_total.fetch_add(1, Ordering::Relaxed);
        increment_map(&self.outbound_by_target, target.to_string());
    }

    pub fn record_outbound_failure(&self, target: &str, status: &str) {
        self.outbound_failures_total.fetch_add(1, Ordering::Relaxed);
        let key = format!("{}|{}", target, status);
        increment_map(&self.outbound_failures_by_target_status, key);
    }

    pub fn record_cache_hit(&self, cache_name: &str) {
        self.cache_hits_total.fetch_add(1, Ordering::Relaxed);
        increment_map(&self.cache_hits_by_name, cache_name.to_string());
    }

    pub fn record_cache_miss(&self, cache_name: &str) {
        self.cache_misses_total.fetch_add(1, Ordering::Relaxed);
        increment_map(&self.cache_misses_by_name, cache_name.to_string());
    }

    /// Records how long bridge resolution took under a given strategy name
    /// (`auth_token`, `room_id`, ... or `unresolved`).
    pub fn record_resolution_duration(&self, method: &str, duration: Duration) {
        let mut guard = self.resolution_stats.lock().expect("metrics mutex poisoned");
        let entry = guard.entry(method.to_string()).or_default();
        entry.count = entry.count.saturating_add(1);
        entry.sum_ms = entry.sum_ms.saturating_add(duration.as_millis().min(u64::MAX as u128) as u64);
    }

    pub fn render_prometheus(&self) -> String {
        let mut body = String::new();

        body.push_str("# HELP bridgemgr_inbound_requests_total Total inbound requests\n");
        body.push_str("# TYPE bridgemgr_inbound_requests_total counter\n");
        body.push_str(&format!(
            "bridgemgr_inbound_requests_total {}\n",
            self.inbound_requests_total.load(Ordering::Relaxed)
        ));
        for (source, count) in sorted_pairs(&self.inbound_by_source) {
            body.push_str(&format!(
                "bridgemgr_inbound_requests_total_by_source{{source=\"{}\"}} {}\n",
                escape_label(&source),
                count
            ));
        }

        body.push_str("# HELP bridgemgr_outbound_forwards_total Total outbound forwards\n");
        body.push_str("# TYPE bridgemgr_outbound_forwards_total counter\n");
        body.push_str(&format!(
            "bridgemgr_outbound_forwards_total {}\n",
            self.outbound_forwards_total.load(Ordering::Relaxed)
        ));
        for (target, count) in sorted_pairs(&self.outbound_by_target) {
            body.push_str(&format!(
                "bridgemgr_outbound_forwards_total_by_target{{target=\"{}\"}} {}\n",
                escape_label(&target),
                count
            ));
        }

        body.push_str("# HELP bridgemgr_outbound_failures_total Total outbound forward failures\n");
        body.push_str("# TYPE bridgemgr_outbound_failures_total counter\n");
        body.push_str(&format!(
            "bridgemgr_outbound_failures_total {}\n",
            self.outbound_failures_total.load(Ordering::Relaxed)
        ));
        for (target_status, count) in sorted_pairs(&self.outbound_failures_by_target_status) {
            let mut parts = target_status.splitn(2, '|');
            let target = parts.next().unwrap_or("unknown");
            let status = parts.next().unwrap_or("unknown");
            body.push_str(&format!(
                "bridgemgr_outbound_failures_total_by_target_status{{target=\"{}\",status=\"{}\"}} {}\n",
                escape_label(target),
                escape_label(status),
                count
            ));
        }

        body.push_str("# HELP bridgemgr_cache_hits_total Total registry cache hits\n");
        body.push_str("# TYPE bridgemgr_cache_hits_total counter\n");
        body.push_str(&format!("bridgemgr_cache_hits_total {}\n", self.cache_hits_total.load(Ordering::Relaxed)));
        body.push_str("# HELP bridgemgr_cache_misses_total Total registry cache misses\n");
        body.push_str("# TYPE bridgemgr_cache_misses_total counter\n");
        body.push_str(&format!("bridgemgr_cache_misses_total {}\n", self.cache_misses_total.load(Ordering::Relaxed)));

        let hits_by_cache = sorted_pairs(&self.cache_hits_by_name);
        let misses_by_cache = sorted_pairs(&self.cache_misses_by_name);
        let mut all_cache_names: Vec<String> = hits_by_cache
            .iter()
            .map(|(name, _)| name.clone())
            .chain(misses_by_cache.iter().map(|(name, _)| name.clone()))
            .collect();
        all_cache_names.sort();
        all_cache_names.dedup();

        body.push_str("# HELP bridgemgr_cache_requests_total Cache requests by result\n");
        body.push_str("# TYPE bridgemgr_cache_requests_total counter\n");
        body.push_str("# HELP bridgemgr_cache_hit_ratio Cache hit ratio by cache name\n");
        body.push_str("# TYPE bridgemgr_cache_hit_ratio gauge\n");

        for cache_name in all_cache_names {
            let hits = hits_by_cache.iter().find(|(name, _)| name == &cache_name).map(|(_, v)| *v).unwrap_or(0);
            let misses = misses_by_cache.iter().find(|(name, _)| name == &cache_name).map(|(_, v)| *v).unwrap_or(0);
            let total = hits + misses;
            let ratio = if total == 0 { 0.0 } else { hits as f64 / total as f64 };

            body.push_str(&format!(
                "bridgemgr_cache_requests_total{{cache=\"{}\",result=\"hit\"}} {}\n",
                escape_label(&cache_name),
                hits
            ));
            body.push_str(&format!(
                "bridgemgr_cache_requests_total{{cache=\"{}\",result=\"miss\"}} {}\n",
                escape_label(&cache_name),
                misses
            ));
            body.push_str(&format!("bridgemgr_cache_hit_ratio{{cache=\"{}\"}} {:.6}\n", escape_label(&cache_name), ratio));
        }

        body.push_str("# HELP bridgemgr_resolution_duration_ms_sum Total bridge resolution duration in ms\n");
        body.push_str("# TYPE bridgemgr_resolution_duration_ms_sum counter\n");
        for (method, stats) in sorted_processing(&self.resolution_stats) {
            body.push_str(&format!(
                "bridgemgr_resolution_duration_ms_sum{{method=\"{}\"}} {}\n",
                escape_label(&method),
                stats.sum_ms
            ));
            body.push_str(&format!(
                "bridgemgr_resolution_duration_ms_count{{method=\"{}\"}} {}\n",
                escape_label(&method),
                stats.count
            ));
        }

        body
    }
}

pub struct ScopedTimer {
    method: String,
    started_at: Instant,
}

impl ScopedTimer {
    pub fn new(method: impl Into<String>) -> Self {
        Self { method: method.into(), started_at: Instant::now() }
    }
}

impl Drop for ScopedTimer {
    fn drop(&mut self) {
        global_metrics().record_resolution_duration(&self.method, self.started_at.elapsed());
    }
}

pub fn router() -> Router {
    Router::with_path("metrics").get(metrics_endpoint)
}

#[handler]
pub async fn metrics_endpoint(res: &mut Response) {
    res.status_code(StatusCode::OK);
    res.render(global_metrics().render_prometheus());
}

fn escape_label(value: &str) -> String {
    value.replace('\\', "\\\\").replace('"', "\\\"").replace('\n', "\\n")
}

fn increment_map(map: &Mutex<HashMap<String, u64>>, key: String) {
    let mut guard = map.lock().expect("metrics mutex poisoned");
    let counter = guard.entry(key).or_insert(0);
    *counter = counter.saturating_add(1);
}

fn sorted_pairs(map: &Mutex<HashMap<String, u64>>) -> Vec<(String, u64)> {
    let guard = map.lock().expect("metrics mutex poisoned");
    let mut values: Vec<(String, u64)> = guard.iter().map(|(k, v)| (k.clone(), *v)).collect();
    values.sort_by(|a, b| a.0.cmp(&b.0));
    values
}

fn sorted_processing(map: &Mutex<HashMap<String, ProcessingStats>>) -> Vec<(String, ProcessingStats)> {
    let guard = map.lock().expect("metrics mutex poisoned");
    let mut values: Vec<(String, ProcessingStats)> = guard.iter().map(|(k, v)| (k.clone(), *v)).collect();
    values.sort_by(|a, b| a.0.cmp(&b.0));
    values
}
