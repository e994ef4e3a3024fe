//! Process metrics
//!
//! Plain atomics, sampled gauges, and fixed-bucket histograms rendered as
//! Prometheus text exposition from `GET /metrics`. No registry machinery;
//! everything the daemon exports is declared here.

use crate::cache::CacheStatsSnapshot;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::Duration;

const DURATION_BUCKETS: &[f64] = &[0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0];

/// Fixed-bucket duration histogram.
#[derive(Debug)]
pub struct Histogram {
    buckets: Vec<AtomicU64>,
    sum_micros: AtomicU64,
    count: AtomicU64,
}

impl Default for Histogram {
    fn default() -> Self {
        Self {
            buckets: DURATION_BUCKETS.iter().map(|_| AtomicU64::new(0)).collect(),
            sum_micros: AtomicU64::new(0),
            count: AtomicU64::new(0),
        }
    }
}

impl Histogram {
    pub fn observe(&self, duration: Duration) {
        let seconds = duration.as_secs_f64();
        for (bucket, bound) in self.buckets.iter().zip(DURATION_BUCKETS) {
            if seconds <= *bound {
                bucket.fetch_add(1, Ordering::Relaxed);
            }
        }
        self.sum_micros
            .fetch_add(duration.as_micros() as u64, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
    }

    fn render(&self, out: &mut String, name: &str, labels: &str) {
        for (bucket, bound) in self.buckets.iter().zip(DURATION_BUCKETS) {
            out.push_str(&format!(
                "{name}_bucket{{{labels}le=\"{bound}\"}} {}\n",
                bucket.load(Ordering::Relaxed)
            ));
        }
        let count = self.count.load(Ordering::Relaxed);
        out.push_str(&format!("{name}_bucket{{{labels}le=\"+Inf\"}} {count}\n"));
        out.push_str(&format!(
            "{name}_sum{{{labels_trimmed}}} {}\n",
            self.sum_micros.load(Ordering::Relaxed) as f64 / 1e6,
            labels_trimmed = labels.trim_end_matches(','),
        ));
        out.push_str(&format!(
            "{name}_count{{{labels_trimmed}}} {count}\n",
            labels_trimmed = labels.trim_end_matches(','),
        ));
    }
}

/// Per-job-kind completion counters and duration histogram.
#[derive(Debug, Default)]
pub struct JobMetrics {
    pub completed: AtomicU64,
    pub failed: AtomicU64,
    pub duration: Histogram,
}

#[derive(Debug, Default)]
pub struct Metrics {
    pub uploads_accepted: AtomicU64,
    pub uploads_rejected: AtomicU64,
    pub requests_exists: AtomicU64,
    pub requests_definitions: AtomicU64,
    pub requests_references: AtomicU64,
    pub requests_hover: AtomicU64,
    pub requests_not_indexed: AtomicU64,
    pub request_errors: AtomicU64,
    pub convert_jobs: JobMetrics,
    pub update_tips_jobs: JobMetrics,
    /// Sampled by the worker loop, not maintained transactionally.
    pub queue_depth: AtomicI64,
}

impl Metrics {
    pub fn render(&self, cache_stats: &[(&'static str, CacheStatsSnapshot)]) -> String {
        let mut out = String::new();

        out.push_str("# TYPE lsif_uploads_total counter\n");
        out.push_str(&format!(
            "lsif_uploads_total{{result=\"accepted\"}} {}\n",
            self.uploads_accepted.load(Ordering::Relaxed)
        ));
        out.push_str(&format!(
            "lsif_uploads_total{{result=\"rejected\"}} {}\n",
            self.uploads_rejected.load(Ordering::Relaxed)
        ));

        out.push_str("# TYPE lsif_requests_total counter\n");
        for (method, counter) in [
            ("exists", &self.requests_exists),
            ("definitions", &self.requests_definitions),
            ("references", &self.requests_references),
            ("hover", &self.requests_hover),
        ] {
            out.push_str(&format!(
                "lsif_requests_total{{method=\"{method}\"}} {}\n",
                counter.load(Ordering::Relaxed)
            ));
        }
        out.push_str("# TYPE lsif_requests_not_indexed_total counter\n");
        out.push_str(&format!(
            "lsif_requests_not_indexed_total {}\n",
            self.requests_not_indexed.load(Ordering::Relaxed)
        ));
        out.push_str("# TYPE lsif_request_errors_total counter\n");
        out.push_str(&format!(
            "lsif_request_errors_total {}\n",
            self.request_errors.load(Ordering::Relaxed)
        ));

        out.push_str("# TYPE lsif_jobs_total counter\n");
        out.push_str("# TYPE lsif_job_duration_seconds histogram\n");
        for (kind, job) in [
            ("convert", &self.convert_jobs),
            ("update-tips", &self.update_tips_jobs),
        ] {
            out.push_str(&format!(
                "lsif_jobs_total{{kind=\"{kind}\",result=\"completed\"}} {}\n",
                job.completed.load(Ordering::Relaxed)
            ));
            out.push_str(&format!(
                "lsif_jobs_total{{kind=\"{kind}\",result=\"failed\"}} {}\n",
                job.failed.load(Ordering::Relaxed)
            ));
            job.duration.render(
                &mut out,
                "lsif_job_duration_seconds",
                &format!("kind=\"{kind}\","),
            );
        }

        out.push_str("# TYPE lsif_queue_depth gauge\n");
        out.push_str(&format!(
            "lsif_queue_depth {}\n",
            self.queue_depth.load(Ordering::Relaxed)
        ));

        out.push_str("# TYPE lsif_cache_operations_total counter\n");
        out.push_str("# TYPE lsif_cache_entries gauge\n");
        for (name, stats) in cache_stats {
            for (op, value) in [
                ("hit", stats.hits),
                ("miss", stats.misses),
                ("eviction", stats.evictions),
            ] {
                out.push_str(&format!(
                    "lsif_cache_operations_total{{cache=\"{name}\",op=\"{op}\"}} {value}\n"
                ));
            }
            out.push_str(&format!(
                "lsif_cache_entries{{cache=\"{name}\"}} {}\n",
                stats.entries
            ));
        }

        out
    }
}
