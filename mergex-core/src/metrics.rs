//! Prometheus metric families.
//!
//! The registry is owned by this struct and created at startup; nothing in
//! the core registers into a process-global registry, which keeps tests
//! parallel-safe. Family names are a stable contract with dashboards.

use prometheus::{
    Encoder, Histogram, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge,
    IntGaugeVec, Opts, Registry, TextEncoder,
};

pub struct Metrics {
    registry: Registry,

    pub webhook_requests_total: IntCounter,
    pub webhook_invalid_signatures_total: IntCounter,
    pub events_enqueued_total: IntCounterVec,
    pub events_deduped_total: IntCounter,
    pub events_ignored_total: IntCounterVec,

    pub queue_depth: IntGaugeVec,
    pub queue_oldest_age_seconds: IntGaugeVec,

    pub worker_lock_acquired_total: IntCounter,
    pub worker_lock_failed_total: IntCounter,
    pub worker_lock_lost_total: IntCounter,
    pub worker_active: IntGauge,
    pub worker_processing_seconds: Histogram,
    pub retries_total: IntCounter,

    pub github_api_requests_total: IntCounterVec,
    pub github_api_latency_seconds: HistogramVec,
    pub github_rate_limit_remaining: IntGauge,
    pub github_rate_limit_reset: IntGauge,
    pub throttles_total: IntCounter,
    pub backpressure_active: IntGaugeVec,

    pub branch_updates_total: IntCounterVec,
    pub checks_wait_seconds: Histogram,
    pub merge_attempts_total: IntCounter,
    pub merges_success_total: IntCounter,
    pub merges_failed_total: IntCounterVec,
    pub merge_blocked_total: IntCounter,
    pub starvation_requeue_total: IntCounter,
    pub dlq_pushes_total: IntCounter,
}

impl std::fmt::Debug for Metrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Metrics").finish()
    }
}

impl Metrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let webhook_requests_total = IntCounter::new(
            "webhook_requests_total",
            "Webhook deliveries received, valid or not",
        )?;
        let webhook_invalid_signatures_total = IntCounter::new(
            "webhook_invalid_signatures_total",
            "Webhook deliveries rejected for a bad or missing signature",
        )?;
        let events_enqueued_total = IntCounterVec::new(
            Opts::new("events_enqueued_total", "Work items enqueued, by event type"),
            &["event"],
        )?;
        let events_deduped_total = IntCounter::new(
            "events_deduped_total",
            "Events collapsed into an already queued or in-flight item",
        )?;
        let events_ignored_total = IntCounterVec::new(
            Opts::new("events_ignored_total", "Events that mapped to no work item"),
            &["event"],
        )?;

        let queue_depth = IntGaugeVec::new(
            Opts::new("queue_depth", "Pending work items per repository"),
            &["repo"],
        )?;
        let queue_oldest_age_seconds = IntGaugeVec::new(
            Opts::new(
                "queue_oldest_age_seconds",
                "Age of the oldest pending item per repository",
            ),
            &["repo"],
        )?;

        let worker_lock_acquired_total = IntCounter::new(
            "worker_lock_acquired_total",
            "Successful repo lease acquisitions",
        )?;
        let worker_lock_failed_total = IntCounter::new(
            "worker_lock_failed_total",
            "Lease acquisitions skipped because another worker holds the repo",
        )?;
        let worker_lock_lost_total = IntCounter::new(
            "worker_lock_lost_total",
            "Pipeline runs aborted because the lease expired mid-run",
        )?;
        let worker_active = IntGauge::new("worker_active", "Workers currently running a pipeline")?;
        let worker_processing_seconds = Histogram::with_opts(
            HistogramOpts::new(
                "worker_processing_seconds",
                "Wall-clock duration of one pipeline run",
            )
            .buckets(prometheus::exponential_buckets(0.1, 2.0, 14)?),
        )?;
        let retries_total =
            IntCounter::new("retries_total", "Work item retries across all repos")?;

        let github_api_requests_total = IntCounterVec::new(
            Opts::new("github_api_requests_total", "Remote API calls, by operation"),
            &["method"],
        )?;
        let github_api_latency_seconds = HistogramVec::new(
            HistogramOpts::new("github_api_latency_seconds", "Remote API call latency")
                .buckets(prometheus::exponential_buckets(0.05, 2.0, 10)?),
            &["method"],
        )?;
        let github_rate_limit_remaining = IntGauge::new(
            "github_rate_limit_remaining",
            "Most recently observed remaining API quota",
        )?;
        let github_rate_limit_reset = IntGauge::new(
            "github_rate_limit_reset",
            "Unix time at which the API quota resets",
        )?;
        let throttles_total = IntCounter::new(
            "throttles_total",
            "Installation cooldowns applied from quota pressure",
        )?;
        let backpressure_active = IntGaugeVec::new(
            Opts::new(
                "backpressure_active",
                "Whether an installation is currently throttled",
            ),
            &["installation"],
        )?;

        let branch_updates_total = IntCounterVec::new(
            Opts::new("branch_updates_total", "Branch update requests, by result"),
            &["result"],
        )?;
        let checks_wait_seconds = Histogram::with_opts(
            HistogramOpts::new(
                "checks_wait_seconds",
                "Time spent waiting on checks before exiting the wait phase",
            )
            .buckets(vec![
                1.0, 5.0, 15.0, 30.0, 60.0, 120.0, 300.0, 600.0, 1200.0, 1800.0, 3600.0,
            ]),
        )?;
        let merge_attempts_total =
            IntCounter::new("merge_attempts_total", "Merge API calls attempted")?;
        let merges_success_total =
            IntCounter::new("merges_success_total", "Pull requests merged")?;
        let merges_failed_total = IntCounterVec::new(
            Opts::new("merges_failed_total", "Merge attempts that failed, by reason"),
            &["reason"],
        )?;
        let merge_blocked_total = IntCounter::new(
            "merge_blocked_total",
            "Items dropped because branch protection reported the PR blocked",
        )?;
        let starvation_requeue_total = IntCounter::new(
            "starvation_requeue_total",
            "Items moved to the tail after exceeding the head-of-queue window",
        )?;
        let dlq_pushes_total =
            IntCounter::new("dlq_pushes_total", "Items moved to the dead-letter list")?;

        let collectors: Vec<Box<dyn prometheus::core::Collector>> = vec![
            Box::new(webhook_requests_total.clone()),
            Box::new(webhook_invalid_signatures_total.clone()),
            Box::new(events_enqueued_total.clone()),
            Box::new(events_deduped_total.clone()),
            Box::new(events_ignored_total.clone()),
            Box::new(queue_depth.clone()),
            Box::new(queue_oldest_age_seconds.clone()),
            Box::new(worker_lock_acquired_total.clone()),
            Box::new(worker_lock_failed_total.clone()),
            Box::new(worker_lock_lost_total.clone()),
            Box::new(worker_active.clone()),
            Box::new(worker_processing_seconds.clone()),
            Box::new(retries_total.clone()),
            Box::new(github_api_requests_total.clone()),
            Box::new(github_api_latency_seconds.clone()),
            Box::new(github_rate_limit_remaining.clone()),
            Box::new(github_rate_limit_reset.clone()),
            Box::new(throttles_total.clone()),
            Box::new(backpressure_active.clone()),
            Box::new(branch_updates_total.clone()),
            Box::new(checks_wait_seconds.clone()),
            Box::new(merge_attempts_total.clone()),
            Box::new(merges_success_total.clone()),
            Box::new(merges_failed_total.clone()),
            Box::new(merge_blocked_total.clone()),
            Box::new(starvation_requeue_total.clone()),
            Box::new(dlq_pushes_total.clone()),
        ];
        for collector in collectors {
            registry.register(collector)?;
        }

        Ok(Self {
            registry,
            webhook_requests_total,
            webhook_invalid_signatures_total,
            events_enqueued_total,
            events_deduped_total,
            events_ignored_total,
            queue_depth,
            queue_oldest_age_seconds,
            worker_lock_acquired_total,
            worker_lock_failed_total,
            worker_lock_lost_total,
            worker_active,
            worker_processing_seconds,
            retries_total,
            github_api_requests_total,
            github_api_latency_seconds,
            github_rate_limit_remaining,
            github_rate_limit_reset,
            throttles_total,
            backpressure_active,
            branch_updates_total,
            checks_wait_seconds,
            merge_attempts_total,
            merges_success_total,
            merges_failed_total,
            merge_blocked_total,
            starvation_requeue_total,
            dlq_pushes_total,
        })
    }

    /// Text exposition for `GET /metrics`.
    pub fn render(&self) -> String {
        let mut buf = Vec::new();
        let encoder = TextEncoder::new();
        if let Err(e) = encoder.encode(&self.registry.gather(), &mut buf) {
            tracing::error!("metrics encoding failed: {e}");
            return String::new();
        }
        String::from_utf8(buf).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registers_and_renders_all_families() {
        let metrics = Metrics::new().unwrap();
        metrics.webhook_requests_total.inc();
        metrics
            .events_enqueued_total
            .with_label_values(&["pull_request"])
            .inc();
        metrics.queue_depth.with_label_values(&["1/o/r"]).set(3);
        metrics
            .merges_failed_total
            .with_label_values(&["not_mergeable"])
            .inc();

        let text = metrics.render();
        for family in [
            "webhook_requests_total",
            "events_enqueued_total",
            "queue_depth",
            "merges_failed_total",
        ] {
            assert!(text.contains(family), "missing family {family}");
        }
    }

    #[test]
    fn registries_are_independent() {
        // Two instances must not collide; a shared default registry would
        // panic on duplicate registration here.
        let a = Metrics::new().unwrap();
        let b = Metrics::new().unwrap();
        a.merges_success_total.inc();
        assert_eq!(b.merges_success_total.get(), 0);
    }
}
