use std::sync::{Arc, OnceLock};

use prometheus::{
    CounterVec, Encoder, HistogramOpts, HistogramVec, Opts, Registry, TextEncoder,
};

#[derive(Clone, Debug)]
pub struct MetricsRegistry {
    inner: Arc<MetricsInner>,
}

#[derive(Debug)]
struct MetricsInner {
    registry: Registry,
    dynamic_filters_published: CounterVec,
    dynamic_filter_collection_seconds: HistogramVec,
    dynamic_filters_forced_unblock: CounterVec,
    scheduler_splits_scheduled: CounterVec,
    scheduler_tasks_created: CounterVec,
    scheduler_blocked: CounterVec,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MetricsInner::new()),
        }
    }

    pub fn record_dynamic_filter_published(&self, query_id: u64, collection_secs: f64) {
        let query = query_id.to_string();
        let labels = [query.as_str()];
        self.inner
            .dynamic_filters_published
            .with_label_values(&labels)
            .inc();
        self.inner
            .dynamic_filter_collection_seconds
            .with_label_values(&labels)
            .observe(collection_secs.max(0.0));
    }

    pub fn inc_dynamic_filters_forced_unblock(&self, query_id: u64, count: u64) {
        let query = query_id.to_string();
        let labels = [query.as_str()];
        self.inner
            .dynamic_filters_forced_unblock
            .with_label_values(&labels)
            .inc_by(count as f64);
    }

    pub fn record_schedule(
        &self,
        query_id: u64,
        stage_id: u32,
        splits_scheduled: u64,
        tasks_created: u64,
    ) {
        let (query, stage) = (query_id.to_string(), stage_id.to_string());
        let labels = [query.as_str(), stage.as_str()];
        self.inner
            .scheduler_splits_scheduled
            .with_label_values(&labels)
            .inc_by(splits_scheduled as f64);
        self.inner
            .scheduler_tasks_created
            .with_label_values(&labels)
            .inc_by(tasks_created as f64);
    }

    pub fn inc_scheduler_blocked(&self, query_id: u64, stage_id: u32, reason: &str) {
        let (query, stage) = (query_id.to_string(), stage_id.to_string());
        let labels = [query.as_str(), stage.as_str(), reason];
        self.inner
            .scheduler_blocked
            .with_label_values(&labels)
            .inc();
    }

    pub fn render_prometheus(&self) -> String {
        let metric_families = self.inner.registry.gather();
        let mut out = Vec::new();
        let enc = TextEncoder::new();
        if enc.encode(&metric_families, &mut out).is_err() {
            return String::new();
        }
        String::from_utf8_lossy(&out).to_string()
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsInner {
    fn new() -> Self {
        let registry = Registry::new();

        let dynamic_filters_published = counter_vec(
            &registry,
            "sift_dynamic_filters_published_total",
            "Dynamic filter summaries published",
            &["query_id"],
        );
        let dynamic_filter_collection_seconds = histogram_vec(
            &registry,
            "sift_dynamic_filter_collection_seconds",
            "Time from query registration to summary publication",
            &["query_id"],
        );
        let dynamic_filters_forced_unblock = counter_vec(
            &registry,
            "sift_dynamic_filters_forced_unblock_total",
            "Lazy dynamic filters resolved without data to avoid scheduling deadlock",
            &["query_id"],
        );

        let scheduler_splits_scheduled = counter_vec(
            &registry,
            "sift_scheduler_splits_scheduled_total",
            "Splits assigned to tasks",
            &["query_id", "stage_id"],
        );
        let scheduler_tasks_created = counter_vec(
            &registry,
            "sift_scheduler_tasks_created_total",
            "Tasks created by source stage schedulers",
            &["query_id", "stage_id"],
        );
        let scheduler_blocked = counter_vec(
            &registry,
            "sift_scheduler_blocked_total",
            "Schedule calls that returned blocked",
            &["query_id", "stage_id", "reason"],
        );

        Self {
            registry,
            dynamic_filters_published,
            dynamic_filter_collection_seconds,
            dynamic_filters_forced_unblock,
            scheduler_splits_scheduled,
            scheduler_tasks_created,
            scheduler_blocked,
        }
    }
}

fn counter_vec(registry: &Registry, name: &str, help: &str, labels: &[&str]) -> CounterVec {
    let c = CounterVec::new(Opts::new(name, help), labels).expect("counter vec");
    registry
        .register(Box::new(c.clone()))
        .expect("register counter");
    c
}

fn histogram_vec(registry: &Registry, name: &str, help: &str, labels: &[&str]) -> HistogramVec {
    let h = HistogramVec::new(HistogramOpts::new(name, help), labels).expect("histogram vec");
    registry
        .register(Box::new(h.clone()))
        .expect("register histogram");
    h
}

static GLOBAL_METRICS: OnceLock<MetricsRegistry> = OnceLock::new();

pub fn global_metrics() -> &'static MetricsRegistry {
    GLOBAL_METRICS.get_or_init(MetricsRegistry::new)
}
