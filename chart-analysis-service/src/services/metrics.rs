use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use prometheus::{
    Encoder, HistogramOpts, HistogramTimer, HistogramVec, IntCounter, IntCounterVec, IntGauge,
    Opts, Registry, TextEncoder,
};
use std::sync::OnceLock;

pub static METRICS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();
pub static PROMETHEUS_REGISTRY: OnceLock<Registry> = OnceLock::new();

struct ServiceMetrics {
    analysis_requests: IntCounterVec,
    llm_duration: HistogramVec,
    llm_tokens: IntCounterVec,
    key_redemptions: IntCounterVec,
    keys_issued: IntCounter,
    active_sessions: IntGauge,
    db_query_duration: HistogramVec,
}

static SERVICE_METRICS: OnceLock<ServiceMetrics> = OnceLock::new();

/// Install the global recorder and the service registry.
///
/// Called once from `main`; every recording helper below is a no-op until then.
pub fn init_metrics() -> Result<(), anyhow::Error> {
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| anyhow::anyhow!("failed to install Prometheus recorder: {}", e))?;

    if METRICS_HANDLE.set(handle).is_err() {
        anyhow::bail!("metrics already initialized");
    }

    let registry = Registry::new();

    let analysis_requests = IntCounterVec::new(
        Opts::new(
            "chart_analysis_requests_total",
            "Analysis requests by action and outcome",
        ),
        &["action", "outcome"],
    )?;

    let llm_duration = HistogramVec::new(
        HistogramOpts::new(
            "chart_llm_request_duration_seconds",
            "Vision model call latency in seconds",
        )
        .buckets(vec![0.5, 1.0, 2.5, 5.0, 10.0, 20.0, 30.0, 60.0, 120.0]),
        &["provider", "outcome"],
    )?;

    let llm_tokens = IntCounterVec::new(
        Opts::new("chart_llm_tokens_total", "Tokens consumed by direction"),
        &["provider", "direction"],
    )?;

    let key_redemptions = IntCounterVec::new(
        Opts::new(
            "chart_key_redemptions_total",
            "Registration key redemptions by outcome",
        ),
        &["outcome"],
    )?;

    let keys_issued = IntCounter::new("chart_keys_issued_total", "Registration keys issued")?;

    let active_sessions = IntGauge::new(
        "chart_active_sessions",
        "Analysis sessions currently held in memory",
    )?;

    let db_query_duration = HistogramVec::new(
        HistogramOpts::new(
            "chart_db_query_duration_seconds",
            "Database query duration in seconds",
        )
        .buckets(vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0]),
        &["operation"],
    )?;

    registry.register(Box::new(analysis_requests.clone()))?;
    registry.register(Box::new(llm_duration.clone()))?;
    registry.register(Box::new(llm_tokens.clone()))?;
    registry.register(Box::new(key_redemptions.clone()))?;
    registry.register(Box::new(keys_issued.clone()))?;
    registry.register(Box::new(active_sessions.clone()))?;
    registry.register(Box::new(db_query_duration.clone()))?;

    PROMETHEUS_REGISTRY
        .set(registry)
        .map_err(|_| anyhow::anyhow!("prometheus registry already set"))?;
    SERVICE_METRICS
        .set(ServiceMetrics {
            analysis_requests,
            llm_duration,
            llm_tokens,
            key_redemptions,
            keys_issued,
            active_sessions,
            db_query_duration,
        })
        .map_err(|_| anyhow::anyhow!("service metrics already set"))?;

    Ok(())
}

pub fn get_metrics() -> String {
    let mut output = METRICS_HANDLE
        .get()
        .map(|handle| handle.render())
        .unwrap_or_else(|| "# Metrics recorder not initialized\n".to_string());

    if let Some(registry) = PROMETHEUS_REGISTRY.get() {
        let encoder = TextEncoder::new();
        let metric_families = registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer).ok();
        if let Ok(custom_metrics) = String::from_utf8(buffer) {
            output.push_str(&custom_metrics);
        }
    }

    output
}

pub fn record_analysis(action: &str, outcome: &str) {
    if let Some(m) = SERVICE_METRICS.get() {
        m.analysis_requests
            .with_label_values(&[action, outcome])
            .inc();
    }
}

pub fn record_llm_call(provider: &str, outcome: &str, seconds: f64) {
    if let Some(m) = SERVICE_METRICS.get() {
        m.llm_duration
            .with_label_values(&[provider, outcome])
            .observe(seconds);
    }
}

pub fn record_llm_tokens(provider: &str, input: i32, output: i32) {
    if let Some(m) = SERVICE_METRICS.get() {
        m.llm_tokens
            .with_label_values(&[provider, "input"])
            .inc_by(input.max(0) as u64);
        m.llm_tokens
            .with_label_values(&[provider, "output"])
            .inc_by(output.max(0) as u64);
    }
}

pub fn record_redemption(outcome: &str) {
    if let Some(m) = SERVICE_METRICS.get() {
        m.key_redemptions.with_label_values(&[outcome]).inc();
    }
}

pub fn record_keys_issued(count: usize) {
    if let Some(m) = SERVICE_METRICS.get() {
        m.keys_issued.inc_by(count as u64);
    }
}

pub fn set_active_sessions(count: usize) {
    if let Some(m) = SERVICE_METRICS.get() {
        m.active_sessions.set(count as i64);
    }
}

/// Start a timer for a database operation; observed when dropped.
pub fn db_timer(operation: &str) -> Option<HistogramTimer> {
    SERVICE_METRICS
        .get()
        .map(|m| m.db_query_duration.with_label_values(&[operation]).start_timer())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_helpers_are_noops_before_init() {
        record_analysis("quick", "ok");
        record_llm_call("mock", "ok", 0.1);
        record_redemption("ok");
        assert!(db_timer("redeem_key").is_none() || SERVICE_METRICS.get().is_some());
    }

    #[test]
    fn test_get_metrics_without_recorder() {
        if METRICS_HANDLE.get().is_none() {
            assert!(get_metrics().contains("not initialized"));
        }
    }
}
