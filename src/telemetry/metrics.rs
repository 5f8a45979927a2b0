//! Metric emission points.
//!
//! Each function records through the `metrics` facade and into the
//! process-wide [`MetricsStore`].

use std::sync::OnceLock;
use std::time::Duration;

use metrics::{counter, gauge, histogram};

use super::store::MetricsStore;
use crate::status::StatusCode;

static STORE: OnceLock<MetricsStore> = OnceLock::new();

pub fn global_store() -> &'static MetricsStore {
    STORE.get_or_init(MetricsStore::new)
}

pub fn record_plan(queues: usize, bindings: usize, submodels: usize) {
    counter!("gg_deploy_plans_total").increment(1);
    histogram!("gg_deploy_plan_queues").record(queues as f64);
    histogram!("gg_deploy_plan_bindings").record(bindings as f64);
    let store = global_store();
    store.increment_counter("plans_total", 1);
    store.record_histogram("plan_queues", queues as f64);
    store.record_histogram("plan_bindings", bindings as f64);
    store.record_histogram("plan_submodels", submodels as f64);
}

/// One handled device request, labelled by kind and outcome.
pub fn record_request(kind: &'static str, status: StatusCode) {
    counter!("gg_deploy_requests_total", "kind" => kind, "status" => status.as_str()).increment(1);
    global_store().increment_counter(&format!("requests.{kind}.{}", status.as_str()), 1);
}

pub fn record_download(bytes: usize) {
    counter!("gg_deploy_download_bytes_total").increment(bytes as u64);
    global_store().increment_counter("download_bytes_total", bytes as u64);
}

pub fn record_activation() {
    counter!("gg_deploy_activations_total").increment(1);
    global_store().increment_counter("activations_total", 1);
}

pub fn record_execution(elapsed: Duration, success: bool) {
    let outcome = if success { "ok" } else { "error" };
    histogram!("gg_deploy_execution_seconds", "outcome" => outcome).record(elapsed.as_secs_f64());
    let store = global_store();
    store.increment_counter(&format!("executions.{outcome}"), 1);
    store.record_histogram("execution_ms", elapsed.as_secs_f64() * 1000.0);
}

pub fn record_deploy(elapsed: Duration, success: bool) {
    let outcome = if success { "ok" } else { "error" };
    counter!("gg_deploy_deployments_total", "outcome" => outcome).increment(1);
    histogram!("gg_deploy_deploy_seconds").record(elapsed.as_secs_f64());
    let store = global_store();
    store.increment_counter(&format!("deployments.{outcome}"), 1);
    store.record_histogram("deploy_ms", elapsed.as_secs_f64() * 1000.0);
}

pub fn set_deployed_models(count: usize) {
    gauge!("gg_deploy_deployed_models").set(count as f64);
    global_store().set_gauge("deployed_models", count as f64);
}
