// Centralized Observability Infrastructure
// Structured logging, metrics, and tracing, plus the credential-masking function
// that every external-boundary emission (tool response, log line, migration
// report) is required to route through (`spec.md` §5).

use anyhow::Result;
use chrono::Utc;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, instrument};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use uuid::Uuid;

static OPERATION_COUNTER: AtomicU64 = AtomicU64::new(0);
static ERROR_COUNTER: AtomicU64 = AtomicU64::new(0);
static QUERY_COUNTER: AtomicU64 = AtomicU64::new(0);
static INGEST_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Initialize logging and tracing. Call once at process startup.
pub fn init_logging() -> Result<()> {
    init_logging_with_level(false, false)
}

pub fn init_logging_with_level(verbose: bool, quiet: bool) -> Result<()> {
    let filter_level = if quiet {
        EnvFilter::new("error")
    } else if verbose {
        EnvFilter::new("hybridrag=debug,info")
    } else {
        EnvFilter::new("hybridrag=warn,error")
    };

    let env_filter = if quiet {
        EnvFilter::new("error")
    } else if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::try_from_default_env().unwrap_or(filter_level)
    } else {
        filter_level
    };

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(!quiet)
        .with_thread_ids(!quiet)
        .with_line_number(!quiet)
        .with_file(!quiet)
        .with_ansi(true);

    match tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .try_init()
    {
        Ok(()) => {
            if !quiet {
                info!("hybridrag observability initialized");
            }
            Ok(())
        }
        Err(_) => Ok(()), // already initialized — fine in tests
    }
}

/// Structured operation kinds logged across the system's components.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Operation {
    RegistryRegister { database: String },
    RegistryUpdate { database: String },
    LedgerClaim { fingerprint: String },
    LedgerComplete { fingerprint: String },
    LedgerFail { fingerprint: String },
    PipelineEnqueue { database: String, tier_hint: String },
    WatcherScan { database: String, candidates: usize },
    DispatchCall { database: String, tool: String, tier: String },
    MigrationPhase { job_id: String, phase: String },
    Startup { version: String },
    Shutdown { reason: String },
}

/// Metric types for performance monitoring.
#[derive(Debug, Clone)]
pub enum MetricType {
    Counter { name: &'static str, value: u64 },
    Gauge { name: &'static str, value: f64 },
    Histogram { name: &'static str, value: f64, unit: &'static str },
    Timer { name: &'static str, duration: Duration },
}

/// Operation context threaded through one logical call for span nesting.
#[derive(Debug, Clone)]
pub struct OperationContext {
    pub trace_id: Uuid,
    pub span_id: Uuid,
    pub parent_span_id: Option<Uuid>,
    pub operation: String,
    pub start_time: Instant,
    pub attributes: Vec<(String, String)>,
}

impl OperationContext {
    pub fn new(operation: impl Into<String>) -> Self {
        Self {
            trace_id: Uuid::new_v4(),
            span_id: Uuid::new_v4(),
            parent_span_id: None,
            operation: operation.into(),
            start_time: Instant::now(),
            attributes: Vec::new(),
        }
    }

    pub fn child(&self, operation: impl Into<String>) -> Self {
        Self {
            trace_id: self.trace_id,
            span_id: Uuid::new_v4(),
            parent_span_id: Some(self.span_id),
            operation: operation.into(),
            start_time: Instant::now(),
            attributes: Vec::new(),
        }
    }

    pub fn add_attribute(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.attributes.push((key.into(), value.into()));
    }

    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }
}

#[instrument(skip(ctx))]
pub fn log_operation(ctx: &OperationContext, op: &Operation, result: &Result<()>) {
    let elapsed = ctx.elapsed();
    let attrs = ctx
        .attributes
        .iter()
        .map(|(k, v)| format!("{k}={}", mask_if_sensitive(k, v)))
        .collect::<Vec<_>>()
        .join(", ");

    match result {
        Ok(()) => {
            info!(
                trace_id = %ctx.trace_id,
                span_id = %ctx.span_id,
                parent_span_id = ?ctx.parent_span_id,
                operation = %ctx.operation,
                elapsed_ms = elapsed.as_millis(),
                attributes = %attrs,
                "operation completed: {:?}", op
            );
            OPERATION_COUNTER.fetch_add(1, Ordering::Relaxed);
        }
        Err(e) => {
            error!(
                trace_id = %ctx.trace_id,
                span_id = %ctx.span_id,
                parent_span_id = ?ctx.parent_span_id,
                operation = %ctx.operation,
                elapsed_ms = elapsed.as_millis(),
                attributes = %attrs,
                error = %e,
                "operation failed: {:?}", op
            );
            ERROR_COUNTER.fetch_add(1, Ordering::Relaxed);
        }
    }

    match op {
        Operation::DispatchCall { .. } => {
            QUERY_COUNTER.fetch_add(1, Ordering::Relaxed);
        }
        Operation::PipelineEnqueue { .. } | Operation::LedgerComplete { .. } => {
            INGEST_COUNTER.fetch_add(1, Ordering::Relaxed);
        }
        _ => {}
    }
}

pub fn record_metric(metric: MetricType) {
    match metric {
        MetricType::Counter { name, value } => debug!("metric.counter {} = {}", name, value),
        MetricType::Gauge { name, value } => debug!("metric.gauge {} = {}", name, value),
        MetricType::Histogram { name, value, unit } => {
            debug!("metric.histogram {} = {} {}", name, value, unit)
        }
        MetricType::Timer { name, duration } => debug!("metric.timer {} = {:?}", name, duration),
    }
}

pub async fn with_trace_id<F, T>(operation: &str, f: F) -> Result<T>
where
    F: std::future::Future<Output = Result<T>>,
{
    let ctx = OperationContext::new(operation);
    info!(trace_id = %ctx.trace_id, span_id = %ctx.span_id, "starting operation: {}", operation);

    let start = Instant::now();
    let result = f.await;
    let elapsed = start.elapsed();

    match &result {
        Ok(_) => {
            info!(
                trace_id = %ctx.trace_id, span_id = %ctx.span_id,
                elapsed_ms = elapsed.as_millis(),
                "operation completed successfully: {}", operation
            );
            record_metric(MetricType::Timer { name: "operation.duration", duration: elapsed });
        }
        Err(e) => {
            error!(
                trace_id = %ctx.trace_id, span_id = %ctx.span_id,
                elapsed_ms = elapsed.as_millis(), error = %e,
                "operation failed: {}", operation
            );
            record_metric(MetricType::Counter { name: "operation.errors", value: 1 });
        }
    }

    result
}

pub fn get_metrics() -> serde_json::Value {
    serde_json::json!({
        "operations": {
            "total": OPERATION_COUNTER.load(Ordering::Relaxed),
            "errors": ERROR_COUNTER.load(Ordering::Relaxed),
            "dispatches": QUERY_COUNTER.load(Ordering::Relaxed),
            "ingests": INGEST_COUNTER.load(Ordering::Relaxed),
        },
        "timestamp": Utc::now().to_rfc3339(),
    })
}

pub struct PerfTimer {
    name: String,
    start: Instant,
    ctx: OperationContext,
}

impl PerfTimer {
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        let ctx = OperationContext::new(&name);
        info!(trace_id = %ctx.trace_id, span_id = %ctx.span_id, "timer started: {}", name);
        Self { name, start: Instant::now(), ctx }
    }
}

impl Drop for PerfTimer {
    fn drop(&mut self) {
        let elapsed = self.start.elapsed();
        info!(
            trace_id = %self.ctx.trace_id, span_id = %self.ctx.span_id,
            elapsed_ms = elapsed.as_millis(), "timer completed: {}", self.name
        );
        record_metric(MetricType::Timer { name: "perf.timer", duration: elapsed });
    }
}

// Matches as a substring so registry fields like `password_ref` are covered too.
static SENSITIVE_KEY: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)(password|secret|api_key|token)").expect("static regex"));

const MASKED_VALUE: &str = "<masked>";

fn mask_if_sensitive(key: &str, value: &str) -> String {
    if SENSITIVE_KEY.is_match(key) {
        MASKED_VALUE.to_string()
    } else {
        value.to_string()
    }
}

/// Recursively replace the value of any object key matching `password`, `secret`,
/// `api_key`, or `token` (case-insensitive) with a fixed opaque token. Applied to
/// every JSON value that crosses an external boundary: tool responses, migration
/// reports, and structured log payloads (`spec.md` §5).
pub fn mask_credentials(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let masked = map
                .iter()
                .map(|(k, v)| {
                    if SENSITIVE_KEY.is_match(k) {
                        (k.clone(), Value::String(MASKED_VALUE.to_string()))
                    } else {
                        (k.clone(), mask_credentials(v))
                    }
                })
                .collect();
            Value::Object(masked)
        }
        Value::Array(items) => Value::Array(items.iter().map(mask_credentials).collect()),
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_operation_context_creation() {
        let ctx = OperationContext::new("test_operation");
        assert_eq!(ctx.operation, "test_operation");
        assert!(ctx.parent_span_id.is_none());

        let child = ctx.child("child_operation");
        assert_eq!(child.trace_id, ctx.trace_id);
        assert_eq!(child.parent_span_id, Some(ctx.span_id));
    }

    #[test]
    fn test_mask_credentials_nested() {
        let input = json!({
            "database_name": "proj1",
            "backend_config": {
                "host": "db.internal",
                "password_ref": "hunter2",
                "nested": { "api_key": "sk-abc", "Token": "xyz" }
            },
            "list": [ { "secret": "s1" }, { "ok": "value" } ]
        });

        let masked = mask_credentials(&input);
        assert_eq!(masked["database_name"], "proj1");
        assert_eq!(masked["backend_config"]["host"], "db.internal");
        assert_eq!(masked["backend_config"]["password_ref"], "<masked>");
        assert_eq!(masked["backend_config"]["nested"]["api_key"], "<masked>");
        assert_eq!(masked["backend_config"]["nested"]["Token"], "<masked>");
        assert_eq!(masked["list"][0]["secret"], "<masked>");
        assert_eq!(masked["list"][1]["ok"], "value");
        let serialized = masked.to_string();
        assert!(!serialized.contains("hunter2"));
        assert!(!serialized.contains("sk-abc"));
    }

    #[test]
    fn test_metrics_recording() {
        record_metric(MetricType::Counter { name: "test.counter", value: 42 });
        let metrics = get_metrics();
        assert!(metrics["timestamp"].is_string());
        assert!(metrics["operations"].is_object());
    }

    #[tokio::test]
    async fn test_with_trace_id() {
        let result = with_trace_id("test_async_op", async {
            tokio::time::sleep(Duration::from_millis(5)).await;
            Ok::<_, anyhow::Error>(42)
        })
        .await;
        assert_eq!(result.unwrap(), 42);
    }
}
