use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tera::Context;

use crate::errors::BurnerError;
use crate::indexer::{IndexOpts, Indexer};
use crate::io_models::alert::{AlertRule, Severity};
use crate::runner::{EXIT_ALERT_CRITICAL, FatalSink};
use crate::template::render_with_context;

/// The wall-clock window of one executed job, with the churn sub-window when
/// the job churned.
#[derive(Debug, Clone)]
pub struct JobWindow {
    pub job_name: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub churn_start: Option<DateTime<Utc>>,
    pub churn_end: Option<DateTime<Utc>>,
}

/// One classified alert hit, indexed under `metricName: "alert"`.
#[derive(Serialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct AlertRecord {
    pub timestamp: DateTime<Utc>,
    pub uuid: String,
    pub severity: Severity,
    pub description: String,
    pub metric_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub churn_metric: Option<bool>,
    pub metadata: BTreeMap<String, String>,
}

/// Range-queries the metrics backend over each job window and classifies the
/// hits. Expressions are templates themselves: every process env var is
/// available under its own name, plus `elapsed` as the window duration in
/// minutes with the `m` suffix.
pub struct AlertEvaluator {
    http: reqwest::Client,
    endpoint: String,
    step: Duration,
    uuid: String,
    rules: Vec<AlertRule>,
    indexer: Arc<dyn Indexer>,
    fatal: Arc<dyn FatalSink>,
}

impl AlertEvaluator {
    pub fn new(
        endpoint: String,
        step: Duration,
        uuid: String,
        rules: Vec<AlertRule>,
        indexer: Arc<dyn Indexer>,
        fatal: Arc<dyn FatalSink>,
    ) -> Self {
        AlertEvaluator {
            http: reqwest::Client::new(),
            endpoint: endpoint.trim_end_matches('/').to_string(),
            step,
            uuid,
            rules,
            indexer,
            fatal,
        }
    }

    pub async fn evaluate_window(&self, window: &JobWindow) -> Result<Vec<AlertRecord>, BurnerError> {
        let mut records = Vec::new();

        for rule in &self.rules {
            let expr = render_expr(&rule.expr, window)?;
            debug!("evaluating [{expr}] over job {} window", window.job_name);
            let series = self.query_range(&expr, window).await?;

            for entry in series {
                // one alert per series: only the first sample matters, the
                // goal is presence of a hit
                let Some((ts, raw_value)) = entry.values.into_iter().next() else {
                    continue;
                };
                let value = raw_value.parse::<f64>().map_err(|e| BurnerError::BadResult {
                    raw_error_message: format!("sample value `{raw_value}` is not a float: {e}"),
                })?;
                let value = (value * 1000.0).round() / 1000.0;

                let mut context = Context::new();
                context.insert("Labels", &entry.metric);
                context.insert("Value", &value);
                let description = render_with_context(&rule.description, &context)?;

                let timestamp = DateTime::from_timestamp(ts as i64, 0).unwrap_or(window.start);
                let churn_metric = match (window.churn_start, window.churn_end) {
                    (Some(from), Some(to)) if timestamp >= from && timestamp <= to => Some(true),
                    _ => None,
                };

                match rule.severity {
                    Severity::Warning => warn!("alert [{}]: {description}", window.job_name),
                    Severity::Error => error!("alert [{}]: {description}", window.job_name),
                    Severity::Critical => error!("CRITICAL alert [{}]: {description}", window.job_name),
                }

                records.push(AlertRecord {
                    timestamp,
                    uuid: self.uuid.clone(),
                    severity: rule.severity,
                    description,
                    metric_name: "alert".to_string(),
                    churn_metric,
                    metadata: BTreeMap::from([("jobName".to_string(), window.job_name.clone())]),
                });
            }
        }

        if !records.is_empty() {
            let docs: Vec<serde_json::Value> = records
                .iter()
                .map(|r| serde_json::to_value(r))
                .collect::<Result<_, _>>()
                .map_err(|e| BurnerError::BadResult {
                    raw_error_message: e.to_string(),
                })?;
            let opts = IndexOpts {
                metric_name: "alert".to_string(),
                job_name: Some(window.job_name.clone()),
            };
            self.indexer.index(&docs, &opts).await?;
        }

        if let Some(critical) = records.iter().find(|r| r.severity == Severity::Critical) {
            self.fatal.fatal(EXIT_ALERT_CRITICAL, &critical.description);
            return Err(BurnerError::AlertCritical {
                description: critical.description.clone(),
            });
        }

        Ok(records)
    }

    async fn query_range(&self, expr: &str, window: &JobWindow) -> Result<Vec<MatrixSeries>, BurnerError> {
        let url = format!("{}/api/v1/query_range", self.endpoint);
        let response = self
            .http
            .get(&url)
            .query(&[
                ("query", expr.to_string()),
                ("start", window.start.timestamp().to_string()),
                ("end", window.end.timestamp().to_string()),
                ("step", self.step.as_secs().to_string()),
            ])
            .send()
            .await
            .map_err(|e| BurnerError::Transient {
                raw_error_message: format!("metrics backend query failed: {e}"),
            })?;

        if !response.status().is_success() {
            return Err(BurnerError::BadResult {
                raw_error_message: format!(
                    "metrics backend returned {}: {}",
                    response.status(),
                    response.text().await.unwrap_or_default()
                ),
            });
        }

        let body: serde_json::Value = response.json().await.map_err(|e| BurnerError::BadResult {
            raw_error_message: format!("metrics backend returned invalid JSON: {e}"),
        })?;
        parse_matrix(&body)
    }
}

#[derive(serde::Deserialize, Debug)]
struct MatrixSeries {
    metric: BTreeMap<String, String>,
    values: Vec<(f64, String)>,
}

/// Range queries must come back as a matrix; any other shape is a contract
/// violation.
fn parse_matrix(body: &serde_json::Value) -> Result<Vec<MatrixSeries>, BurnerError> {
    let status = body.get("status").and_then(serde_json::Value::as_str).unwrap_or("");
    if status != "success" {
        return Err(BurnerError::BadResult {
            raw_error_message: format!("query status is `{status}`"),
        });
    }

    let result_type = body
        .pointer("/data/resultType")
        .and_then(serde_json::Value::as_str)
        .unwrap_or("");
    if result_type != "matrix" {
        return Err(BurnerError::BadResult {
            raw_error_message: format!("expected a matrix result, got `{result_type}`"),
        });
    }

    let result = body
        .pointer("/data/result")
        .cloned()
        .unwrap_or(serde_json::Value::Array(Vec::new()));
    serde_json::from_value(result).map_err(|e| BurnerError::BadResult {
        raw_error_message: format!("malformed matrix result: {e}"),
    })
}

fn render_expr(expr: &str, window: &JobWindow) -> Result<String, BurnerError> {
    let mut context = Context::new();
    for (key, value) in std::env::vars() {
        context.insert(key.as_str(), &value);
    }
    let minutes = (window.end - window.start).num_minutes().max(1);
    context.insert("elapsed", &format!("{minutes}m"));
    render_with_context(expr, &context)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::indexer::NoopIndexer;
    use std::sync::Mutex;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    /// Records instead of exiting so severity dispatch is observable.
    #[derive(Default)]
    struct RecordingSink {
        calls: Mutex<Vec<(i32, String)>>,
    }

    impl FatalSink for RecordingSink {
        fn fatal(&self, exit_code: i32, reason: &str) {
            self.calls.lock().unwrap().push((exit_code, reason.to_string()));
        }
    }

    fn window() -> JobWindow {
        JobWindow {
            job_name: "storm".to_string(),
            start: DateTime::from_timestamp(1_700_000_000, 0).unwrap(),
            end: DateTime::from_timestamp(1_700_000_600, 0).unwrap(),
            churn_start: None,
            churn_end: None,
        }
    }

    fn matrix_body(value: &str) -> serde_json::Value {
        serde_json::json!({
            "status": "success",
            "data": {
                "resultType": "matrix",
                "result": [{
                    "metric": {"instance": "i1"},
                    "values": [[1_700_000_060.0, value], [1_700_000_120.0, "1"]],
                }],
            },
        })
    }

    fn evaluator(
        endpoint: String,
        rules: Vec<AlertRule>,
        sink: Arc<RecordingSink>,
    ) -> AlertEvaluator {
        AlertEvaluator::new(
            endpoint,
            Duration::from_secs(30),
            "run-uuid".to_string(),
            rules,
            Arc::new(NoopIndexer),
            sink,
        )
    }

    #[test]
    fn test_parse_matrix_rejects_vector() {
        let body = serde_json::json!({
            "status": "success",
            "data": {"resultType": "vector", "result": []},
        });
        assert!(matches!(parse_matrix(&body), Err(BurnerError::BadResult { .. })));
    }

    #[test]
    fn test_parse_matrix_rejects_failed_status() {
        let body = serde_json::json!({"status": "error", "errorType": "bad_data"});
        assert!(matches!(parse_matrix(&body), Err(BurnerError::BadResult { .. })));
    }

    #[test]
    fn test_render_expr_exposes_env_and_elapsed() {
        // SAFETY: test-only env mutation, no concurrent reader of this var
        unsafe { std::env::set_var("BURNER_TEST_NODES", "12") };
        let rendered = render_expr("count(up) < {{ BURNER_TEST_NODES }} and [{{ elapsed }}]", &window()).unwrap();
        assert_eq!(rendered, "count(up) < 12 and [10m]");
    }

    #[tokio::test]
    async fn test_critical_alert_hits_the_fatal_sink() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v1/query_range"))
            .and(query_param("query", "up == 0"))
            .respond_with(ResponseTemplate::new(200).set_body_json(matrix_body("0")))
            .mount(&server)
            .await;

        let sink = Arc::new(RecordingSink::default());
        let rules = vec![AlertRule {
            expr: "up == 0".to_string(),
            description: "{{ Labels.instance }} down".to_string(),
            severity: Severity::Critical,
        }];

        let err = evaluator(server.uri(), rules, sink.clone())
            .evaluate_window(&window())
            .await
            .unwrap_err();

        assert_eq!(
            err,
            BurnerError::AlertCritical {
                description: "i1 down".to_string()
            }
        );
        let calls = sink.calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0], (EXIT_ALERT_CRITICAL, "i1 down".to_string()));
    }

    #[tokio::test]
    async fn test_first_sample_only_and_value_rounding() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v1/query_range"))
            .respond_with(ResponseTemplate::new(200).set_body_json(matrix_body("0.123456")))
            .mount(&server)
            .await;

        let sink = Arc::new(RecordingSink::default());
        let rules = vec![AlertRule {
            expr: "up".to_string(),
            description: "value is {{ Value }}".to_string(),
            severity: Severity::Warning,
        }];

        let records = evaluator(server.uri(), rules, sink.clone())
            .evaluate_window(&window())
            .await
            .unwrap();

        // two samples in the series, exactly one alert
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].description, "value is 0.123");
        assert_eq!(records[0].metric_name, "alert");
        assert_eq!(records[0].timestamp.timestamp(), 1_700_000_060);
        assert!(records[0].churn_metric.is_none());
        assert!(sink.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_churn_window_tagging() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v1/query_range"))
            .respond_with(ResponseTemplate::new(200).set_body_json(matrix_body("1")))
            .mount(&server)
            .await;

        let mut w = window();
        w.churn_start = DateTime::from_timestamp(1_700_000_000, 0);
        w.churn_end = DateTime::from_timestamp(1_700_000_100, 0);

        let sink = Arc::new(RecordingSink::default());
        let rules = vec![AlertRule {
            expr: "up".to_string(),
            description: "hit".to_string(),
            severity: Severity::Error,
        }];

        let records = evaluator(server.uri(), rules, sink)
            .evaluate_window(&w)
            .await
            .unwrap();
        assert_eq!(records[0].churn_metric, Some(true));
        assert_eq!(records[0].severity, Severity::Error);
    }

    #[tokio::test]
    async fn test_non_matrix_response_is_a_bad_result() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v1/query_range"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "status": "success",
                "data": {"resultType": "vector", "result": []},
            })))
            .mount(&server)
            .await;

        let sink = Arc::new(RecordingSink::default());
        let rules = vec![AlertRule {
            expr: "up".to_string(),
            description: "hit".to_string(),
            severity: Severity::Warning,
        }];

        let err = evaluator(server.uri(), rules, sink)
            .evaluate_window(&window())
            .await
            .unwrap_err();
        assert!(matches!(err, BurnerError::BadResult { .. }));
    }
}
