//! Control & Query Server
//!
//! One HTTP/1 listener for operators and metrics consumers:
//!
//! | Route | |
//! |---|---|
//! | `GET /-/healthy` | liveness |
//! | `GET /-/ready` | 200 once scraping has started, 503 before |
//! | `POST /-/reload` | re-read the configuration file |
//! | `GET /api/v1/query` | instant query: `query`, optional `time` |
//! | `GET /api/v1/query_range` | range query: `query`, `start`, `end` |
//! | `GET /api/v1/targets` | scrape target status |
//! | `GET /api/v1/status` | store statistics and any startup failure |
//! | `GET /metrics` | our own metrics |
//!
//! API bodies are `{"status":"success","data":...}` or
//! `{"status":"error","error":"..."}`.

use std::collections::HashMap;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, TimeZone, Utc};
use http_body_util::Full;
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde::Serialize;
use serde_json::{json, Map, Value};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{Error, Result};
use crate::fleet::Collector;
use crate::store::{Labels, Point, Selector};
use crate::telemetry;

/// How far back an instant query looks for the latest point
pub const LOOKBACK: Duration = Duration::from_secs(300);

pub async fn bind(addr: SocketAddr) -> Result<TcpListener> {
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| Error::Internal(format!("Failed to bind control server: {}", e)))?;
    info!("Control server listening on {}", addr);
    Ok(listener)
}

/// Accept connections until cancelled
pub async fn serve(
    listener: TcpListener,
    collector: Arc<Collector>,
    cancel: CancellationToken,
) -> Result<()> {
    loop {
        let (stream, peer) = tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => accepted
                .map_err(|e| Error::Internal(format!("Control server accept error: {}", e)))?,
        };
        debug!("Connection from {}", peer);

        let io = TokioIo::new(stream);
        let collector = collector.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            let service = service_fn(move |req: Request<hyper::body::Incoming>| {
                let collector = collector.clone();
                async move { Ok::<_, Infallible>(handle(&collector, req).await) }
            });
            let conn = http1::Builder::new().serve_connection(io, service);
            tokio::pin!(conn);

            tokio::select! {
                result = conn.as_mut() => {
                    if let Err(e) = result {
                        error!("Control server connection error: {}", e);
                    }
                }
                _ = cancel.cancelled() => {
                    conn.as_mut().graceful_shutdown();
                    if let Err(e) = conn.as_mut().await {
                        debug!("Connection closed during shutdown: {}", e);
                    }
                }
            }
        });
    }
    info!("Control server stopped");
    Ok(())
}

async fn handle<B>(collector: &Collector, req: Request<B>) -> Response<Full<Bytes>> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let query = req.uri().query().map(str::to_string);
    drop(req);
    respond(collector, &method, &path, query.as_deref()).await
}

/// Route one request
pub async fn respond(
    collector: &Collector,
    method: &Method,
    path: &str,
    query: Option<&str>,
) -> Response<Full<Bytes>> {
    let params = parse_query(query.unwrap_or_default());

    match (method, path) {
        (&Method::GET, "/-/healthy") => text(StatusCode::OK, "ok"),
        (&Method::GET, "/-/ready") => {
            if collector.is_ready() {
                text(StatusCode::OK, "ready")
            } else {
                text(StatusCode::SERVICE_UNAVAILABLE, "collection has not started")
            }
        }
        (&Method::POST, "/-/reload") => match collector.reload().await {
            Ok(()) => success(json!("reloaded")),
            Err(e) => {
                warn!("Reload rejected: {}", e);
                failure(StatusCode::BAD_REQUEST, &e.to_string())
            }
        },
        (&Method::GET, "/api/v1/query") => instant_query(collector, &params),
        (&Method::GET, "/api/v1/query_range") => range_query(collector, &params),
        (&Method::GET, "/api/v1/targets") => success(collector.scheduler().targets()),
        (&Method::GET, "/api/v1/status") => success(json!({
            "ready": collector.is_ready(),
            "startup_error": collector.startup_error(),
            "targets": collector.config().scrape_targets.len(),
            "store": collector.store().stats(),
        })),
        (&Method::GET, "/metrics") => {
            let (content_type, body) = telemetry::render();
            reply(StatusCode::OK, &content_type, Bytes::from(body))
        }
        (_, "/-/healthy" | "/-/ready" | "/-/reload" | "/metrics")
        | (_, "/api/v1/query" | "/api/v1/query_range" | "/api/v1/targets" | "/api/v1/status") => {
            failure(StatusCode::METHOD_NOT_ALLOWED, "method not allowed")
        }
        _ => failure(StatusCode::NOT_FOUND, "not found"),
    }
}

// =============================================================================
// Queries
// =============================================================================

fn instant_query(collector: &Collector, params: &HashMap<String, String>) -> Response<Full<Bytes>> {
    let parsed = selector_param(params).and_then(|selector| {
        let at = match params.get("time") {
            Some(t) => parse_time(t)?,
            None => Utc::now(),
        };
        Ok((selector, at))
    });
    let (selector, at) = match parsed {
        Ok(v) => v,
        Err(e) => return failure(StatusCode::BAD_REQUEST, &e.to_string()),
    };

    let result: Vec<Value> = collector
        .store()
        .query_instant(&selector, at, LOOKBACK)
        .into_iter()
        .map(|s| {
            json!({
                "metric": metric_object(&s.metric, &s.labels),
                "value": point_pair(&s.point),
            })
        })
        .collect();
    success(json!({ "resultType": "vector", "result": result }))
}

fn range_query(collector: &Collector, params: &HashMap<String, String>) -> Response<Full<Bytes>> {
    let parsed = selector_param(params).and_then(|selector| {
        let start = parse_time(required(params, "start")?)?;
        let end = parse_time(required(params, "end")?)?;
        if end < start {
            return Err(Error::InvalidSelector(
                "end timestamp must not be before start".to_string(),
            ));
        }
        Ok((selector, start, end))
    });
    let (selector, start, end) = match parsed {
        Ok(v) => v,
        Err(e) => return failure(StatusCode::BAD_REQUEST, &e.to_string()),
    };

    let result: Vec<Value> = collector
        .store()
        .query_range(&selector, start, end)
        .into_iter()
        .map(|s| {
            json!({
                "metric": metric_object(&s.metric, &s.labels),
                "values": s.points.iter().map(point_pair).collect::<Vec<_>>(),
            })
        })
        .collect();
    success(json!({ "resultType": "matrix", "result": result }))
}

fn selector_param(params: &HashMap<String, String>) -> Result<Selector> {
    Selector::parse(required(params, "query")?)
}

fn required<'a>(params: &'a HashMap<String, String>, name: &str) -> Result<&'a str> {
    params
        .get(name)
        .map(String::as_str)
        .ok_or_else(|| Error::InvalidSelector(format!("missing parameter {}", name)))
}

/// Unix seconds (fractional allowed) or RFC 3339
fn parse_time(value: &str) -> Result<DateTime<Utc>> {
    let invalid = || Error::InvalidSelector(format!("invalid timestamp {:?}", value));
    if let Ok(secs) = value.parse::<f64>() {
        if !secs.is_finite() {
            return Err(invalid());
        }
        return Utc
            .timestamp_millis_opt((secs * 1000.0).round() as i64)
            .single()
            .ok_or_else(invalid);
    }
    DateTime::parse_from_rfc3339(value)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|_| invalid())
}

fn metric_object(name: &str, labels: &Labels) -> Value {
    let mut object = Map::new();
    object.insert("__name__".to_string(), Value::String(name.to_string()));
    for (key, value) in labels {
        object.insert(key.clone(), Value::String(value.clone()));
    }
    Value::Object(object)
}

fn point_pair(point: &Point) -> Value {
    let seconds = point.timestamp.timestamp_millis() as f64 / 1000.0;
    json!([seconds, format_value(point.value)])
}

fn format_value(value: f64) -> String {
    if value.is_nan() {
        "NaN".to_string()
    } else if value == f64::INFINITY {
        "+Inf".to_string()
    } else if value == f64::NEG_INFINITY {
        "-Inf".to_string()
    } else {
        value.to_string()
    }
}

fn parse_query(query: &str) -> HashMap<String, String> {
    query
        .split('&')
        .filter(|pair| !pair.is_empty())
        .filter_map(|pair| {
            let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
            let key = urlencoding::decode(&key.replace('+', " ")).ok()?.into_owned();
            let value = urlencoding::decode(&value.replace('+', " ")).ok()?.into_owned();
            Some((key, value))
        })
        .collect()
}

// =============================================================================
// Responses
// =============================================================================

fn reply(status: StatusCode, content_type: &str, body: Bytes) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(body));
    *response.status_mut() = status;
    if let Ok(value) = HeaderValue::from_str(content_type) {
        response.headers_mut().insert(CONTENT_TYPE, value);
    }
    response
}

fn text(status: StatusCode, body: &'static str) -> Response<Full<Bytes>> {
    reply(status, "text/plain; charset=utf-8", Bytes::from_static(body.as_bytes()))
}

fn success<T: Serialize>(data: T) -> Response<Full<Bytes>> {
    json_response(StatusCode::OK, &json!({ "status": "success", "data": data }))
}

fn failure(status: StatusCode, message: &str) -> Response<Full<Bytes>> {
    json_response(status, &json!({ "status": "error", "error": message }))
}

fn json_response(status: StatusCode, body: &Value) -> Response<Full<Bytes>> {
    match serde_json::to_vec(body) {
        Ok(bytes) => reply(status, "application/json", Bytes::from(bytes)),
        Err(e) => {
            error!("Failed to encode response: {}", e);
            text(StatusCode::INTERNAL_SERVER_ERROR, "encoding error")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FleetConfig;
    use crate::scrape::{ScrapeScheduler, Scraper};
    use crate::store::{Sample, ScrapeBatch, TimeSeriesStore};
    use async_trait::async_trait;
    use http_body_util::BodyExt;
    use std::io::Write;
    use tokio::sync::mpsc;

    struct Unused;

    #[async_trait]
    impl Scraper for Unused {
        async fn fetch(
            &self,
            _target: &crate::config::ScrapeTarget,
            _timeout: Duration,
        ) -> Result<String> {
            Ok(String::new())
        }
    }

    fn collector(path: Option<std::path::PathBuf>) -> Arc<Collector> {
        let store = Arc::new(TimeSeriesStore::new(Duration::from_secs(3600)).unwrap());
        let (tx, _rx) = mpsc::channel(8);
        let scheduler = ScrapeScheduler::new(Arc::new(Unused), tx, CancellationToken::new());
        Collector::new(store, scheduler, FleetConfig::default(), path)
    }

    fn seed(collector: &Collector) {
        let mut labels = Labels::new();
        labels.insert("job".to_string(), "node".to_string());
        let samples = (0..3)
            .map(|i| Sample {
                job: "node".to_string(),
                name: "cpu".to_string(),
                labels: labels.clone(),
                value: i as f64,
                timestamp: Utc.timestamp_opt(1_700_000_000 + i * 10, 0).unwrap(),
            })
            .collect();
        collector.store().ingest(ScrapeBatch {
            job: "node".to_string(),
            collected_at: Utc::now(),
            samples,
        });
    }

    async fn body_json(response: Response<Full<Bytes>>) -> Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    // =========================================================================
    // Health Routes
    // =========================================================================

    #[tokio::test]
    async fn test_healthy_and_ready() {
        let collector = collector(None);
        let healthy = respond(&collector, &Method::GET, "/-/healthy", None).await;
        assert_eq!(healthy.status(), StatusCode::OK);

        let ready = respond(&collector, &Method::GET, "/-/ready", None).await;
        assert_eq!(ready.status(), StatusCode::SERVICE_UNAVAILABLE);

        collector.start_scraping().await;
        let ready = respond(&collector, &Method::GET, "/-/ready", None).await;
        assert_eq!(ready.status(), StatusCode::OK);
        collector.scheduler().stop().await;
    }

    #[tokio::test]
    async fn test_unknown_route_and_method() {
        let collector = collector(None);
        let missing = respond(&collector, &Method::GET, "/nope", None).await;
        assert_eq!(missing.status(), StatusCode::NOT_FOUND);

        let wrong = respond(&collector, &Method::GET, "/-/reload", None).await;
        assert_eq!(wrong.status(), StatusCode::METHOD_NOT_ALLOWED);
    }

    #[tokio::test]
    async fn test_metrics_route() {
        let collector = collector(None);
        let response = respond(&collector, &Method::GET, "/metrics", None).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers()[CONTENT_TYPE]
            .to_str()
            .unwrap()
            .starts_with("text/plain"));
    }

    // =========================================================================
    // Queries
    // =========================================================================

    #[tokio::test]
    async fn test_instant_query() {
        let collector = collector(None);
        seed(&collector);

        let response = respond(
            &collector,
            &Method::GET,
            "/api/v1/query",
            Some("query=cpu%7Bjob%3D%22node%22%7D&time=1700000015"),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);

        let body = body_json(response).await;
        assert_eq!(body["status"], "success");
        let result = &body["data"]["result"][0];
        assert_eq!(result["metric"]["__name__"], "cpu");
        assert_eq!(result["metric"]["job"], "node");
        assert_eq!(result["value"][0], 1_700_000_010.0);
        assert_eq!(result["value"][1], "1");
    }

    #[tokio::test]
    async fn test_range_query() {
        let collector = collector(None);
        seed(&collector);

        let response = respond(
            &collector,
            &Method::GET,
            "/api/v1/query_range",
            Some("query=cpu&start=1700000000&end=1700000010"),
        )
        .await;
        let body = body_json(response).await;
        let values = body["data"]["result"][0]["values"].as_array().unwrap();
        assert_eq!(values.len(), 2);
    }

    #[tokio::test]
    async fn test_bad_queries_are_400() {
        let collector = collector(None);
        for query in [
            "",
            "query=cpu%7B",
            "query=cpu&time=yesterday",
        ] {
            let response = respond(&collector, &Method::GET, "/api/v1/query", Some(query)).await;
            assert_eq!(response.status(), StatusCode::BAD_REQUEST, "{}", query);
            assert_eq!(body_json(response).await["status"], "error");
        }

        let response = respond(
            &collector,
            &Method::GET,
            "/api/v1/query_range",
            Some("query=cpu&start=20&end=10"),
        )
        .await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_status_reports_store() {
        let collector = collector(None);
        seed(&collector);
        let body = body_json(respond(&collector, &Method::GET, "/api/v1/status", None).await).await;
        assert_eq!(body["data"]["store"]["series"], 1);
        assert_eq!(body["data"]["store"]["samples"], 3);
        assert_eq!(body["data"]["ready"], false);
        assert_eq!(body["data"]["startup_error"], Value::Null);
    }

    #[tokio::test]
    async fn test_status_reports_startup_failure() {
        let collector = collector(None);
        collector.record_startup_failure(&Error::UnhealthyTimeout {
            service: "grafana".into(),
            deadline: Duration::from_millis(300),
        });

        let body = body_json(respond(&collector, &Method::GET, "/api/v1/status", None).await).await;
        let reason = body["data"]["startup_error"].as_str().unwrap();
        assert!(reason.contains("grafana"), "{}", reason);
    }

    // =========================================================================
    // Reload
    // =========================================================================

    #[tokio::test]
    async fn test_reload_applies_and_rejects() {
        let path = std::env::temp_dir().join(format!("fleetwatch-reload-{}.yaml", std::process::id()));
        let collector = collector(Some(path.clone()));

        std::fs::File::create(&path)
            .unwrap()
            .write_all(b"global:\n  retention: 2h\n")
            .unwrap();
        let ok = respond(&collector, &Method::POST, "/-/reload", None).await;
        assert_eq!(ok.status(), StatusCode::OK);
        assert_eq!(collector.store().retention(), Duration::from_secs(7200));

        std::fs::write(&path, "global:\n  retention: [not, a, duration]\n").unwrap();
        let bad = respond(&collector, &Method::POST, "/-/reload", None).await;
        assert_eq!(bad.status(), StatusCode::BAD_REQUEST);
        assert_eq!(collector.store().retention(), Duration::from_secs(7200));

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_parse_query_decodes() {
        let params = parse_query("query=up%7Bjob%3D%22a+b%22%7D&time=5&flag");
        assert_eq!(params["query"], "up{job=\"a b\"}");
        assert_eq!(params["time"], "5");
        assert_eq!(params["flag"], "");
    }

    #[test]
    fn test_parse_time_forms() {
        assert_eq!(
            parse_time("1700000000.5").unwrap(),
            Utc.timestamp_millis_opt(1_700_000_000_500).unwrap()
        );
        assert_eq!(
            parse_time("2023-11-14T22:13:20Z").unwrap(),
            Utc.timestamp_opt(1_700_000_000, 0).unwrap()
        );
        assert!(parse_time("NaN").is_err());
    }

    #[test]
    fn test_format_value() {
        assert_eq!(format_value(f64::NAN), "NaN");
        assert_eq!(format_value(f64::INFINITY), "+Inf");
        assert_eq!(format_value(2.5), "2.5");
    }
}
