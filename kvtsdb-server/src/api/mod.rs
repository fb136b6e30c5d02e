//! HTTP API endpoints (OpenTSDB-style JSON)

mod params;

use axum::{
    body::Bytes,
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use chrono::Utc;
use kvtsdb_core::writer::WriteResult;
use kvtsdb_core::{Annotation, Point, SeriesDescriptor, Tsdb, TsdbError, UidKind};
use params::{flag, parse_metric_query, parse_time};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::error;

/// Application state
pub type AppState = Arc<Tsdb>;

/// Default number of names returned by `/api/suggest`
const DEFAULT_SUGGEST_MAX: usize = 25;

/// Create the API router
pub fn create_router(db: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health))
        .route("/api/version", get(version))
        .route("/api/put", post(put))
        .route("/api/query", get(query))
        .route("/api/suggest", get(suggest))
        .route("/api/uid/assign", get(uid_assign))
        .route("/api/annotation", post(store_annotation).delete(delete_annotation))
        .route("/api/search/lookup", get(lookup))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(db)
}

// ============================================================================
// Errors
// ============================================================================

/// Handler error, rendered as `{"error": {"code", "message"}}`
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),
    #[error(transparent)]
    Core(#[from] TsdbError),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Core(
                TsdbError::NotFound { .. }
                | TsdbError::InvalidInput(_)
                | TsdbError::UnsupportedKind(_),
            ) => StatusCode::BAD_REQUEST,
            ApiError::Core(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!("Request failed: {}", self);
        }
        let body = json!({
            "error": {
                "code": status.as_u16(),
                "message": self.to_string(),
            }
        });
        (status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

// ============================================================================
// Request/Response types
// ============================================================================

/// A JSON body holding either one object or an array of them
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum OneOrMany<T> {
    Many(Vec<T>),
    One(T),
}

impl<T> OneOrMany<T> {
    fn into_vec(self) -> Vec<T> {
        match self {
            OneOrMany::Many(items) => items,
            OneOrMany::One(item) => vec![item],
        }
    }
}

fn parse_body<T: DeserializeOwned>(body: &[u8]) -> ApiResult<OneOrMany<T>> {
    serde_json::from_slice(body).map_err(|e| ApiError::BadRequest(format!("Invalid JSON body: {}", e)))
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

#[derive(Debug, Serialize)]
struct PutError<'a> {
    datapoint: &'a Value,
    error: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct QuerySeries {
    metric: String,
    tags: BTreeMap<String, String>,
    aggregate_tags: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tsuids: Option<Vec<String>>,
    dps: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    annotations: Option<Vec<Annotation>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    global_annotations: Option<Vec<Annotation>>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct LookupResponse {
    #[serde(rename = "type")]
    kind: &'static str,
    metric: String,
    limit: Option<usize>,
    time: f64,
    total_results: usize,
    results: Vec<SeriesDescriptor>,
}

// ============================================================================
// Handlers
// ============================================================================

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: kvtsdb_core::VERSION.to_string(),
    })
}

async fn version() -> Json<Value> {
    Json(json!({
        "version": kvtsdb_core::VERSION,
        "product": "kvtsdb",
    }))
}

fn param<'a>(params: &'a HashMap<String, String>, name: &str) -> Option<&'a str> {
    params.get(name).map(String::as_str)
}

fn usize_param(params: &HashMap<String, String>, name: &str) -> ApiResult<Option<usize>> {
    param(params, name)
        .map(|raw| {
            raw.parse()
                .map_err(|_| ApiError::BadRequest(format!("Invalid {}: {}", name, raw)))
        })
        .transpose()
}

async fn put(
    State(db): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
    body: Bytes,
) -> ApiResult<Response> {
    let raw = parse_body::<Value>(&body)?.into_vec();
    let results = store_raw_points(&db, &raw).await;

    let failed = results.iter().filter(|r| r.is_err()).count();
    let success = results.len() - failed;
    let status = if failed == 0 {
        StatusCode::OK
    } else {
        StatusCode::BAD_REQUEST
    };

    if flag(param(&params, "details")) {
        let errors: Vec<PutError> = raw
            .iter()
            .zip(&results)
            .filter_map(|(point, result)| {
                result.as_ref().err().map(|e| PutError {
                    datapoint: point,
                    error: e.clone(),
                })
            })
            .collect();
        let body = json!({ "success": success, "failed": failed, "errors": errors });
        return Ok((status, Json(body)).into_response());
    }
    if flag(param(&params, "summary")) {
        let body = json!({ "success": success, "failed": failed });
        return Ok((status, Json(body)).into_response());
    }
    match results.into_iter().find_map(Result::err) {
        None => Ok(StatusCode::NO_CONTENT.into_response()),
        Some(first) => Err(ApiError::BadRequest(format!(
            "{} of {} data points failed, first error: {}",
            failed,
            failed + success,
            first
        ))),
    }
}

/// Decode each point on its own so one malformed point only fails itself,
/// then store the rest. Results stay positional.
async fn store_raw_points(db: &Tsdb, raw: &[Value]) -> Vec<WriteResult> {
    let mut results: Vec<WriteResult> = Vec::with_capacity(raw.len());
    let mut decoded = Vec::new();
    let mut positions = Vec::new();
    for (i, value) in raw.iter().enumerate() {
        match Point::deserialize(value) {
            Ok(point) => {
                results.push(Ok(()));
                decoded.push(point);
                positions.push(i);
            }
            Err(e) => results.push(Err(format!("Invalid data point: {}", e))),
        }
    }

    let stored = db.store_points(&decoded).await;
    for (i, result) in positions.into_iter().zip(stored) {
        results[i] = result;
    }
    results
}

async fn query(
    State(db): State<AppState>,
    Query(params): Query<Vec<(String, String)>>,
) -> ApiResult<Json<Vec<QuerySeries>>> {
    let get = |name: &str| {
        params
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    };
    let now = Utc::now();
    let start = get("start")
        .ok_or_else(|| ApiError::BadRequest("Missing start parameter".into()))
        .and_then(|raw| parse_time(raw, now).map_err(ApiError::BadRequest))?;
    let end = match get("end") {
        Some(raw) => parse_time(raw, now).map_err(ApiError::BadRequest)?,
        None => now.timestamp_millis(),
    };
    let ms = flag(get("ms"));
    let arrays = flag(get("arrays"));
    let show_tsuids = flag(get("show_tsuids"));
    let annotations = !flag(get("no_annotations"));

    let global = if flag(get("global_annotations")) {
        Some(db.query_global_annotations(start, end).await?)
    } else {
        None
    };

    let sub_queries: Vec<&str> = params
        .iter()
        .filter(|(k, _)| k == "m")
        .map(|(_, v)| v.as_str())
        .collect();
    if sub_queries.is_empty() {
        return Err(ApiError::BadRequest("Missing m parameter".into()));
    }

    let mut output = Vec::new();
    for raw in sub_queries {
        let sub = parse_metric_query(raw).map_err(ApiError::BadRequest)?;
        if sub.metric.is_empty() {
            return Err(ApiError::BadRequest(format!("Missing metric in {}", raw)));
        }
        for series in db.query_range(&sub.metric, start, end).await? {
            if !sub.filters.iter().all(|f| f.matches(&series.tags)) {
                continue;
            }
            let series_annotations = if annotations {
                Some(
                    db.query_annotations(std::slice::from_ref(&series.tsuid), start, end)
                        .await?,
                )
            } else {
                None
            };
            output.push(QuerySeries {
                dps: render_dps(&series.dps, ms, arrays),
                metric: series.metric,
                tags: series.tags,
                aggregate_tags: Vec::new(),
                tsuids: show_tsuids.then(|| vec![series.tsuid]),
                annotations: series_annotations,
                global_annotations: global.clone(),
            });
        }
    }
    Ok(Json(output))
}

/// Render points as `[[ts, v], ...]` or `{"ts": v, ...}`, in seconds unless `ms`
fn render_dps(dps: &[(i64, f64)], ms: bool, arrays: bool) -> Value {
    let ts = |t: i64| if ms { t } else { t / 1000 };
    if arrays {
        Value::Array(dps.iter().map(|(t, v)| json!([ts(*t), v])).collect())
    } else {
        Value::Object(
            dps.iter()
                .map(|(t, v)| (ts(*t).to_string(), json!(v)))
                .collect(),
        )
    }
}

async fn suggest(
    State(db): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> ApiResult<Json<Vec<String>>> {
    let kind: UidKind = param(&params, "type")
        .ok_or_else(|| ApiError::BadRequest("Missing type parameter".into()))?
        .parse()?;
    let prefix = param(&params, "q").unwrap_or("");
    let max = usize_param(&params, "max")?.unwrap_or(DEFAULT_SUGGEST_MAX);
    Ok(Json(db.suggest(kind, prefix, Some(max)).await?))
}

async fn uid_assign(
    State(db): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> ApiResult<Response> {
    let mut body = serde_json::Map::new();
    let mut any_requested = false;
    let mut any_failed = false;

    for kind in UidKind::ALL {
        let Some(names) = param(&params, kind.as_str()) else {
            continue;
        };
        any_requested = true;
        let mut assigned = BTreeMap::new();
        let mut errors = BTreeMap::new();
        for name in names.split(',').map(str::trim).filter(|n| !n.is_empty()) {
            match db.assign_or_resolve(kind, name).await {
                Ok(uid) => {
                    assigned.insert(name.to_string(), uid);
                }
                Err(e) => {
                    any_failed = true;
                    errors.insert(name.to_string(), e.to_string());
                }
            }
        }
        body.insert(kind.as_str().to_string(), json!(assigned));
        if !errors.is_empty() {
            body.insert(format!("{}_errors", kind), json!(errors));
        }
    }

    if !any_requested {
        return Err(ApiError::BadRequest(
            "Expected at least one of metric, tagk or tagv".into(),
        ));
    }
    let status = if any_failed {
        StatusCode::BAD_REQUEST
    } else {
        StatusCode::OK
    };
    Ok((status, Json(Value::Object(body))).into_response())
}

async fn store_annotation(State(db): State<AppState>, body: Bytes) -> ApiResult<Response> {
    let parsed = parse_body::<Annotation>(&body)?;
    let single = matches!(parsed, OneOrMany::One(_));
    let annotations = parsed.into_vec();

    let results = db.store_annotations(&annotations).await;
    if let Some(e) = results.into_iter().find_map(Result::err) {
        return Err(ApiError::BadRequest(e));
    }
    if single {
        Ok(Json(&annotations[0]).into_response())
    } else {
        Ok(Json(&annotations).into_response())
    }
}

async fn delete_annotation(State(db): State<AppState>, body: Bytes) -> ApiResult<StatusCode> {
    for annotation in parse_body::<Annotation>(&body)?.into_vec() {
        db.delete_annotation(&annotation).await?;
    }
    Ok(StatusCode::NO_CONTENT)
}

async fn lookup(
    State(db): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> ApiResult<Json<LookupResponse>> {
    let timer = Instant::now();
    let raw = param(&params, "m")
        .ok_or_else(|| ApiError::BadRequest("Missing m parameter".into()))?;
    let limit = usize_param(&params, "limit")?;
    let sub = parse_metric_query(raw).map_err(ApiError::BadRequest)?;

    let metric = match sub.metric.as_str() {
        "" | "*" => None,
        name => Some(name),
    };
    let results = db.lookup(metric, &sub.filters, limit).await?;

    Ok(Json(LookupResponse {
        kind: "LOOKUP",
        metric: metric.unwrap_or("*").to_string(),
        limit,
        time: timer.elapsed().as_secs_f64() * 1000.0,
        total_results: results.len(),
        results,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Method, Request};
    use kvtsdb_core::config::TsdbConfig;
    use tower::ServiceExt;

    fn app() -> Router {
        let db = Tsdb::in_memory(TsdbConfig::default()).unwrap();
        create_router(Arc::new(db))
    }

    async fn send(app: &Router, method: Method, uri: &str, body: Value) -> (StatusCode, Value) {
        let body = if body.is_null() {
            Body::empty()
        } else {
            Body::from(body.to_string())
        };
        let request = Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(body)
            .unwrap();
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let json = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, json)
    }

    fn cpu_points() -> Value {
        json!([
            {"timestamp": 1524450000, "metric": "cpu.percent", "value": 23,
             "tags": {"host": "host001", "type": "user"}},
            {"timestamp": 1524450010, "metric": "cpu.percent", "value": 25,
             "tags": {"host": "host001", "type": "user"}},
            {"timestamp": 1524450020, "metric": "cpu.percent", "value": 27,
             "tags": {"host": "host001", "type": "user"}}
        ])
    }

    #[tokio::test]
    async fn test_health() {
        let app = app();
        let (status, body) = send(&app, Method::GET, "/health", Value::Null).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");

        let (status, body) = send(&app, Method::GET, "/api/version", Value::Null).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["version"], kvtsdb_core::VERSION);
    }

    #[tokio::test]
    async fn test_put_summary_then_query() {
        let app = app();
        let (status, body) = send(&app, Method::POST, "/api/put?summary", cpu_points()).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({"success": 3, "failed": 0}));

        let uri = "/api/query?start=1524450000&end=1524460000&m=sum:cpu.percent\
                   &arrays=true&show_tsuids=true";
        let (status, body) = send(&app, Method::GET, uri, Value::Null).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body.as_array().unwrap().len(), 1);
        let series = &body[0];
        assert_eq!(series["metric"], "cpu.percent");
        assert_eq!(series["tags"], json!({"host": "host001", "type": "user"}));
        assert_eq!(series["tsuids"], json!(["000001000001000001000002000002"]));
        assert_eq!(
            series["dps"],
            json!([[1524450000, 23.0], [1524450010, 25.0], [1524450020, 27.0]])
        );
        assert_eq!(series["annotations"], json!([]));
    }

    #[tokio::test]
    async fn test_query_tag_filter_and_map_dps() {
        let app = app();
        let points = json!([
            {"timestamp": 1524450000, "metric": "disk", "value": 1, "tags": {"volume": "/dev/sda"}},
            {"timestamp": 1524450000, "metric": "disk", "value": 2, "tags": {"volume": "/dev/sdb"}}
        ]);
        let (status, _) = send(&app, Method::POST, "/api/put", points).await;
        assert_eq!(status, StatusCode::NO_CONTENT);

        let uri = "/api/query?start=1524450000&m=disk%7Bvolume%3D/dev/sdb%7D&ms=true";
        let (status, body) = send(&app, Method::GET, uri, Value::Null).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body.as_array().unwrap().len(), 1);
        assert_eq!(body[0]["dps"], json!({"1524450000000": 2.0}));
        assert!(body[0].get("tsuids").is_none());
    }

    #[tokio::test]
    async fn test_put_failures() {
        let app = app();
        let points = json!([
            {"timestamp": 1524450000, "metric": "ok", "value": 1},
            {"timestamp": 1524450000, "metric": "", "value": 1}
        ]);
        let (status, body) = send(&app, Method::POST, "/api/put?details", points.clone()).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["success"], 1);
        assert_eq!(body["failed"], 1);
        assert_eq!(body["errors"].as_array().unwrap().len(), 1);

        let (status, body) = send(&app, Method::POST, "/api/put", points).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"]["code"], 400);

        let (status, _) = send(&app, Method::POST, "/api/put", json!("nonsense")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_put_string_values_and_malformed_points() {
        let app = app();
        let points = json!([
            {"timestamp": 1524450000, "metric": "cpu", "value": "23", "tags": {"host": "a"}},
            {"timestamp": 1524450010, "metric": "cpu", "value": "lots", "tags": {"host": "a"}},
            {"timestamp": 1524450020, "metric": "cpu", "value": 25, "tags": {"host": "a"}}
        ]);
        let (status, body) = send(&app, Method::POST, "/api/put?details", points).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["success"], 2);
        assert_eq!(body["failed"], 1);
        assert_eq!(body["errors"][0]["datapoint"]["value"], "lots");

        let uri = "/api/query?start=1524450000&end=1524460000&m=cpu&arrays=true";
        let (_, body) = send(&app, Method::GET, uri, Value::Null).await;
        assert_eq!(body[0]["dps"], json!([[1524450000, 23.0], [1524450020, 25.0]]));
    }

    #[tokio::test]
    async fn test_query_errors() {
        let app = app();
        let (status, body) = send(
            &app,
            Method::GET,
            "/api/query?start=1h-ago&m=sum:missing",
            Value::Null,
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"]["message"].as_str().unwrap().contains("missing"));

        let (status, _) = send(&app, Method::GET, "/api/query?m=sum:x", Value::Null).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_suggest() {
        let app = app();
        send(&app, Method::POST, "/api/put", cpu_points()).await;
        let points = json!({"timestamp": 1524450000, "metric": "disk.used.bytes", "value": 1});
        send(&app, Method::POST, "/api/put", points).await;

        let (status, body) =
            send(&app, Method::GET, "/api/suggest?type=metrics&q=disk", Value::Null).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!(["disk.used.bytes"]));

        let (_, body) = send(&app, Method::GET, "/api/suggest?type=metrics&q=", Value::Null).await;
        assert_eq!(body, json!(["cpu.percent", "disk.used.bytes"]));

        let (status, _) = send(&app, Method::GET, "/api/suggest?type=bogus", Value::Null).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_uid_assign() {
        let app = app();
        let (status, body) = send(
            &app,
            Method::GET,
            "/api/uid/assign?metric=sys.cpu,sys.mem&tagv=web01",
            Value::Null,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["metric"], json!({"sys.cpu": "000001", "sys.mem": "000002"}));
        assert_eq!(body["tagv"], json!({"web01": "000001"}));
        assert!(body.get("tagk").is_none());

        let (status, _) = send(&app, Method::GET, "/api/uid/assign", Value::Null).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_annotations_round_trip() {
        let app = app();
        send(&app, Method::POST, "/api/put", cpu_points()).await;

        let note = json!({"tsuid": "000001000001000001000002000002",
                          "description": "deploy", "startTime": 1524450005});
        let (status, body) = send(&app, Method::POST, "/api/annotation", note.clone()).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["description"], "deploy");

        let global = json!([{"description": "outage", "startTime": 1524450010}]);
        let (status, body) = send(&app, Method::POST, "/api/annotation", global).await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.is_array());

        let uri = "/api/query?start=1524450000&end=1524460000&m=sum:cpu.percent\
                   &global_annotations=true";
        let (_, body) = send(&app, Method::GET, uri, Value::Null).await;
        assert_eq!(body[0]["annotations"][0]["description"], "deploy");
        assert_eq!(body[0]["globalAnnotations"][0]["description"], "outage");

        let (status, _) = send(&app, Method::DELETE, "/api/annotation", note).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
    }

    #[tokio::test]
    async fn test_lookup() {
        let app = app();
        send(&app, Method::POST, "/api/put", cpu_points()).await;

        let (status, body) = send(
            &app,
            Method::GET,
            "/api/search/lookup?m=cpu.percent%7Bhost%3Dhost001%7D",
            Value::Null,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["type"], "LOOKUP");
        assert_eq!(body["totalResults"], 1);
        assert_eq!(body["results"][0]["tsuid"], "000001000001000001000002000002");

        let (_, body) = send(
            &app,
            Method::GET,
            "/api/search/lookup?m=%7B*%3Dnobody%7D",
            Value::Null,
        )
        .await;
        assert_eq!(body["metric"], "*");
        assert_eq!(body["totalResults"], 0);
    }
}
