//! Axum + Askama dashboard over the price store.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use askama::Template;
use axum::{
    extract::{Path as AxumPath, Query, State},
    http::StatusCode,
    response::{Html, IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use mpt_analytics::{
    compute_metrics, get_price_history, get_recent_changes, get_top_movers, list_products,
    summarize, MoverMode, ProductFilter, ProductView, DEFAULT_LISTING_LIMIT,
    DEFAULT_MOVING_AVERAGE_WINDOW,
};
use mpt_core::normalize_product_id;
use mpt_storage::DocumentStore;
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::{info, warn};

pub const CRATE_NAME: &str = "mpt-web";

/// Program + arguments run by `POST /api/scrape`.
#[derive(Debug, Clone)]
pub struct ScrapeCommand {
    pub program: PathBuf,
    pub args: Vec<String>,
}

impl ScrapeCommand {
    /// Re-invokes the running binary as `scrape --json`.
    pub fn current_exe() -> anyhow::Result<Self> {
        Ok(Self {
            program: std::env::current_exe()?,
            args: vec!["scrape".into(), "--json".into()],
        })
    }
}

#[derive(Debug, Clone)]
pub struct WebConfig {
    pub port: u16,
    pub scrape_timeout: Duration,
}

impl WebConfig {
    pub fn from_env() -> Self {
        Self {
            port: std::env::var("MPT_WEB_PORT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(8000),
            scrape_timeout: Duration::from_secs(
                std::env::var("MPT_SCRAPE_TIMEOUT_SECS")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(300),
            ),
        }
    }
}

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn DocumentStore>,
    pub scrape_command: ScrapeCommand,
    pub scrape_timeout: Duration,
    /// Held while a scrape runs; shared with the scheduler when both are active.
    pub run_lock: Arc<Mutex<()>>,
}

impl AppState {
    pub fn new(store: Arc<dyn DocumentStore>, scrape_command: ScrapeCommand) -> Self {
        Self {
            store,
            scrape_command,
            scrape_timeout: Duration::from_secs(300),
            run_lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn with_scrape_timeout(mut self, timeout: Duration) -> Self {
        self.scrape_timeout = timeout;
        self
    }

    pub fn with_run_lock(mut self, run_lock: Arc<Mutex<()>>) -> Self {
        self.run_lock = run_lock;
        self
    }
}

#[derive(Debug, Deserialize, Default)]
struct ListingQuery {
    hours: Option<i64>,
    search: Option<String>,
    only_changed: Option<bool>,
    limit: Option<usize>,
}

impl ListingQuery {
    fn filter(&self) -> ProductFilter {
        ProductFilter {
            last_seen_hours: self.hours,
            search: self.search.clone(),
            only_changed: self.only_changed.unwrap_or(false),
            limit: self.limit.unwrap_or(DEFAULT_LISTING_LIMIT),
        }
    }
}

#[derive(Debug, Deserialize, Default)]
struct HistoryQuery {
    hours: Option<i64>,
}

#[derive(Debug, Deserialize, Default)]
struct RecentQuery {
    hours: Option<i64>,
    limit: Option<usize>,
}

#[derive(Debug, Deserialize, Default)]
struct MoversQuery {
    hours: Option<i64>,
    top: Option<usize>,
    mode: Option<String>,
}

#[derive(Debug, Clone)]
struct RowView {
    id: String,
    name: String,
    current_price: String,
    last_price: String,
    delta: String,
    delta_pct: String,
    trend: &'static str,
    last_seen_at: String,
    price_changed_at: String,
}

#[derive(Debug, Clone)]
struct HourOption {
    value: i64,
    label: &'static str,
    selected: bool,
}

#[derive(Template)]
#[template(path = "dashboard.html")]
struct DashboardTemplate {
    total: usize,
    changed: usize,
    rise_value: String,
    rise_name: String,
    drop_value: String,
    drop_name: String,
    hour_options: Vec<HourOption>,
    search: String,
    only_changed: bool,
    rows: Vec<RowView>,
}

fn format_time(at: Option<DateTime<Utc>>) -> String {
    at.map(|t| t.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| "—".to_string())
}

impl From<&ProductView> for RowView {
    fn from(v: &ProductView) -> Self {
        let (arrow, trend) = if v.delta > 0.0 {
            ("▲", "up")
        } else if v.delta < 0.0 {
            ("▼", "down")
        } else {
            ("•", "flat")
        };
        Self {
            id: v.id.clone(),
            name: v.name.clone(),
            current_price: format!("{:.2}", v.current_price),
            last_price: format!("{:.2}", v.last_price),
            delta: format!("{arrow} {:.2}", v.delta),
            delta_pct: v
                .delta_pct
                .map(|p| format!("{p:+.2}%"))
                .unwrap_or_else(|| "—".to_string()),
            trend,
            last_seen_at: format_time(Some(v.last_seen_at)),
            price_changed_at: format_time(v.price_changed_at),
        }
    }
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/", get(index_handler))
        .route("/api/products", get(products_handler))
        .route("/api/products/{id}/history", get(history_handler))
        .route("/api/recent", get(recent_handler))
        .route("/api/movers", get(movers_handler))
        .route("/api/scrape", post(scrape_handler))
        .with_state(Arc::new(state))
}

pub async fn serve(state: AppState, port: u16) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "dashboard listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn index_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListingQuery>,
) -> Response {
    let filter = query.filter();
    let rows = match list_products(state.store.as_ref(), &filter, Utc::now()).await {
        Ok(rows) => rows,
        Err(err) => return server_error(err.into()),
    };
    let summary = summarize(&rows);
    let (rise_value, rise_name) = summary
        .biggest_rise
        .map(|k| (format!("{:.2}", k.delta), k.name))
        .unwrap_or_else(|| ("—".to_string(), String::new()));
    let (drop_value, drop_name) = summary
        .biggest_drop
        .map(|k| (format!("{:.2}", k.delta), k.name))
        .unwrap_or_else(|| ("—".to_string(), String::new()));
    let selected_hours = filter.last_seen_hours.unwrap_or(0);

    render_html(DashboardTemplate {
        total: summary.total,
        changed: summary.changed,
        rise_value,
        rise_name,
        drop_value,
        drop_name,
        hour_options: [(0, "all time"), (24, "24 hours"), (168, "7 days"), (720, "30 days")]
            .into_iter()
            .map(|(value, label)| HourOption {
                value,
                label,
                selected: value == selected_hours,
            })
            .collect(),
        search: filter.search.unwrap_or_default(),
        only_changed: filter.only_changed,
        rows: rows.iter().map(RowView::from).collect(),
    })
}

async fn products_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListingQuery>,
) -> Response {
    match list_products(state.store.as_ref(), &query.filter(), Utc::now()).await {
        Ok(products) => Json(serde_json::json!({
            "summary": summarize(&products),
            "products": products,
        }))
        .into_response(),
        Err(err) => api_error(StatusCode::INTERNAL_SERVER_ERROR, err.to_string()),
    }
}

async fn history_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<String>,
    Query(query): Query<HistoryQuery>,
) -> Response {
    let id = normalize_product_id(&id);
    match state.store.get_product(&id).await {
        Ok(Some(_)) => {}
        Ok(None) => return api_error(StatusCode::NOT_FOUND, format!("product {id} not found")),
        Err(err) => return api_error(StatusCode::INTERNAL_SERVER_ERROR, err.to_string()),
    }
    match get_price_history(state.store.as_ref(), &id, query.hours, Utc::now()).await {
        Ok(points) => {
            let metrics = compute_metrics(&points, DEFAULT_MOVING_AVERAGE_WINDOW);
            Json(serde_json::json!({
                "product_id": id,
                "points": points,
                "metrics": metrics,
            }))
            .into_response()
        }
        Err(err) => api_error(StatusCode::INTERNAL_SERVER_ERROR, err.to_string()),
    }
}

async fn recent_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<RecentQuery>,
) -> Response {
    let hours = query.hours.unwrap_or(24);
    let limit = query.limit.unwrap_or(100);
    match get_recent_changes(state.store.as_ref(), hours, limit, Utc::now()).await {
        Ok(products) => Json(products).into_response(),
        Err(err) => api_error(StatusCode::INTERNAL_SERVER_ERROR, err.to_string()),
    }
}

async fn movers_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<MoversQuery>,
) -> Response {
    let mode = match query.mode.as_deref().map(str::parse::<MoverMode>).transpose() {
        Ok(mode) => mode.unwrap_or_default(),
        Err(err) => return api_error(StatusCode::BAD_REQUEST, err.to_string()),
    };
    let hours = query.hours.unwrap_or(24);
    let top = query.top.unwrap_or(5);
    match get_top_movers(state.store.as_ref(), hours, top, mode, Utc::now()).await {
        Ok(movers) => Json(serde_json::json!({ "mode": mode, "movers": movers })).into_response(),
        Err(err) => api_error(StatusCode::INTERNAL_SERVER_ERROR, err.to_string()),
    }
}

#[derive(Debug, Clone, Serialize)]
struct ScrapeRunResponse {
    status: &'static str,
    exit_code: Option<i32>,
    stdout: String,
    stderr: String,
}

async fn scrape_handler(State(state): State<Arc<AppState>>) -> Response {
    let Ok(_guard) = state.run_lock.try_lock() else {
        warn!("scrape requested while another run is active");
        return api_error(StatusCode::CONFLICT, "a scrape run is already in progress".into());
    };

    let command = &state.scrape_command;
    let child = Command::new(&command.program)
        .args(&command.args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn();
    let child = match child {
        Ok(child) => child,
        Err(err) => {
            return api_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("starting {}: {err}", command.program.display()),
            )
        }
    };

    match tokio::time::timeout(state.scrape_timeout, child.wait_with_output()).await {
        Ok(Ok(output)) => {
            let success = output.status.success();
            info!(success, code = ?output.status.code(), "scrape subprocess finished");
            let body = ScrapeRunResponse {
                status: if success { "ok" } else { "failed" },
                exit_code: output.status.code(),
                stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            };
            let code = if success {
                StatusCode::OK
            } else {
                StatusCode::BAD_GATEWAY
            };
            (code, Json(body)).into_response()
        }
        Ok(Err(err)) => api_error(StatusCode::INTERNAL_SERVER_ERROR, err.to_string()),
        Err(_) => {
            warn!(timeout = ?state.scrape_timeout, "scrape subprocess timed out and was killed");
            (
                StatusCode::GATEWAY_TIMEOUT,
                Json(ScrapeRunResponse {
                    status: "timeout",
                    exit_code: None,
                    stdout: String::new(),
                    stderr: format!("killed after {:?}", state.scrape_timeout),
                }),
            )
                .into_response()
        }
    }
}

fn render_html<T: Template>(tpl: T) -> Response {
    match tpl.render() {
        Ok(html) => Html(html).into_response(),
        Err(err) => server_error(anyhow::anyhow!(err.to_string())),
    }
}

fn server_error(err: anyhow::Error) -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Html(format!("Server error: {}", err)),
    )
        .into_response()
}

fn api_error(status: StatusCode, message: String) -> Response {
    (status, Json(serde_json::json!({ "error": message }))).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{header, Request};
    use chrono::Duration as ChronoDuration;
    use http_body_util::BodyExt;
    use mpt_core::{DisplayedPrices, PriceHistoryEntry, Product};
    use mpt_storage::MemoryStore;
    use tower::ServiceExt;

    fn product(name: &str, last: f64, current: f64) -> Product {
        let now = Utc::now();
        Product {
            id: normalize_product_id(name),
            name: name.to_string(),
            description: String::new(),
            current_price: current,
            last_price: last,
            created_at: now - ChronoDuration::hours(3),
            last_seen_at: now,
            price_changed_at: (last != current).then_some(now - ChronoDuration::hours(1)),
            change_count: i64::from(last != current),
            snapshot: DisplayedPrices::default(),
        }
    }

    async fn seeded_store() -> Arc<MemoryStore> {
        let store = Arc::new(MemoryStore::new());
        let now = Utc::now();
        store
            .seed(
                product("Açaí 300ml", 10.0, 12.0),
                vec![
                    PriceHistoryEntry { price: 10.0, at: now - ChronoDuration::hours(3) },
                    PriceHistoryEntry { price: 12.0, at: now - ChronoDuration::hours(1) },
                ],
            )
            .await;
        store.seed(product("Açaí 500ml", 20.0, 15.0), vec![]).await;
        store.seed(product("Suco <Laranja>", 8.0, 8.0), vec![]).await;
        store
    }

    fn shell(script: &str) -> ScrapeCommand {
        ScrapeCommand {
            program: PathBuf::from("/bin/sh"),
            args: vec!["-c".into(), script.into()],
        }
    }

    async fn test_app(command: ScrapeCommand) -> Router {
        app(AppState::new(seeded_store().await, command))
    }

    async fn body_text(resp: Response) -> String {
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(body.to_vec()).unwrap()
    }

    async fn get_json(app: Router, uri: &str) -> (StatusCode, serde_json::Value) {
        let resp = app
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = resp.status();
        (status, serde_json::from_str(&body_text(resp).await).unwrap())
    }

    #[tokio::test]
    async fn dashboard_renders_kpis_and_escapes_names() {
        let app = test_app(shell("true")).await;
        let resp = app
            .oneshot(Request::builder().uri("/").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let text = body_text(resp).await;
        assert!(text.contains("Menu Prices"));
        assert!(text.contains("Açaí 300ml"));
        assert!(text.contains("-5.00"));
        assert!(text.contains("Suco &lt;Laranja&gt;"));
    }

    #[tokio::test]
    async fn products_api_applies_filters() {
        let app = test_app(shell("true")).await;
        let (status, json) = get_json(app.clone(), "/api/products?search=acai").await;
        assert_eq!(status, StatusCode::OK);
        // Plain-ASCII search does not fold accents.
        assert_eq!(json["products"].as_array().unwrap().len(), 0);

        let (_, json) = get_json(app.clone(), "/api/products?search=a%C3%A7a%C3%AD").await;
        assert_eq!(json["products"].as_array().unwrap().len(), 2);

        let (_, json) = get_json(app, "/api/products?only_changed=true").await;
        assert_eq!(json["summary"]["total"], 2);
        assert_eq!(json["summary"]["biggest_drop"]["delta"], -5.0);
    }

    #[tokio::test]
    async fn history_api_returns_points_and_metrics() {
        let app = test_app(shell("true")).await;
        let (status, json) = get_json(app.clone(), "/api/products/acai-300-ml/history").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["points"].as_array().unwrap().len(), 2);
        assert_eq!(json["metrics"]["delta_abs"], 2.0);
        assert_eq!(json["metrics"]["delta_pct"], 20.0);

        let (status, _) = get_json(app, "/api/products/missing/history").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn movers_and_recent_apis() {
        let app = test_app(shell("true")).await;
        let (status, json) = get_json(app.clone(), "/api/movers?mode=down").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["mode"], "down");
        assert_eq!(json["movers"][0]["delta"], -5.0);

        let (status, _) = get_json(app.clone(), "/api/movers?mode=sideways").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, json) = get_json(app, "/api/recent?hours=2").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json.as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn maximal_hour_windows_are_served() {
        let app = test_app(shell("true")).await;
        let max = i64::MAX;
        for uri in [
            format!("/api/recent?hours={max}"),
            format!("/api/movers?hours={max}"),
            format!("/api/products?hours={max}"),
            format!("/api/products/acai-300-ml/history?hours={max}"),
            format!("/?hours={max}"),
        ] {
            let resp = app
                .clone()
                .oneshot(Request::builder().uri(uri.as_str()).body(Body::empty()).unwrap())
                .await
                .unwrap();
            assert_eq!(resp.status(), StatusCode::OK, "{uri}");
        }
        let (_, json) = get_json(app, &format!("/api/recent?hours={max}")).await;
        assert_eq!(json.as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn scrape_trigger_reports_subprocess_output() {
        let app = test_app(shell(r#"echo '{"new":1,"changed":0,"unchanged":2}'"#)).await;
        let resp = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/scrape")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(
            resp.headers()[header::CONTENT_TYPE].to_str().unwrap(),
            "application/json"
        );
        let json: serde_json::Value = serde_json::from_str(&body_text(resp).await).unwrap();
        assert_eq!(json["status"], "ok");
        assert!(json["stdout"].as_str().unwrap().contains("\"new\":1"));
    }

    #[tokio::test]
    async fn scrape_trigger_kills_slow_runs() {
        let state = AppState::new(seeded_store().await, shell("sleep 5"))
            .with_scrape_timeout(Duration::from_millis(100));
        let resp = app(state)
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/scrape")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::GATEWAY_TIMEOUT);
    }

    #[tokio::test]
    async fn scrape_trigger_refuses_overlapping_runs() {
        let lock = Arc::new(Mutex::new(()));
        let state = AppState::new(seeded_store().await, shell("true")).with_run_lock(lock.clone());
        let _held = lock.lock().await;
        let resp = app(state)
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/scrape")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::CONFLICT);
    }
}
