//! Read-only HTTP surface: current advice and stored drift reports.

use std::path::PathBuf;
use std::sync::{Arc, RwLock};

use axum::{
    extract::State,
    http::StatusCode,
    response::{Html, IntoResponse, Response},
    routing::get,
    Json, Router,
};
use chrono::Utc;
use serde::Serialize;
use tracing::{info, warn};

use crate::advice::{read_advice, AdviceDocument, AdviceError};
use crate::drift::{list_reports_in, DriftError, DriftReport, PanelMetric};

pub const MONITORING_HEADERS: [&str; 7] = [
    "Generated",
    "Reference Rows",
    "Predictions",
    "Drift Share",
    "Dataset Drift",
    "Target Drift Score",
    "MAPE",
];

pub trait AdviceSource: Send + Sync + 'static {
    fn advice(&self) -> Result<AdviceDocument, AdviceError>;
}

pub trait ReportSource: Send + Sync + 'static {
    fn reports(&self) -> Result<Vec<DriftReport>, DriftError>;
}

#[derive(Debug, Clone)]
pub struct FileAdviceSource {
    path: PathBuf,
}

impl FileAdviceSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl AdviceSource for FileAdviceSource {
    fn advice(&self) -> Result<AdviceDocument, AdviceError> {
        read_advice(&self.path)
    }
}

#[derive(Clone, Default)]
pub struct InMemoryAdviceSource {
    inner: Arc<RwLock<Option<AdviceDocument>>>,
}

impl InMemoryAdviceSource {
    pub fn new(document: Option<AdviceDocument>) -> Self {
        Self {
            inner: Arc::new(RwLock::new(document)),
        }
    }

    pub fn replace(&self, document: Option<AdviceDocument>) {
        let mut guard = self.inner.write().unwrap_or_else(|err| err.into_inner());
        *guard = document;
    }
}

impl AdviceSource for InMemoryAdviceSource {
    fn advice(&self) -> Result<AdviceDocument, AdviceError> {
        self.inner
            .read()
            .unwrap_or_else(|err| err.into_inner())
            .clone()
            .ok_or_else(|| {
                AdviceError::Io(std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    "no advice published yet",
                ))
            })
    }
}

#[derive(Debug, Clone)]
pub struct WorkspaceReportSource {
    root: PathBuf,
}

impl WorkspaceReportSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl ReportSource for WorkspaceReportSource {
    fn reports(&self) -> Result<Vec<DriftReport>, DriftError> {
        list_reports_in(&self.root)
    }
}

#[derive(Clone, Default)]
pub struct InMemoryReportSource {
    inner: Arc<RwLock<Vec<DriftReport>>>,
}

impl InMemoryReportSource {
    pub fn new(reports: Vec<DriftReport>) -> Self {
        Self {
            inner: Arc::new(RwLock::new(reports)),
        }
    }
}

impl ReportSource for InMemoryReportSource {
    fn reports(&self) -> Result<Vec<DriftReport>, DriftError> {
        Ok(self
            .inner
            .read()
            .unwrap_or_else(|err| err.into_inner())
            .clone())
    }
}

pub fn advice_router(advice: Arc<dyn AdviceSource>, reports: Arc<dyn ReportSource>) -> Router {
    Router::new()
        .route("/advice", get(get_advice))
        .route("/monitoring", get(get_monitoring_html))
        .route("/monitoring/reports", get(get_monitoring_reports))
        .with_state(AdvisorAppState { advice, reports })
}

pub fn render_monitoring_html(reports: &[DriftReport]) -> String {
    let now_utc = Utc::now().format("%Y-%m-%d %H:%M:%S UTC").to_string();

    let mut out = String::new();
    out.push_str("<!DOCTYPE html><html><head><meta charset=\"utf-8\">\n");
    out.push_str("<meta name=\"viewport\" content=\"width=device-width, initial-scale=1\">\n");
    out.push_str("<title>Trading Advisor Monitoring</title>\n");
    out.push_str("<style>body{margin:0;font-family:\"Segoe UI\",sans-serif;background:#f4f6f8;color:#182026}.shell{max-width:1100px;margin:0 auto;padding:24px 18px}.hero{background:#14343f;color:#f7fbfc;border-radius:12px;padding:16px 20px}.hero h1{margin:0 0 6px;font-size:1.4rem}.hero-meta{display:flex;gap:16px;font-size:.9rem;color:#dcebf0}table{width:100%;margin-top:16px;border-collapse:collapse;background:#fff}thead th{background:#14343f;color:#f2f7f9;font-size:.8rem;text-transform:uppercase;padding:9px 10px;text-align:left}tbody td{font-size:.85rem;padding:8px 10px;border-bottom:1px solid #d7dce1}.drift{background:#ffe3e0}</style>\n");
    out.push_str("</head><body><main class=\"shell\">\n");
    out.push_str("<section class=\"hero\"><h1>Trading Advisor Monitoring</h1>");
    out.push_str("<div class=\"hero-meta\">\n");
    out.push_str(&format!("<span>Reports: {}</span>", reports.len()));
    out.push_str(&format!(
        "<span>Generated: {}</span>",
        escape_html(&now_utc)
    ));
    out.push_str("</div></section>\n");
    out.push_str("<table id=\"monitoring-table\"><thead><tr>");
    for header in MONITORING_HEADERS {
        out.push_str("<th>");
        out.push_str(&escape_html(header));
        out.push_str("</th>");
    }
    out.push_str("</tr></thead><tbody>\n");

    for (idx, report) in reports.iter().enumerate() {
        let class = if report.dataset_drift { "drift" } else { "" };
        out.push_str(&format!("<tr data-row=\"{idx}\" class=\"{class}\">"));
        for value in report_cells(report) {
            out.push_str("<td>");
            out.push_str(&escape_html(&value));
            out.push_str("</td>");
        }
        out.push_str("</tr>\n");
    }

    out.push_str("</tbody></table></main></body></html>\n");
    out
}

fn report_cells(report: &DriftReport) -> Vec<String> {
    vec![
        report.generated_at.clone(),
        report.reference_rows.to_string(),
        format!("{:.0}", PanelMetric::PredictionCount.value(report)),
        format!("{:.3}", PanelMetric::DatasetDriftShare.value(report)),
        if report.dataset_drift { "yes" } else { "no" }.to_string(),
        format!("{:.4}", PanelMetric::TargetDriftScore.value(report)),
        format!("{:.4}", PanelMetric::Mape.value(report)),
    ]
}

fn escape_html(input: &str) -> String {
    input
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&#39;")
}

#[derive(Clone)]
struct AdvisorAppState {
    advice: Arc<dyn AdviceSource>,
    reports: Arc<dyn ReportSource>,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

fn unavailable(message: String) -> Response {
    (
        StatusCode::SERVICE_UNAVAILABLE,
        Json(ErrorBody { error: message }),
    )
        .into_response()
}

async fn get_advice(State(state): State<AdvisorAppState>) -> Response {
    match state.advice.advice() {
        Ok(document) => {
            info!(
                component = "advice_server",
                event = "http.advice.request",
                status = 200,
                entities = document.len()
            );
            Json(document).into_response()
        }
        Err(err) => {
            warn!(
                component = "advice_server",
                event = "http.advice.request",
                status = 503,
                error = %err
            );
            unavailable(format!("advice unavailable: {err}"))
        }
    }
}

async fn get_monitoring_html(State(state): State<AdvisorAppState>) -> Response {
    match state.reports.reports() {
        Ok(reports) => Html(render_monitoring_html(&reports)).into_response(),
        Err(err) => {
            warn!(
                component = "advice_server",
                event = "http.monitoring.request",
                status = 503,
                error = %err
            );
            unavailable(format!("monitoring reports unavailable: {err}"))
        }
    }
}

async fn get_monitoring_reports(State(state): State<AdvisorAppState>) -> Response {
    match state.reports.reports() {
        Ok(reports) => Json(reports).into_response(),
        Err(err) => unavailable(format!("monitoring reports unavailable: {err}")),
    }
}
