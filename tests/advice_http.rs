use std::collections::BTreeMap;
use std::sync::Arc;

use advisor::{
    advice_router, write_advice, AdviceDocument, AdviceEntry, ColumnDrift, Direction,
    DriftReport, FileAdviceSource, InMemoryAdviceSource, InMemoryReportSource,
    RegressionMetrics,
};
use axum::{
    body::{to_bytes, Body},
    http::{Request, StatusCode},
    Router,
};
use tempfile::tempdir;
use tower::util::ServiceExt;

fn document() -> AdviceDocument {
    let mut entries = BTreeMap::new();
    entries.insert(
        "ABI.BR".to_string(),
        AdviceEntry {
            prediction: 0.0125,
            advice: Direction::Buy,
        },
    );
    entries.insert(
        "KBC.BR".to_string(),
        AdviceEntry {
            prediction: -0.5,
            advice: Direction::Sell,
        },
    );
    AdviceDocument { entries }
}

fn report(generated_at: &str, dataset_drift: bool) -> DriftReport {
    let target = ColumnDrift {
        column: "target".to_string(),
        statistic: 0.2,
        p_value: 0.03,
        drifted: true,
    };
    DriftReport {
        generated_at: generated_at.to_string(),
        reference_rows: 150,
        current_rows: 19,
        columns: vec![],
        share_of_drifted_columns: 0.5,
        dataset_drift,
        target_drift: target.clone(),
        prediction_drift: target,
        regression: RegressionMetrics {
            mse: 0.0001,
            mae: 0.008,
            r2: 0.1,
            mape: 1.5,
            n_samples: 19,
        },
        data_quality: vec![],
    }
}

async fn get(app: Router, uri: &str) -> (StatusCode, String) {
    let response = app
        .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    (status, String::from_utf8(body.to_vec()).unwrap())
}

#[tokio::test]
async fn advice_endpoint_returns_entity_keyed_json() {
    let app = advice_router(
        Arc::new(InMemoryAdviceSource::new(Some(document()))),
        Arc::new(InMemoryReportSource::default()),
    );

    let (status, body) = get(app, "/advice").await;
    assert_eq!(status, StatusCode::OK);

    let value: serde_json::Value = serde_json::from_str(&body).unwrap();
    assert_eq!(value["ABI.BR"]["advice"], "BUY");
    assert_eq!(value["ABI.BR"]["prediction"], 0.0125);
    assert_eq!(value["KBC.BR"]["advice"], "SELL");
}

#[tokio::test]
async fn missing_advice_file_is_service_unavailable() {
    let dir = tempdir().unwrap();
    let app = advice_router(
        Arc::new(FileAdviceSource::new(dir.path().join("advice.json"))),
        Arc::new(InMemoryReportSource::default()),
    );

    let (status, body) = get(app, "/advice").await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    let value: serde_json::Value = serde_json::from_str(&body).unwrap();
    assert!(value["error"].as_str().unwrap().starts_with("advice unavailable"));
}

#[tokio::test]
async fn file_source_picks_up_new_advice_without_restart() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("advice.json");
    let app = advice_router(
        Arc::new(FileAdviceSource::new(path.clone())),
        Arc::new(InMemoryReportSource::default()),
    );

    let (status, _) = get(app.clone(), "/advice").await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);

    write_advice(&path, &document()).unwrap();
    let (status, body) = get(app, "/advice").await;
    assert_eq!(status, StatusCode::OK);
    let parsed: AdviceDocument = serde_json::from_str(&body).unwrap();
    assert_eq!(parsed, document());
}

#[tokio::test]
async fn monitoring_page_lists_reports() {
    let app = advice_router(
        Arc::new(InMemoryAdviceSource::default()),
        Arc::new(InMemoryReportSource::new(vec![
            report("2024-03-01T06:00:00.000Z", false),
            report("2024-03-02T06:00:00.000Z", true),
        ])),
    );

    let (status, body) = get(app.clone(), "/monitoring").await;
    assert_eq!(status, StatusCode::OK);
    assert!(body.contains("<table id=\"monitoring-table\">"));
    assert!(body.contains("Reports: 2"));
    assert!(body.contains("2024-03-02T06:00:00.000Z"));
    assert!(body.contains("Target Drift Score"));

    let (status, body) = get(app, "/monitoring/reports").await;
    assert_eq!(status, StatusCode::OK);
    let reports: Vec<DriftReport> = serde_json::from_str(&body).unwrap();
    assert_eq!(reports.len(), 2);
    assert!(reports[1].dataset_drift);
}

#[tokio::test]
async fn unknown_route_is_not_found() {
    let app = advice_router(
        Arc::new(InMemoryAdviceSource::default()),
        Arc::new(InMemoryReportSource::default()),
    );
    let (status, _) = get(app, "/dashboard").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}
