use std::io;
use std::io::Write;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex};

use advisor::{
    advice_router, chronological_split, fetch_panel, log_app_bind, log_app_start, log_flow_step,
    HttpFetcher, InMemoryAdviceSource, InMemoryReportSource, LoggingConfig, MarketDataError,
    Observation, Panel, PipelineConfig, RetryPolicy,
};
use axum::{
    body::Body,
    http::{Request, StatusCode},
};
use chrono::NaiveDate;
use tower::util::ServiceExt;
use tracing::dispatcher::with_default;
use tracing::Level;
use tracing_subscriber::fmt::writer::MakeWriter;

#[derive(Clone, Default)]
struct SharedWriter {
    inner: Arc<Mutex<Vec<u8>>>,
}

impl SharedWriter {
    fn output_string(&self) -> String {
        let bytes = self
            .inner
            .lock()
            .expect("writer lock should not be poisoned");
        String::from_utf8_lossy(&bytes).to_string()
    }
}

struct SharedWriterGuard {
    inner: Arc<Mutex<Vec<u8>>>,
}

impl<'a> MakeWriter<'a> for SharedWriter {
    type Writer = SharedWriterGuard;

    fn make_writer(&'a self) -> Self::Writer {
        SharedWriterGuard {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl Write for SharedWriterGuard {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut out = self
            .inner
            .lock()
            .expect("writer lock should not be poisoned");
        out.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

fn capture_logs(max_level: Level, f: impl FnOnce()) -> String {
    let writer = SharedWriter::default();
    let subscriber = tracing_subscriber::fmt()
        .json()
        .with_ansi(false)
        .with_max_level(max_level)
        .with_writer(writer.clone())
        .finish();
    let dispatch = tracing::Dispatch::new(subscriber);

    with_default(&dispatch, f);
    writer.output_string()
}

struct DownFetcher;

impl HttpFetcher for DownFetcher {
    fn get_bytes(&self, url: &str) -> Result<Vec<u8>, MarketDataError> {
        Err(MarketDataError::HttpRequest {
            url: url.to_string(),
            message: "simulated outage".to_string(),
        })
    }
}

#[test]
fn fetch_retries_and_exhaustion_are_logged() {
    let retry = RetryPolicy {
        max_attempts: 2,
        delay_ms: 0,
    };
    let logs = capture_logs(Level::INFO, || {
        let err = fetch_panel(&DownFetcher, &["ABI.BR".to_string()], "60d", &retry)
            .expect_err("outage should bubble up after retries");
        assert!(matches!(err, MarketDataError::HttpRequest { .. }));
    });

    assert!(logs.contains("\"event\":\"market_data.fetch.start\""));
    assert!(logs.contains("\"event\":\"market_data.fetch.retry\""));
    assert!(logs.contains("\"event\":\"market_data.fetch.exhausted\""));
}

#[test]
fn split_logs_dropped_label_counts() {
    let day = |d| NaiveDate::from_ymd_opt(2024, 1, d).unwrap();
    let mut observations = Vec::new();
    for d in 1..=5 {
        let mut obs = Observation::new("ABI.BR", day(d), 60.0 + d as f64);
        obs.log_return = (d > 1).then_some(0.01);
        observations.push(obs);
    }

    let logs = capture_logs(Level::INFO, || {
        let split = chronological_split(&Panel::new(observations), 0.8)
            .expect("valid ratio should split");
        assert_eq!(split.report.train_rows_dropped, 1);
    });

    assert!(logs.contains("\"event\":\"features.split.finish\""));
    assert!(logs.contains("\"train_rows_dropped\":1"));
}

#[test]
fn lifecycle_helpers_emit_baseline_events() {
    let logs = capture_logs(Level::INFO, || {
        log_app_start(
            "advisor_pipeline",
            &LoggingConfig::default(),
            &PipelineConfig::default(),
        );
        log_flow_step("training", "fetch", "start");
        log_app_bind(SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 9696));
    });

    assert!(logs.contains("\"event\":\"app.start\""));
    assert!(logs.contains("\"index_name\":\"BEL_20\""));
    assert!(logs.contains("\"event\":\"flow.step\""));
    assert!(logs.contains("\"event\":\"app.bind\""));
}

#[test]
fn advice_route_emits_http_advice_event() {
    let logs = capture_logs(Level::INFO, || {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .expect("single-thread runtime should build");

        rt.block_on(async {
            let app = advice_router(
                Arc::new(InMemoryAdviceSource::default()),
                Arc::new(InMemoryReportSource::default()),
            );

            let response = app
                .oneshot(
                    Request::builder()
                        .uri("/advice")
                        .body(Body::empty())
                        .expect("request should build"),
                )
                .await
                .expect("advice request should complete");

            assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        });
    });

    assert!(logs.contains("\"event\":\"http.advice.request\""));
    assert!(logs.contains("\"status\":503"));
}
