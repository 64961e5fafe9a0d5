//! Daily close-price history for index constituents.

use std::collections::{BTreeMap, HashSet};
use std::fmt::Display;
use std::fs;
use std::path::Path;

use chrono::{DateTime, NaiveDate};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::features::{Observation, Panel};

const CHART_BASE_URL: &str = "https://query1.finance.yahoo.com/v8/finance/chart";
const USER_AGENT: &str = "trading-advisor/0.1";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            delay_ms: 5_000,
        }
    }
}

impl RetryPolicy {
    pub fn run<T, E: Display>(
        &self,
        operation: &str,
        mut f: impl FnMut() -> Result<T, E>,
    ) -> Result<T, E> {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt: u32 = 1;
        loop {
            match f() {
                Ok(value) => return Ok(value),
                Err(err) if attempt >= max_attempts => {
                    warn!(
                        component = "market_data",
                        event = "market_data.fetch.exhausted",
                        operation,
                        attempts = attempt,
                        error = %err
                    );
                    return Err(err);
                }
                Err(err) => {
                    warn!(
                        component = "market_data",
                        event = "market_data.fetch.retry",
                        operation,
                        attempt,
                        max_attempts,
                        delay_ms = self.delay_ms,
                        error = %err
                    );
                    attempt = attempt.saturating_add(1);
                    std::thread::sleep(std::time::Duration::from_millis(self.delay_ms));
                }
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PriceBar {
    pub date: NaiveDate,
    pub close: f64,
}

#[derive(Debug, Error)]
pub enum MarketDataError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
    #[error("ticker list at {path} is empty")]
    NoTickers { path: String },
    #[error("invalid length_of_data '{0}'")]
    InvalidLength(String),
    #[error("HTTP client build error: {0}")]
    HttpClientBuild(String),
    #[error("HTTP request failed for {url}: {message}")]
    HttpRequest { url: String, message: String },
    #[error("invalid chart payload for {ticker}: {message}")]
    InvalidPayload { ticker: String, message: String },
    #[error("chart API error for {ticker}: {code}: {description}")]
    Api {
        ticker: String,
        code: String,
        description: String,
    },
}

pub trait HttpFetcher {
    fn get_bytes(&self, url: &str) -> Result<Vec<u8>, MarketDataError>;
}

pub struct ReqwestBlockingFetcher {
    client: reqwest::blocking::Client,
}

impl ReqwestBlockingFetcher {
    pub fn new(timeout_ms: u64) -> Result<Self, MarketDataError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(std::time::Duration::from_millis(timeout_ms))
            .user_agent(USER_AGENT)
            .build()
            .map_err(|err| MarketDataError::HttpClientBuild(err.to_string()))?;
        Ok(Self { client })
    }
}

impl HttpFetcher for ReqwestBlockingFetcher {
    fn get_bytes(&self, url: &str) -> Result<Vec<u8>, MarketDataError> {
        let response = self
            .client
            .get(url)
            .send()
            .map_err(|err| MarketDataError::HttpRequest {
                url: url.to_string(),
                message: err.to_string(),
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(MarketDataError::HttpRequest {
                url: url.to_string(),
                message: format!("unexpected HTTP status {status}"),
            });
        }

        response
            .bytes()
            .map(|bytes| bytes.to_vec())
            .map_err(|err| MarketDataError::HttpRequest {
                url: url.to_string(),
                message: err.to_string(),
            })
    }
}

#[derive(Debug, Deserialize)]
struct TickerRecord {
    ticker: String,
}

pub fn load_tickers(path: &Path) -> Result<Vec<String>, MarketDataError> {
    let file = fs::File::open(path)?;
    let mut reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .from_reader(file);

    let mut seen = HashSet::new();
    let mut tickers = Vec::new();
    for record in reader.deserialize::<TickerRecord>() {
        let ticker = record?.ticker;
        if ticker.is_empty() {
            continue;
        }
        if seen.insert(ticker.clone()) {
            tickers.push(ticker);
        }
    }

    if tickers.is_empty() {
        return Err(MarketDataError::NoTickers {
            path: path.display().to_string(),
        });
    }

    info!(
        component = "market_data",
        event = "market_data.tickers.loaded",
        path = %path.display(),
        ticker_count = tickers.len()
    );

    Ok(tickers)
}

/// Accepts lookback windows such as `60d`, `6mo`, `2wk`, `1y`, `ytd` and `max`.
pub fn parse_length_of_data(raw: &str) -> Result<String, MarketDataError> {
    let normalized = raw.trim().to_ascii_lowercase();
    if normalized == "ytd" || normalized == "max" {
        return Ok(normalized);
    }

    let digits_end = normalized
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(normalized.len());
    let (count, unit) = normalized.split_at(digits_end);
    let count_ok = count.parse::<u32>().map(|n| n > 0).unwrap_or(false);
    let unit_ok = matches!(unit, "d" | "wk" | "mo" | "y");

    if count_ok && unit_ok {
        Ok(normalized)
    } else {
        Err(MarketDataError::InvalidLength(raw.to_string()))
    }
}

pub fn chart_url(ticker: &str, length_of_data: &str) -> String {
    format!("{CHART_BASE_URL}/{ticker}?range={length_of_data}&interval=1d")
}

pub fn fetch_price_history(
    fetcher: &dyn HttpFetcher,
    ticker: &str,
    length_of_data: &str,
    retry: &RetryPolicy,
) -> Result<Vec<PriceBar>, MarketDataError> {
    let range = parse_length_of_data(length_of_data)?;
    let url = chart_url(ticker, &range);
    let payload = retry.run(ticker, || fetcher.get_bytes(&url))?;
    debug!(
        component = "market_data",
        event = "market_data.fetch.downloaded",
        ticker,
        url = %url,
        bytes = payload.len()
    );
    parse_chart_payload(ticker, &payload)
}

pub fn fetch_panel(
    fetcher: &dyn HttpFetcher,
    tickers: &[String],
    length_of_data: &str,
    retry: &RetryPolicy,
) -> Result<Panel, MarketDataError> {
    info!(
        component = "market_data",
        event = "market_data.fetch.start",
        ticker_count = tickers.len(),
        length_of_data,
        max_attempts = retry.max_attempts
    );

    let mut observations = Vec::new();
    for ticker in tickers {
        let bars = fetch_price_history(fetcher, ticker, length_of_data, retry)?;
        if bars.is_empty() {
            warn!(
                component = "market_data",
                event = "market_data.fetch.empty_series",
                ticker = %ticker
            );
        }
        observations.extend(
            bars.into_iter()
                .map(|bar| Observation::new(ticker.clone(), bar.date, bar.close)),
        );
    }

    info!(
        component = "market_data",
        event = "market_data.fetch.finish",
        ticker_count = tickers.len(),
        rows = observations.len()
    );

    Ok(Panel::new(observations))
}

#[derive(Debug, Deserialize)]
struct ChartEnvelope {
    chart: ChartBody,
}

#[derive(Debug, Deserialize)]
struct ChartBody {
    result: Option<Vec<ChartResult>>,
    error: Option<ChartApiError>,
}

#[derive(Debug, Deserialize)]
struct ChartApiError {
    code: String,
    description: String,
}

#[derive(Debug, Deserialize)]
struct ChartResult {
    meta: Option<ChartMeta>,
    #[serde(default)]
    timestamp: Vec<i64>,
    indicators: ChartIndicators,
}

#[derive(Debug, Deserialize)]
struct ChartMeta {
    #[serde(default)]
    gmtoffset: i64,
}

#[derive(Debug, Deserialize)]
struct ChartIndicators {
    #[serde(default)]
    quote: Vec<ChartQuote>,
}

#[derive(Debug, Deserialize)]
struct ChartQuote {
    #[serde(default)]
    close: Vec<Option<f64>>,
}

pub fn parse_chart_payload(ticker: &str, payload: &[u8]) -> Result<Vec<PriceBar>, MarketDataError> {
    let envelope: ChartEnvelope =
        serde_json::from_slice(payload).map_err(|err| MarketDataError::InvalidPayload {
            ticker: ticker.to_string(),
            message: err.to_string(),
        })?;

    if let Some(api_error) = envelope.chart.error {
        return Err(MarketDataError::Api {
            ticker: ticker.to_string(),
            code: api_error.code,
            description: api_error.description,
        });
    }

    let result = envelope
        .chart
        .result
        .and_then(|results| results.into_iter().next())
        .ok_or_else(|| MarketDataError::InvalidPayload {
            ticker: ticker.to_string(),
            message: "chart result is empty".to_string(),
        })?;

    let gmtoffset = result.meta.map(|meta| meta.gmtoffset).unwrap_or(0);
    let closes = result
        .indicators
        .quote
        .into_iter()
        .next()
        .map(|quote| quote.close)
        .unwrap_or_default();

    if closes.len() != result.timestamp.len() {
        return Err(MarketDataError::InvalidPayload {
            ticker: ticker.to_string(),
            message: format!(
                "{} timestamps but {} closes",
                result.timestamp.len(),
                closes.len()
            ),
        });
    }

    let mut by_date = BTreeMap::new();
    for (ts, close) in result.timestamp.iter().zip(closes) {
        let Some(close) = close else {
            continue;
        };
        let date = DateTime::from_timestamp(ts.saturating_add(gmtoffset), 0)
            .map(|dt| dt.date_naive())
            .ok_or_else(|| MarketDataError::InvalidPayload {
                ticker: ticker.to_string(),
                message: format!("invalid timestamp {ts}"),
            })?;
        by_date.insert(date, close);
    }

    Ok(by_date
        .into_iter()
        .map(|(date, close)| PriceBar { date, close })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::collections::HashMap;
    use std::io::Write;
    use tempfile::NamedTempFile;

    const SAMPLE_CHART: &str = r#"{"chart":{"result":[{"meta":{"symbol":"ABI.BR","gmtoffset":3600},"timestamp":[1704182400,1704268800,1704355200],"indicators":{"quote":[{"close":[60.1,null,61.0]}]}}],"error":null}}"#;

    #[derive(Default)]
    struct MockFetcher {
        responses: HashMap<String, Vec<u8>>,
    }

    impl MockFetcher {
        fn with(mut self, url: &str, body: &str) -> Self {
            self.responses.insert(url.to_string(), body.as_bytes().to_vec());
            self
        }
    }

    impl HttpFetcher for MockFetcher {
        fn get_bytes(&self, url: &str) -> Result<Vec<u8>, MarketDataError> {
            self.responses
                .get(url)
                .cloned()
                .ok_or_else(|| MarketDataError::HttpRequest {
                    url: url.to_string(),
                    message: "missing mock response".to_string(),
                })
        }
    }

    struct FlakyFetcher {
        failures_left: Cell<u32>,
        calls: Cell<u32>,
    }

    impl HttpFetcher for FlakyFetcher {
        fn get_bytes(&self, url: &str) -> Result<Vec<u8>, MarketDataError> {
            self.calls.set(self.calls.get() + 1);
            if self.failures_left.get() > 0 {
                self.failures_left.set(self.failures_left.get() - 1);
                return Err(MarketDataError::HttpRequest {
                    url: url.to_string(),
                    message: "connection reset".to_string(),
                });
            }
            Ok(SAMPLE_CHART.as_bytes().to_vec())
        }
    }

    fn no_delay(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            delay_ms: 0,
        }
    }

    #[test]
    fn chart_payload_skips_null_closes_and_uses_exchange_offset() {
        let bars = parse_chart_payload("ABI.BR", SAMPLE_CHART.as_bytes()).unwrap();
        assert_eq!(bars.len(), 2);
        assert_eq!(bars[0].date, NaiveDate::from_ymd_opt(2024, 1, 2).unwrap());
        assert_eq!(bars[0].close, 60.1);
        assert_eq!(bars[1].date, NaiveDate::from_ymd_opt(2024, 1, 4).unwrap());
    }

    #[test]
    fn chart_api_error_is_surfaced() {
        let payload = r#"{"chart":{"result":null,"error":{"code":"Not Found","description":"No data found"}}}"#;
        let err = parse_chart_payload("NOPE.BR", payload.as_bytes()).unwrap_err();
        assert!(matches!(err, MarketDataError::Api { ref code, .. } if code == "Not Found"));
    }

    #[test]
    fn mismatched_series_lengths_are_rejected() {
        let payload = r#"{"chart":{"result":[{"timestamp":[1704182400],"indicators":{"quote":[{"close":[1.0,2.0]}]}}],"error":null}}"#;
        let err = parse_chart_payload("X", payload.as_bytes()).unwrap_err();
        assert!(matches!(err, MarketDataError::InvalidPayload { .. }));
    }

    #[test]
    fn length_of_data_accepts_known_units_only() {
        assert_eq!(parse_length_of_data("60d").unwrap(), "60d");
        assert_eq!(parse_length_of_data(" 6MO ").unwrap(), "6mo");
        assert_eq!(parse_length_of_data("max").unwrap(), "max");
        assert!(parse_length_of_data("0d").is_err());
        assert!(parse_length_of_data("60").is_err());
        assert!(parse_length_of_data("d").is_err());
        assert!(parse_length_of_data("3h").is_err());
    }

    #[test]
    fn retry_recovers_after_transient_failures() {
        let fetcher = FlakyFetcher {
            failures_left: Cell::new(2),
            calls: Cell::new(0),
        };
        let bars = fetch_price_history(&fetcher, "ABI.BR", "60d", &no_delay(3)).unwrap();
        assert_eq!(bars.len(), 2);
        assert_eq!(fetcher.calls.get(), 3);
    }

    #[test]
    fn retry_gives_up_after_max_attempts() {
        let fetcher = FlakyFetcher {
            failures_left: Cell::new(5),
            calls: Cell::new(0),
        };
        let err = fetch_price_history(&fetcher, "ABI.BR", "60d", &no_delay(2)).unwrap_err();
        assert!(matches!(err, MarketDataError::HttpRequest { .. }));
        assert_eq!(fetcher.calls.get(), 2);
    }

    #[test]
    fn fetch_panel_concatenates_tickers() {
        let fetcher = MockFetcher::default()
            .with(&chart_url("ABI.BR", "60d"), SAMPLE_CHART)
            .with(&chart_url("KBC.BR", "60d"), SAMPLE_CHART);
        let tickers = vec!["ABI.BR".to_string(), "KBC.BR".to_string()];

        let panel = fetch_panel(&fetcher, &tickers, "60d", &no_delay(1)).unwrap();
        assert_eq!(panel.len(), 4);
        assert_eq!(panel.entities(), vec!["ABI.BR", "KBC.BR"]);
    }

    #[test]
    fn tickers_file_is_trimmed_and_deduplicated() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "ticker\nABI.BR\n KBC.BR \n\nABI.BR\nUCB.BR").unwrap();

        let tickers = load_tickers(file.path()).unwrap();
        assert_eq!(tickers, vec!["ABI.BR", "KBC.BR", "UCB.BR"]);
    }

    #[test]
    fn header_only_tickers_file_is_an_error() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "ticker").unwrap();
        assert!(matches!(
            load_tickers(file.path()),
            Err(MarketDataError::NoTickers { .. })
        ));
    }
}
