//! Yahoo Finance daily bars
//!
//! Uses the public chart endpoint (no API key). Requests run on a small
//! private tokio runtime so the client can be called from scheduler threads.

use super::MarketDataClient;
use crate::error::{Result, StocknubError};
use crate::types::PriceBar;
use chrono::{DateTime, Duration as ChronoDuration, NaiveDate};
use chrono_tz::Tz;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use std::time::Duration;
use tokio::runtime::Runtime;

const YAHOO_CHART_URL: &str = "https://query1.finance.yahoo.com/v8/finance/chart";

/// Yahoo Finance client
pub struct YahooClient {
    client: Client,
    runtime: Runtime,
    /// Appended to every ticker, e.g. ".JK" for the Indonesia exchange
    symbol_suffix: String,
    /// Exchange timezone used to turn bar timestamps into session dates
    timezone: Tz,
}

#[derive(Debug, Deserialize)]
struct ChartResponse {
    chart: Chart,
}

#[derive(Debug, Deserialize)]
struct Chart {
    result: Option<Vec<ChartResult>>,
    error: Option<ChartError>,
}

#[derive(Debug, Deserialize)]
struct ChartError {
    code: String,
    description: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChartResult {
    #[serde(default)]
    timestamp: Vec<i64>,
    indicators: Indicators,
}

#[derive(Debug, Deserialize)]
struct Indicators {
    quote: Vec<Quote>,
}

#[derive(Debug, Default, Deserialize)]
struct Quote {
    #[serde(default)]
    open: Vec<Option<f64>>,
    #[serde(default)]
    high: Vec<Option<f64>>,
    #[serde(default)]
    low: Vec<Option<f64>>,
    #[serde(default)]
    close: Vec<Option<f64>>,
    #[serde(default)]
    volume: Vec<Option<f64>>,
}

impl YahooClient {
    pub fn new(symbol_suffix: impl Into<String>, timezone: Tz) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .user_agent("Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36")
            .build()
            .map_err(|e| StocknubError::ConfigError(format!("Failed to create HTTP client: {}", e)))?;
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .enable_all()
            .build()?;

        Ok(Self {
            client,
            runtime,
            symbol_suffix: symbol_suffix.into(),
            timezone,
        })
    }

    async fn fetch_chart(&self, entity: &str, start: NaiveDate, end: NaiveDate) -> Result<String> {
        let failed = |reason: String| StocknubError::FetchFailed {
            entity: entity.to_string(),
            reason,
        };
        let period1 = start
            .and_hms_opt(0, 0, 0)
            .map(|dt| dt.and_utc().timestamp())
            .ok_or_else(|| failed("invalid start date".to_string()))?;
        // period2 is exclusive
        let period2 = (end + ChronoDuration::days(1))
            .and_hms_opt(0, 0, 0)
            .map(|dt| dt.and_utc().timestamp())
            .ok_or_else(|| failed("invalid end date".to_string()))?;

        let url = format!(
            "{}/{}{}?period1={}&period2={}&interval=1d&events=history",
            YAHOO_CHART_URL, entity, self.symbol_suffix, period1, period2
        );

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| failed(format!("HTTP request failed: {}", e)))?;

        if response.status() == StatusCode::NOT_FOUND {
            return Err(StocknubError::UnknownTicker(entity.to_string()));
        }
        if !response.status().is_success() {
            return Err(failed(format!("Yahoo Finance returned {}", response.status())));
        }

        response
            .text()
            .await
            .map_err(|e| failed(format!("Failed to read response: {}", e)))
    }

    fn parse_chart(&self, entity: &str, body: &str) -> Result<Vec<PriceBar>> {
        let failed = |reason: String| StocknubError::FetchFailed {
            entity: entity.to_string(),
            reason,
        };
        let parsed: ChartResponse =
            serde_json::from_str(body).map_err(|e| failed(format!("JSON parse error: {}", e)))?;

        if let Some(error) = parsed.chart.error {
            if error.code == "Not Found" {
                return Err(StocknubError::UnknownTicker(entity.to_string()));
            }
            return Err(failed(format!(
                "{}: {}",
                error.code,
                error.description.unwrap_or_default()
            )));
        }

        let result = match parsed.chart.result.and_then(|r| r.into_iter().next()) {
            Some(result) => result,
            None => return Ok(Vec::new()),
        };
        let quote = result.indicators.quote.into_iter().next().unwrap_or_default();
        let at = |series: &[Option<f64>], i: usize| series.get(i).copied().flatten().unwrap_or(f64::NAN);

        let mut bars = Vec::with_capacity(result.timestamp.len());
        for (i, &ts) in result.timestamp.iter().enumerate() {
            let date = match DateTime::from_timestamp(ts, 0) {
                Some(dt) => dt.with_timezone(&self.timezone).date_naive(),
                None => continue,
            };
            bars.push(PriceBar::new(
                date,
                at(&quote.open, i),
                at(&quote.high, i),
                at(&quote.low, i),
                at(&quote.close, i),
                at(&quote.volume, i),
            ));
        }
        bars.sort_by_key(|b| b.date);
        bars.dedup_by_key(|b| b.date);
        Ok(bars)
    }
}

impl MarketDataClient for YahooClient {
    fn fetch(&self, entity: &str, start: NaiveDate, end: NaiveDate) -> Result<Vec<PriceBar>> {
        if start > end {
            return Ok(Vec::new());
        }
        let body = self.runtime.block_on(self.fetch_chart(entity, start, end))?;
        let bars = self.parse_chart(entity, &body)?;
        Ok(bars
            .into_iter()
            .filter(|b| b.date >= start && b.date <= end)
            .collect())
    }

    fn name(&self) -> &str {
        "yahoo"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> YahooClient {
        YahooClient::new(".JK", chrono_tz::Asia::Jakarta).unwrap()
    }

    #[test]
    fn test_chart_parsing() {
        // 2024-01-02 and 2024-01-03 09:00 WIB
        let body = r#"{"chart":{"result":[{"timestamp":[1704160800,1704247200],
            "indicators":{"quote":[{"open":[100.0,103.0],"high":[105.0,106.0],
            "low":[99.0,102.0],"close":[103.0,null],"volume":[1000000,1100000]}]}}],
            "error":null}}"#;
        let bars = client().parse_chart("BBCA", body).unwrap();
        assert_eq!(bars.len(), 2);
        assert_eq!(bars[0].date, NaiveDate::from_ymd_opt(2024, 1, 2).unwrap());
        assert_eq!(bars[0].close, 103.0);
        assert!(bars[1].close.is_nan());
    }

    #[test]
    fn test_not_found_is_unknown_ticker() {
        let body = r#"{"chart":{"result":null,"error":{"code":"Not Found","description":"No data found, symbol may be delisted"}}}"#;
        assert!(matches!(
            client().parse_chart("ZZZZ", body),
            Err(StocknubError::UnknownTicker(_))
        ));
    }
}
