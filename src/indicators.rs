//! Technical indicators used as model features
//!
//! Every indicator here is finite-window: its value at row `i` depends only on
//! rows `i - lookback ..= i`. That property is what lets the technical stage
//! recompute a handful of new rows from a short context slice and get exactly
//! the values a full recomputation would produce.

use crate::error::{Result, StocknubError};
use crate::types::PriceBar;
use serde::{Deserialize, Serialize};
use statrs::statistics::{Data, Distribution};
use std::collections::VecDeque;

/// Declared feature with its parameters
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum IndicatorSpec {
    /// Close relative to its simple moving average, minus one
    SmaRatio { period: usize },
    /// Relative Strength Index with simple averages
    Rsi { period: usize },
    /// Position of close inside the Bollinger Bands
    BollingerPercentB { period: usize, num_std_dev: f64 },
    /// Stochastic %K
    Stochastic { period: usize },
    /// Williams %R
    WilliamsR { period: usize },
    /// Average True Range as a percentage of close
    AtrPercent { period: usize },
    /// Percentage change of close over `period` rows
    RateOfChange { period: usize },
    /// Volume relative to its rolling mean
    VolumeRatio { period: usize },
    /// Commodity Channel Index
    Cci { period: usize },
    /// Average Directional Index
    Adx { period: usize },
    /// Aroon Up minus Aroon Down
    AroonOscillator { period: usize },
    /// Donchian channel width as a percentage of its centerline
    DonchianWidth { period: usize },
    /// Money Flow Index
    MoneyFlowIndex { period: usize },
    /// Chaikin Money Flow
    ChaikinMoneyFlow { period: usize },
    /// Regression slope of min-max scaled close over the `period` rows
    /// before the current one
    CloseTrend { period: usize },
}

impl IndicatorSpec {
    /// Feature column name
    pub fn name(&self) -> String {
        match self {
            IndicatorSpec::SmaRatio { period } => format!("sma_ratio_{}", period),
            IndicatorSpec::Rsi { period } => format!("rsi_{}", period),
            IndicatorSpec::BollingerPercentB { period, .. } => format!("bb_pctb_{}", period),
            IndicatorSpec::Stochastic { period } => format!("stoch_k_{}", period),
            IndicatorSpec::WilliamsR { period } => format!("williams_r_{}", period),
            IndicatorSpec::AtrPercent { period } => format!("atr_pct_{}", period),
            IndicatorSpec::RateOfChange { period } => format!("roc_{}", period),
            IndicatorSpec::VolumeRatio { period } => format!("volume_ratio_{}", period),
            IndicatorSpec::Cci { period } => format!("cci_{}", period),
            IndicatorSpec::Adx { period } => format!("adx_{}", period),
            IndicatorSpec::AroonOscillator { period } => format!("aroon_osc_{}", period),
            IndicatorSpec::DonchianWidth { period } => format!("donchian_width_{}", period),
            IndicatorSpec::MoneyFlowIndex { period } => format!("mfi_{}", period),
            IndicatorSpec::ChaikinMoneyFlow { period } => format!("cmf_{}", period),
            IndicatorSpec::CloseTrend { period } => format!("close_trend_{}", period),
        }
    }

    fn period(&self) -> usize {
        match *self {
            IndicatorSpec::SmaRatio { period }
            | IndicatorSpec::Rsi { period }
            | IndicatorSpec::BollingerPercentB { period, .. }
            | IndicatorSpec::Stochastic { period }
            | IndicatorSpec::WilliamsR { period }
            | IndicatorSpec::AtrPercent { period }
            | IndicatorSpec::RateOfChange { period }
            | IndicatorSpec::VolumeRatio { period }
            | IndicatorSpec::Cci { period }
            | IndicatorSpec::Adx { period }
            | IndicatorSpec::AroonOscillator { period }
            | IndicatorSpec::DonchianWidth { period }
            | IndicatorSpec::MoneyFlowIndex { period }
            | IndicatorSpec::ChaikinMoneyFlow { period }
            | IndicatorSpec::CloseTrend { period } => period,
        }
    }

    /// Number of prior rows required for a stable value
    pub fn lookback(&self) -> usize {
        let period = self.period();
        match self {
            // Need the close before the first row of the window
            IndicatorSpec::Rsi { .. }
            | IndicatorSpec::AtrPercent { .. }
            | IndicatorSpec::RateOfChange { .. }
            | IndicatorSpec::Adx { .. }
            | IndicatorSpec::MoneyFlowIndex { .. }
            | IndicatorSpec::CloseTrend { .. } => period,
            _ => period.saturating_sub(1),
        }
    }

    /// Reject degenerate parameters
    pub fn validate(&self) -> Result<()> {
        let min = match self {
            IndicatorSpec::BollingerPercentB { .. }
            | IndicatorSpec::AroonOscillator { .. }
            | IndicatorSpec::CloseTrend { .. } => 2,
            _ => 1,
        };
        if self.period() < min {
            return Err(StocknubError::ConfigError(format!(
                "indicator {} needs a period of at least {}",
                self.name(),
                min
            )));
        }
        if let IndicatorSpec::BollingerPercentB { num_std_dev, .. } = self {
            if !(num_std_dev.is_finite() && *num_std_dev > 0.0) {
                return Err(StocknubError::ConfigError(format!(
                    "indicator {} needs a positive band width",
                    self.name()
                )));
            }
        }
        Ok(())
    }

    /// Series aligned to `bars`; warm-up rows are NaN
    pub fn compute(&self, bars: &[PriceBar]) -> Vec<f64> {
        let period = self.period().max(1);
        let values: Vec<Option<f64>> = match *self {
            IndicatorSpec::SmaRatio { .. } => {
                let mut w = Window::new(period);
                bars.iter()
                    .map(|b| {
                        w.push(b.close);
                        w.mean().map(|sma| if sma != 0.0 { b.close / sma - 1.0 } else { 0.0 })
                    })
                    .collect()
            }
            IndicatorSpec::Rsi { .. } => {
                let mut rsi = Rsi::new(period);
                bars.iter().map(|b| rsi.update(b.close)).collect()
            }
            IndicatorSpec::BollingerPercentB { num_std_dev, .. } => {
                let mut bb = BollingerBands::new(period, num_std_dev);
                bars.iter()
                    .map(|b| {
                        bb.update(b.close).map(|(_, upper, lower)| {
                            if upper != lower {
                                (b.close - lower) / (upper - lower)
                            } else {
                                0.5
                            }
                        })
                    })
                    .collect()
            }
            IndicatorSpec::Stochastic { .. } => {
                let mut range = HighLowWindow::new(period);
                bars.iter()
                    .map(|b| {
                        range.update(b.high, b.low).map(|(hh, ll)| {
                            if hh != ll {
                                (b.close - ll) / (hh - ll) * 100.0
                            } else {
                                50.0
                            }
                        })
                    })
                    .collect()
            }
            IndicatorSpec::WilliamsR { .. } => {
                let mut range = HighLowWindow::new(period);
                bars.iter()
                    .map(|b| {
                        range.update(b.high, b.low).map(|(hh, ll)| {
                            if hh != ll {
                                (hh - b.close) / (hh - ll) * -100.0
                            } else {
                                -50.0
                            }
                        })
                    })
                    .collect()
            }
            IndicatorSpec::AtrPercent { .. } => {
                let mut atr = AverageTrueRange::new(period);
                bars.iter()
                    .map(|b| {
                        atr.update(b.high, b.low, b.close).map(|a| {
                            if b.close != 0.0 {
                                a / b.close * 100.0
                            } else {
                                0.0
                            }
                        })
                    })
                    .collect()
            }
            IndicatorSpec::RateOfChange { .. } => bars
                .iter()
                .enumerate()
                .map(|(i, b)| {
                    (i >= period).then(|| {
                        let base = bars[i - period].close;
                        if base != 0.0 {
                            (b.close / base - 1.0) * 100.0
                        } else {
                            0.0
                        }
                    })
                })
                .collect(),
            IndicatorSpec::VolumeRatio { .. } => {
                let mut w = Window::new(period);
                bars.iter()
                    .map(|b| {
                        w.push(b.volume);
                        w.mean()
                            .map(|mean| if mean != 0.0 { b.volume / mean } else { 0.0 })
                    })
                    .collect()
            }
            IndicatorSpec::Cci { .. } => {
                let mut cci = Cci::new(period);
                bars.iter().map(|b| cci.update(b.high, b.low, b.close)).collect()
            }
            IndicatorSpec::Adx { .. } => {
                let mut adx = Adx::new(period);
                bars.iter().map(|b| adx.update(b.high, b.low, b.close)).collect()
            }
            IndicatorSpec::AroonOscillator { .. } => {
                let mut aroon = Aroon::new(period);
                bars.iter()
                    .map(|b| aroon.update(b.high, b.low).map(|(up, down)| up - down))
                    .collect()
            }
            IndicatorSpec::DonchianWidth { .. } => {
                let mut range = HighLowWindow::new(period);
                bars.iter()
                    .map(|b| {
                        range.update(b.high, b.low).map(|(hh, ll)| {
                            let center = (hh + ll) / 2.0;
                            if center != 0.0 {
                                (hh - ll) / center * 100.0
                            } else {
                                0.0
                            }
                        })
                    })
                    .collect()
            }
            IndicatorSpec::MoneyFlowIndex { .. } => {
                let mut mfi = MoneyFlow::new(period);
                bars.iter()
                    .map(|b| mfi.update(b.high, b.low, b.close, b.volume))
                    .collect()
            }
            IndicatorSpec::ChaikinMoneyFlow { .. } => {
                let mut flow = Window::new(period);
                let mut volume = Window::new(period);
                bars.iter()
                    .map(|b| {
                        let range = b.high - b.low;
                        let multiplier = if range != 0.0 {
                            ((b.close - b.low) - (b.high - b.close)) / range
                        } else {
                            0.0
                        };
                        flow.push(multiplier * b.volume);
                        volume.push(b.volume);
                        let total = volume.sum()?;
                        let net = flow.sum()?;
                        Some(if total != 0.0 { net / total } else { 0.0 })
                    })
                    .collect()
            }
            IndicatorSpec::CloseTrend { .. } => {
                let mut prior = Window::new(period);
                bars.iter()
                    .map(|b| {
                        let slope = prior.is_full().then(|| scaled_slope(&prior.values));
                        prior.push(b.close);
                        slope
                    })
                    .collect()
            }
        };
        values.into_iter().map(|v| v.unwrap_or(f64::NAN)).collect()
    }
}

/// Default feature set
pub fn default_indicators() -> Vec<IndicatorSpec> {
    vec![
        IndicatorSpec::SmaRatio { period: 20 },
        IndicatorSpec::Rsi { period: 14 },
        IndicatorSpec::BollingerPercentB {
            period: 20,
            num_std_dev: 2.0,
        },
        IndicatorSpec::Stochastic { period: 14 },
        IndicatorSpec::WilliamsR { period: 14 },
        IndicatorSpec::AtrPercent { period: 14 },
        IndicatorSpec::RateOfChange { period: 10 },
        IndicatorSpec::VolumeRatio { period: 20 },
        IndicatorSpec::Cci { period: 20 },
        IndicatorSpec::Adx { period: 14 },
        IndicatorSpec::AroonOscillator { period: 25 },
        IndicatorSpec::DonchianWidth { period: 20 },
        IndicatorSpec::MoneyFlowIndex { period: 14 },
        IndicatorSpec::ChaikinMoneyFlow { period: 20 },
        IndicatorSpec::CloseTrend { period: 5 },
    ]
}

/// Maximum lookback over a set of indicators
pub fn max_lookback(specs: &[IndicatorSpec]) -> usize {
    specs.iter().map(IndicatorSpec::lookback).max().unwrap_or(0)
}

/// Indicator computation backend
pub trait IndicatorLibrary: Send + Sync {
    /// Series aligned to `bars`
    fn compute(&self, spec: &IndicatorSpec, bars: &[PriceBar]) -> Vec<f64>;
}

/// The built-in finite-window implementations
#[derive(Debug, Clone, Copy, Default)]
pub struct BuiltinIndicators;

impl IndicatorLibrary for BuiltinIndicators {
    fn compute(&self, spec: &IndicatorSpec, bars: &[PriceBar]) -> Vec<f64> {
        spec.compute(bars)
    }
}

/// Fixed-size trailing window
#[derive(Debug, Clone)]
struct Window {
    size: usize,
    values: VecDeque<f64>,
}

impl Window {
    fn new(size: usize) -> Self {
        Self {
            size,
            values: VecDeque::with_capacity(size),
        }
    }

    fn push(&mut self, value: f64) {
        self.values.push_back(value);
        if self.values.len() > self.size {
            self.values.pop_front();
        }
    }

    fn is_full(&self) -> bool {
        self.values.len() == self.size
    }

    fn sum(&self) -> Option<f64> {
        self.is_full().then(|| self.values.iter().sum::<f64>())
    }

    fn mean(&self) -> Option<f64> {
        self.sum().map(|total| total / self.size as f64)
    }
}

/// Least-squares slope of `values` rescaled to [0, 1], against `n` points
/// spread evenly over `0..=n`. Constant input has slope 0.
fn scaled_slope(values: &VecDeque<f64>) -> f64 {
    let n = values.len();
    if n < 2 {
        return 0.0;
    }
    let min = values.iter().fold(f64::MAX, |a, &b| a.min(b));
    let max = values.iter().fold(f64::MIN, |a, &b| a.max(b));
    if max == min {
        return 0.0;
    }
    let step = n as f64 / (n - 1) as f64;
    let xs: Vec<f64> = (0..n).map(|k| k as f64 * step).collect();
    let ys: Vec<f64> = values.iter().map(|v| (v - min) / (max - min)).collect();
    let mean_x = xs.iter().sum::<f64>() / n as f64;
    let mean_y = ys.iter().sum::<f64>() / n as f64;
    let (num, den) = xs.iter().zip(&ys).fold((0.0, 0.0), |(num, den), (x, y)| {
        (num + (x - mean_x) * (y - mean_y), den + (x - mean_x) * (x - mean_x))
    });
    num / den
}

#[derive(Debug, Clone)]
struct Rsi {
    gains: Window,
    losses: Window,
    prev_value: Option<f64>,
}

impl Rsi {
    fn new(period: usize) -> Self {
        Self {
            gains: Window::new(period),
            losses: Window::new(period),
            prev_value: None,
        }
    }

    fn update(&mut self, value: f64) -> Option<f64> {
        let prev = self.prev_value.replace(value)?;
        let change = value - prev;
        self.gains.push(change.max(0.0));
        self.losses.push((-change).max(0.0));

        let avg_gain = self.gains.mean()?;
        let avg_loss = self.losses.mean()?;
        if avg_loss == 0.0 {
            return Some(if avg_gain == 0.0 { 50.0 } else { 100.0 });
        }
        let rs = avg_gain / avg_loss;
        Some(100.0 - (100.0 / (1.0 + rs)))
    }
}

#[derive(Debug, Clone)]
struct BollingerBands {
    window: Window,
    num_std_dev: f64,
}

impl BollingerBands {
    fn new(period: usize, num_std_dev: f64) -> Self {
        Self {
            window: Window::new(period),
            num_std_dev,
        }
    }

    /// Returns (middle, upper, lower)
    fn update(&mut self, value: f64) -> Option<(f64, f64, f64)> {
        self.window.push(value);
        if !self.window.is_full() {
            return None;
        }
        let data = Data::new(self.window.values.iter().copied().collect::<Vec<_>>());
        let middle = data.mean().unwrap_or(0.0);
        let std_dev = data.std_dev().unwrap_or(0.0);
        Some((
            middle,
            middle + self.num_std_dev * std_dev,
            middle - self.num_std_dev * std_dev,
        ))
    }
}

#[derive(Debug, Clone)]
struct HighLowWindow {
    highs: Window,
    lows: Window,
}

impl HighLowWindow {
    fn new(period: usize) -> Self {
        Self {
            highs: Window::new(period),
            lows: Window::new(period),
        }
    }

    /// Returns (highest high, lowest low) once full
    fn update(&mut self, high: f64, low: f64) -> Option<(f64, f64)> {
        self.highs.push(high);
        self.lows.push(low);
        if !self.highs.is_full() {
            return None;
        }
        let hh = self.highs.values.iter().fold(f64::MIN, |a, &b| a.max(b));
        let ll = self.lows.values.iter().fold(f64::MAX, |a, &b| a.min(b));
        Some((hh, ll))
    }
}

#[derive(Debug, Clone)]
struct AverageTrueRange {
    tr_values: Window,
    prev_close: Option<f64>,
}

impl AverageTrueRange {
    fn new(period: usize) -> Self {
        Self {
            tr_values: Window::new(period),
            prev_close: None,
        }
    }

    fn update(&mut self, high: f64, low: f64, close: f64) -> Option<f64> {
        let prev_close = self.prev_close.replace(close)?;
        let tr = (high - low)
            .max((high - prev_close).abs())
            .max((low - prev_close).abs());
        self.tr_values.push(tr);
        self.tr_values.mean()
    }
}

#[derive(Debug, Clone)]
struct Cci {
    tp_values: Window,
}

impl Cci {
    fn new(period: usize) -> Self {
        Self {
            tp_values: Window::new(period),
        }
    }

    fn update(&mut self, high: f64, low: f64, close: f64) -> Option<f64> {
        let typical_price = (high + low + close) / 3.0;
        self.tp_values.push(typical_price);
        let sma = self.tp_values.mean()?;
        let mean_deviation = self
            .tp_values
            .values
            .iter()
            .map(|&tp| (tp - sma).abs())
            .sum::<f64>()
            / self.tp_values.size as f64;

        if mean_deviation != 0.0 {
            Some((typical_price - sma) / (0.015 * mean_deviation))
        } else {
            Some(0.0)
        }
    }
}

#[derive(Debug, Clone)]
struct Adx {
    dx_values: Window,
    prev: Option<(f64, f64, f64)>,
}

impl Adx {
    fn new(period: usize) -> Self {
        Self {
            dx_values: Window::new(period),
            prev: None,
        }
    }

    fn update(&mut self, high: f64, low: f64, close: f64) -> Option<f64> {
        let (ph, pl, pc) = self.prev.replace((high, low, close))?;

        let up_move = high - ph;
        let down_move = pl - low;
        let plus_dm = if up_move > down_move && up_move > 0.0 {
            up_move
        } else {
            0.0
        };
        let minus_dm = if down_move > up_move && down_move > 0.0 {
            down_move
        } else {
            0.0
        };

        let tr = (high - low).max((high - pc).abs()).max((low - pc).abs());
        let plus_di = if tr != 0.0 { plus_dm / tr * 100.0 } else { 0.0 };
        let minus_di = if tr != 0.0 { minus_dm / tr * 100.0 } else { 0.0 };

        let di_sum = plus_di + minus_di;
        let dx = if di_sum != 0.0 {
            (plus_di - minus_di).abs() / di_sum * 100.0
        } else {
            0.0
        };

        self.dx_values.push(dx);
        self.dx_values.mean()
    }
}

#[derive(Debug, Clone)]
struct MoneyFlow {
    positive: Window,
    negative: Window,
    prev_typical: Option<f64>,
}

impl MoneyFlow {
    fn new(period: usize) -> Self {
        Self {
            positive: Window::new(period),
            negative: Window::new(period),
            prev_typical: None,
        }
    }

    fn update(&mut self, high: f64, low: f64, close: f64, volume: f64) -> Option<f64> {
        let typical = (high + low + close) / 3.0;
        let prev = self.prev_typical.replace(typical)?;
        let raw = typical * volume;
        self.positive.push(if typical > prev { raw } else { 0.0 });
        self.negative.push(if typical < prev { raw } else { 0.0 });

        let pos = self.positive.sum()?;
        let neg = self.negative.sum()?;
        if neg == 0.0 {
            return Some(if pos == 0.0 { 50.0 } else { 100.0 });
        }
        Some(100.0 - 100.0 / (1.0 + pos / neg))
    }
}

#[derive(Debug, Clone)]
struct Aroon {
    period: usize,
    highs: Window,
    lows: Window,
}

impl Aroon {
    fn new(period: usize) -> Self {
        Self {
            period,
            highs: Window::new(period),
            lows: Window::new(period),
        }
    }

    /// Returns (Aroon Up, Aroon Down)
    fn update(&mut self, high: f64, low: f64) -> Option<(f64, f64)> {
        self.highs.push(high);
        self.lows.push(low);
        if !self.highs.is_full() {
            return None;
        }

        let highest = self.highs.values.iter().fold(f64::MIN, |a, &b| a.max(b));
        let lowest = self.lows.values.iter().fold(f64::MAX, |a, &b| a.min(b));
        let last = self.period - 1;
        let since_high = self
            .highs
            .values
            .iter()
            .rposition(|&h| h == highest)
            .map_or(0, |i| last - i);
        let since_low = self
            .lows
            .values
            .iter()
            .rposition(|&l| l == lowest)
            .map_or(0, |i| last - i);

        let span = last as f64;
        let up = (span - since_high as f64) / span * 100.0;
        let down = (span - since_low as f64) / span * 100.0;
        Some((up, down))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use chrono::{Duration, NaiveDate};

    fn bars(n: usize) -> Vec<PriceBar> {
        let start = NaiveDate::from_ymd_opt(2023, 1, 2).unwrap();
        (0..n)
            .map(|i| {
                let base = 100.0 + (i as f64 * 0.7).sin() * 5.0 + i as f64 * 0.1;
                PriceBar::new(
                    start + Duration::days(i as i64),
                    base,
                    base + 2.0,
                    base - 2.0,
                    base + 0.5,
                    1_000.0 + (i % 7) as f64 * 100.0,
                )
            })
            .collect()
    }

    #[test]
    fn test_warm_up_rows_are_nan() {
        let data = bars(40);
        for spec in default_indicators() {
            let series = spec.compute(&data);
            assert_eq!(series.len(), data.len());
            let lookback = spec.lookback();
            assert!(series[lookback].is_finite(), "{} at lookback", spec.name());
            if lookback > 0 {
                assert!(series[lookback - 1].is_nan(), "{} before lookback", spec.name());
            }
        }
    }

    #[test]
    fn test_values_depend_only_on_lookback_window() {
        let data = bars(60);
        for spec in default_indicators() {
            let full = spec.compute(&data);
            let lookback = spec.lookback();
            // Recompute the last 5 rows from exactly `lookback` context rows
            let start = data.len() - 5 - lookback;
            let partial = spec.compute(&data[start..]);
            for k in 0..5 {
                let a = full[data.len() - 5 + k];
                let b = partial[lookback + k];
                assert_eq!(a.to_bits(), b.to_bits(), "{} row {}", spec.name(), k);
            }
        }
    }

    #[test]
    fn test_rsi_bounds() {
        let data = bars(50);
        let series = IndicatorSpec::Rsi { period: 14 }.compute(&data);
        for v in series.iter().filter(|v| v.is_finite()) {
            assert!(*v >= 0.0 && *v <= 100.0);
        }
    }

    #[test]
    fn test_rate_of_change() {
        let data = bars(12);
        let series = IndicatorSpec::RateOfChange { period: 10 }.compute(&data);
        let expected = (data[10].close / data[0].close - 1.0) * 100.0;
        assert_relative_eq!(series[10], expected, epsilon = 1e-12);
    }

    #[test]
    fn test_flat_prices_stay_finite() {
        let start = NaiveDate::from_ymd_opt(2023, 1, 2).unwrap();
        let flat: Vec<PriceBar> = (0..40)
            .map(|i| PriceBar::new(start + Duration::days(i), 10.0, 10.0, 10.0, 10.0, 0.0))
            .collect();
        for spec in default_indicators() {
            let series = spec.compute(&flat);
            assert!(series[spec.lookback()..].iter().all(|v| v.is_finite()), "{}", spec.name());
        }
    }

    #[test]
    fn test_money_flow_index_extremes() {
        let start = NaiveDate::from_ymd_opt(2023, 1, 2).unwrap();
        let rising: Vec<PriceBar> = (0..10)
            .map(|i| {
                let c = 10.0 + i as f64;
                PriceBar::new(start + Duration::days(i), c, c + 1.0, c - 1.0, c, 500.0)
            })
            .collect();
        let series = IndicatorSpec::MoneyFlowIndex { period: 3 }.compute(&rising);
        assert!(series[2].is_nan());
        assert_relative_eq!(series[3], 100.0);

        let falling: Vec<PriceBar> = rising.iter().rev().cloned().collect();
        let series = IndicatorSpec::MoneyFlowIndex { period: 3 }.compute(&falling);
        assert_relative_eq!(series[9], 0.0);
    }

    #[test]
    fn test_chaikin_money_flow_close_at_high() {
        let start = NaiveDate::from_ymd_opt(2023, 1, 2).unwrap();
        let data: Vec<PriceBar> = (0..6)
            .map(|i| PriceBar::new(start + Duration::days(i), 9.0, 10.0, 8.0, 10.0, 100.0 + i as f64))
            .collect();
        let series = IndicatorSpec::ChaikinMoneyFlow { period: 4 }.compute(&data);
        assert!(series[2].is_nan());
        assert_relative_eq!(series[3], 1.0);
        assert_relative_eq!(series[5], 1.0);
    }

    #[test]
    fn test_donchian_width() {
        let data = bars(30);
        let series = IndicatorSpec::DonchianWidth { period: 10 }.compute(&data);
        let hh = data[10..20].iter().fold(f64::MIN, |a, b| a.max(b.high));
        let ll = data[10..20].iter().fold(f64::MAX, |a, b| a.min(b.low));
        assert_relative_eq!(series[19], (hh - ll) / ((hh + ll) / 2.0) * 100.0, epsilon = 1e-12);
    }

    #[test]
    fn test_close_trend_uses_prior_rows_only() {
        let start = NaiveDate::from_ymd_opt(2023, 1, 2).unwrap();
        let closes = [1.0, 2.0, 3.0, 4.0, 5.0, 100.0, 1.0];
        let data: Vec<PriceBar> = closes
            .iter()
            .enumerate()
            .map(|(i, &c)| PriceBar::new(start + Duration::days(i as i64), c, c, c, c, 1.0))
            .collect();
        let series = IndicatorSpec::CloseTrend { period: 5 }.compute(&data);
        assert!(series[4].is_nan());
        // Rows 0..5 scale to 0, 0.25, .. 1 over x = 0, 1.25, .. 5
        assert_relative_eq!(series[5], 0.2, epsilon = 1e-12);
        assert!(series[6] > 0.0);
    }

    #[test]
    fn test_validate_rejects_zero_period() {
        assert!(IndicatorSpec::Rsi { period: 0 }.validate().is_err());
        assert!(IndicatorSpec::AroonOscillator { period: 1 }.validate().is_err());
        assert!(IndicatorSpec::Rsi { period: 14 }.validate().is_ok());
    }

    #[test]
    fn test_max_lookback() {
        assert_eq!(max_lookback(&default_indicators()), 24);
        assert_eq!(max_lookback(&[]), 0);
    }
}
