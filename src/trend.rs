//! Trend statistics over a branch's coverage history.
//!
//! Everything here is a pure function of the records in the analysis
//! window: summary aggregates, a least-squares short-term trend, volatility,
//! momentum and a clamped forecast with a confidence score.

// Statistical computations intentionally cast int→float.
#![allow(clippy::cast_precision_loss)]

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::cancel::CancellationToken;
use crate::error::Result;
use crate::model::HistoryRecord;
use crate::store::HistoryStore;

/// Below this projected change over the window (percentage points) the
/// short-term trend is reported as stable.
const DEAD_BAND: f64 = 0.5;

/// Fewer entries than this yield no forecast and zero confidence.
const MIN_FORECAST_ENTRIES: usize = 3;

/// Entries needed before the small-sample confidence penalty disappears.
const FULL_CONFIDENCE_ENTRIES: usize = 10;

const MILLIS_PER_DAY: f64 = 86_400_000.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Up,
    Down,
    #[default]
    Stable,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Up => "up",
            Direction::Down => "down",
            Direction::Stable => "stable",
        }
    }
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrendSummary {
    pub total_entries: usize,
    pub average_percentage: f64,
    pub min_percentage: f64,
    pub max_percentage: f64,
    pub current_trend: Direction,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ShortTermTrend {
    pub direction: Direction,
    /// Fitted change over the window, in percentage points.
    pub change_percent: f64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Range {
    pub min: f64,
    pub max: f64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Forecast {
    pub percentage: f64,
    pub range: Range,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Prediction {
    pub next_week: Forecast,
    pub next_month: Forecast,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrendAnalysis {
    /// Population standard deviation of the percentages.
    pub volatility: f64,
    /// Mean change between consecutive entries.
    pub momentum: f64,
    pub short_term_trend: ShortTermTrend,
    /// Absent when there are too few entries to extrapolate.
    pub prediction: Option<Prediction>,
    /// 0–100.
    pub confidence: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Trend {
    pub window_days: u32,
    pub summary: TrendSummary,
    pub analysis: TrendAnalysis,
}

/// Runs [`analyze`] over a branch's stored history.
#[derive(Debug, Clone, Copy)]
pub struct TrendAnalyzer<'a> {
    store: &'a HistoryStore,
}

impl<'a> TrendAnalyzer<'a> {
    pub fn new(store: &'a HistoryStore) -> Self {
        Self { store }
    }

    /// Trend over the last `days` days of `branch` (0 = all history). An
    /// empty branch is not an error; store failures propagate unchanged.
    pub fn get_trend(&self, branch: &str, days: u32, cancel: &CancellationToken) -> Result<Trend> {
        let records = self.store.query(branch, days, cancel)?.collect_records()?;
        Ok(analyze(&records, days))
    }
}

/// Compute the trend over `records` (any order). `window_days` scales the
/// short-term change; 0 means the span actually covered by the records.
#[must_use]
pub fn analyze(records: &[HistoryRecord], window_days: u32) -> Trend {
    let mut points: Vec<(DateTime<Utc>, f64)> = records
        .iter()
        .map(|r| (r.timestamp(), r.percentage()))
        .collect();
    // Producers' clocks disagree; never trust input order.
    points.sort_by(|a, b| a.0.cmp(&b.0));

    if points.is_empty() {
        return Trend {
            window_days,
            ..Trend::default()
        };
    }

    let values: Vec<f64> = points.iter().map(|p| p.1).collect();
    let first = points[0].0;
    let days: Vec<f64> = points
        .iter()
        .map(|(ts, _)| (*ts - first).num_milliseconds() as f64 / MILLIS_PER_DAY)
        .collect();

    let summary = summarize(&values);

    let window = if window_days > 0 {
        f64::from(window_days)
    } else {
        days.last().copied().unwrap_or(0.0)
    };
    let slope = linear_slope(&days, &values);
    let change_percent = slope * window;
    let short_term_trend = ShortTermTrend {
        direction: if change_percent.abs() < DEAD_BAND {
            Direction::Stable
        } else if change_percent > 0.0 {
            Direction::Up
        } else {
            Direction::Down
        },
        change_percent,
    };

    let volatility = population_std_dev(&values);
    let momentum = mean_step(&values);

    let (prediction, confidence) = if values.len() < MIN_FORECAST_ENTRIES {
        (None, 0.0)
    } else {
        let last = values[values.len() - 1];
        let forecast = |horizon_days: f64| {
            let percentage = clamp_percentage(last + slope * horizon_days);
            Forecast {
                percentage,
                range: Range {
                    min: clamp_percentage(percentage - volatility),
                    max: clamp_percentage(percentage + volatility),
                },
            }
        };
        let shortfall = FULL_CONFIDENCE_ENTRIES.saturating_sub(values.len()) as f64;
        let confidence = (100.0 - volatility * 10.0 - shortfall * 5.0).clamp(0.0, 100.0);
        (
            Some(Prediction {
                next_week: forecast(7.0),
                next_month: forecast(30.0),
            }),
            confidence,
        )
    };

    Trend {
        window_days,
        summary,
        analysis: TrendAnalysis {
            volatility,
            momentum,
            short_term_trend,
            prediction,
            confidence,
        },
    }
}

fn summarize(values: &[f64]) -> TrendSummary {
    let n = values.len();
    let current_trend = match values {
        [.., prev, last] if last > prev => Direction::Up,
        [.., prev, last] if last < prev => Direction::Down,
        _ => Direction::Stable,
    };
    TrendSummary {
        total_entries: n,
        average_percentage: mean(values),
        min_percentage: values.iter().copied().fold(f64::INFINITY, f64::min),
        max_percentage: values.iter().copied().fold(f64::NEG_INFINITY, f64::max),
        current_trend,
    }
}

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        0.0
    } else {
        values.iter().sum::<f64>() / values.len() as f64
    }
}

/// Least-squares slope of `ys` against `xs`; 0 when `xs` has no spread.
fn linear_slope(xs: &[f64], ys: &[f64]) -> f64 {
    if xs.len() < 2 {
        return 0.0;
    }
    let x_mean = mean(xs);
    let y_mean = mean(ys);
    let (num, den) = xs
        .iter()
        .zip(ys)
        .fold((0.0, 0.0), |(num, den), (x, y)| {
            let dx = x - x_mean;
            (num + dx * (y - y_mean), den + dx * dx)
        });
    if den <= f64::EPSILON {
        0.0
    } else {
        num / den
    }
}

fn population_std_dev(values: &[f64]) -> f64 {
    if values.len() < 2 {
        return 0.0;
    }
    let m = mean(values);
    let variance = values.iter().map(|v| (v - m).powi(2)).sum::<f64>() / values.len() as f64;
    variance.sqrt()
}

fn mean_step(values: &[f64]) -> f64 {
    if values.len() < 2 {
        return 0.0;
    }
    let steps: Vec<f64> = values.windows(2).map(|w| w[1] - w[0]).collect();
    mean(&steps)
}

fn clamp_percentage(value: f64) -> f64 {
    value.clamp(0.0, 100.0)
}
