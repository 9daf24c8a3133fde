//! Spend forecasting.
//!
//! Additive model: least-squares linear trend plus a centered weekly seasonal
//! profile estimated from the detrended history. Prediction intervals come from
//! the residual variance of the fit and widen with the square root of the
//! forecast distance.

use crate::aggregator::CostSeries;
use crate::config::ThresholdConfig;
use crate::error::{CostError, Result};
use crate::stats::{LinearFit, mean};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// Seasonal period, in buckets.
pub const SEASONAL_PERIOD: usize = 7;

/// Fewest points accepted for a forecast.
pub const MIN_POINTS: usize = SEASONAL_PERIOD;

/// Seasonality is only estimated with at least two full periods.
const MIN_POINTS_FOR_SEASONALITY: usize = 2 * SEASONAL_PERIOD;

/// Longest accepted forecast horizon, in buckets.
pub const MAX_HORIZON_DAYS: u32 = 365;

/// Two-sided 95% normal quantile.
const Z_95: f64 = 1.96;

/// Relative change over the history that counts as a trend.
const TREND_CHANGE_PCT: f64 = 10.0;

/// Seasonal amplitude, relative to the mean, that counts as seasonality.
const SEASONAL_AMPLITUDE_RATIO: f64 = 0.1;

/// Direction of the fitted trend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TrendDirection {
    /// Rising by more than 10% across the history.
    Increasing,
    /// Falling by more than 10% across the history.
    Decreasing,
    /// Anything in between.
    Stable,
}

/// One forecast step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForecastPoint {
    /// Start of the forecast bucket.
    pub period_start: DateTime<Utc>,
    /// Steps past the last observed bucket (1-based).
    pub step: u32,
    /// Point forecast.
    pub predicted_cost_usd: f64,
    /// Lower 95% bound.
    pub lower_bound: f64,
    /// Upper 95% bound.
    pub upper_bound: f64,
}

impl ForecastPoint {
    /// Width of the prediction interval.
    #[must_use]
    pub fn interval_width(&self) -> f64 {
        self.upper_bound - self.lower_bound
    }
}

/// Optimistic and pessimistic projections.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScenarioForecast {
    /// Per-step compounding rate (residual std dev relative to the mean level).
    pub growth_rate: f64,
    /// Projection shrinking by `growth_rate` per step.
    pub optimistic: Vec<f64>,
    /// Projection growing by `growth_rate` per step.
    pub pessimistic: Vec<f64>,
    /// Sum of the optimistic projection.
    pub optimistic_total_usd: f64,
    /// Sum of the pessimistic projection.
    pub pessimistic_total_usd: f64,
}

/// First forecast step above the daily budget.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BudgetBreach {
    /// Daily budget compared against.
    pub daily_budget_usd: f64,
    /// Start of the first bucket over budget.
    pub first_breach: DateTime<Utc>,
    /// Forecast value of that bucket.
    pub predicted_cost_usd: f64,
    /// Number of forecast buckets over budget.
    pub buckets_over_budget: usize,
}

/// Forecast of one series.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForecastResult {
    /// Dimension key of the forecast series.
    pub series_reference: String,
    /// Number of forecast steps.
    pub horizon_days: u32,
    /// Forecast steps in time order.
    pub points: Vec<ForecastPoint>,
    /// Residual standard deviation of the fit.
    pub residual_std_dev: f64,
    /// Fitted change per bucket.
    pub slope_per_day: f64,
    /// Direction of the trend.
    pub trend: TrendDirection,
    /// Whether a weekly pattern was found.
    pub seasonality_detected: bool,
    /// Centered weekly profile, when estimated.
    pub weekly_profile: Option<Vec<f64>>,
    /// Sum of the point forecasts.
    pub total_projected_cost_usd: f64,
    /// Scenario projections, when requested.
    pub scenarios: Option<ScenarioForecast>,
    /// Budget breach, when a budget is configured and exceeded.
    pub budget_breach: Option<BudgetBreach>,
    /// Per-dimension forecasts, when a breakdown was requested.
    pub breakdowns: Vec<ForecastResult>,
}

impl ForecastResult {
    /// Fraction of forecast steps at or under `daily_limit`.
    #[must_use]
    pub fn compliance(&self, daily_limit: f64) -> f64 {
        if self.points.is_empty() {
            return 1.0;
        }
        let within = self.points.iter().filter(|p| p.predicted_cost_usd <= daily_limit).count();
        within as f64 / self.points.len() as f64
    }
}

/// Trend plus weekly seasonality forecaster.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Forecaster {
    daily_budget: Option<f64>,
}

impl Default for Forecaster {
    fn default() -> Self {
        Self::new(None)
    }
}

impl Forecaster {
    /// Creates a forecaster; `daily_budget` enables breach detection.
    #[must_use]
    pub fn new(daily_budget: Option<f64>) -> Self {
        Self { daily_budget: daily_budget.filter(|b| b.is_finite() && *b > 0.0) }
    }

    /// Uses `daily_cost_alert` as the budget.
    #[must_use]
    pub fn from_config(config: &ThresholdConfig) -> Self {
        Self::new(Some(config.daily_cost_alert))
    }

    /// Forecasts `series` for `horizon_days` steps.
    ///
    /// Each series in `breakdowns` is forecast the same way (without scenarios)
    /// and attached to the result; breakdown series too short to fit are skipped.
    ///
    /// # Errors
    /// Returns `InsufficientData` for fewer than [`MIN_POINTS`] buckets and
    /// `InvalidParameter` for a horizon outside `1..=MAX_HORIZON_DAYS`.
    pub fn forecast(
        &self,
        series: &CostSeries,
        horizon_days: u32,
        breakdowns: &[CostSeries],
        scenario_analysis: bool,
    ) -> Result<ForecastResult> {
        let mut result = self.forecast_one(series, horizon_days, scenario_analysis)?;

        for breakdown in breakdowns {
            match self.forecast_one(breakdown, horizon_days, false) {
                Ok(forecast) => result.breakdowns.push(forecast),
                Err(CostError::InsufficientData { points, .. }) => {
                    debug!(series = %breakdown.dimension_key, points, "Skipping breakdown forecast");
                }
                Err(err) => return Err(err),
            }
        }

        info!(
            series = %result.series_reference,
            horizon_days,
            total = result.total_projected_cost_usd,
            trend = ?result.trend,
            seasonal = result.seasonality_detected,
            breakdowns = result.breakdowns.len(),
            "Forecast complete"
        );
        Ok(result)
    }

    fn forecast_one(
        &self,
        series: &CostSeries,
        horizon_days: u32,
        scenario_analysis: bool,
    ) -> Result<ForecastResult> {
        if !(1..=MAX_HORIZON_DAYS).contains(&horizon_days) {
            return Err(CostError::invalid_parameter("horizon_days", horizon_days));
        }
        let values = series.values();
        let n = values.len();
        let insufficient = || CostError::InsufficientData {
            series: series.dimension_key.clone(),
            points: n,
            required: MIN_POINTS,
        };
        if n < MIN_POINTS {
            return Err(insufficient());
        }
        let fit = LinearFit::fit(&values).ok_or_else(insufficient)?;
        let level = mean(&values).ok_or_else(insufficient)?;

        let profile = (n >= MIN_POINTS_FOR_SEASONALITY).then(|| weekly_profile(&values, &fit));
        let seasonality_detected = profile.as_ref().is_some_and(|p| {
            let (lo, hi) = p.iter().fold((f64::MAX, f64::MIN), |(lo, hi), v| (lo.min(*v), hi.max(*v)));
            level.abs() > 0.0 && (hi - lo) / level.abs() > SEASONAL_AMPLITUDE_RATIO
        });
        let seasonal = |x: usize| profile.as_ref().map_or(0.0, |p| p[x % SEASONAL_PERIOD]);

        let sse: f64 = values
            .iter()
            .enumerate()
            .map(|(i, y)| (y - fit.at(i as f64) - seasonal(i)).powi(2))
            .sum();
        let params = if profile.is_some() { 2 + SEASONAL_PERIOD - 1 } else { 2 };
        let dof = n.saturating_sub(params).max(1);
        let sigma = (sse / dof as f64).sqrt();

        let step_width = match (series.buckets.first(), series.buckets.get(1)) {
            (Some(a), Some(b)) => b.period_start - a.period_start,
            _ => Duration::days(1),
        };
        let last_start = series.buckets.last().map_or_else(Utc::now, |b| b.period_start);

        let points: Vec<ForecastPoint> = (1..=horizon_days)
            .map(|h| {
                let x = n - 1 + h as usize;
                let predicted = fit.at(x as f64) + seasonal(x);
                let half_width = Z_95 * sigma * f64::from(h).sqrt();
                ForecastPoint {
                    period_start: last_start + step_width * h as i32,
                    step: h,
                    predicted_cost_usd: predicted,
                    lower_bound: predicted - half_width,
                    upper_bound: predicted + half_width,
                }
            })
            .collect();

        let total_projected_cost_usd = points.iter().map(|p| p.predicted_cost_usd).sum();
        let scenarios = scenario_analysis.then(|| scenarios(&points, sigma, level));
        let budget_breach = self.daily_budget.and_then(|budget| budget_breach(&points, budget));

        Ok(ForecastResult {
            series_reference: series.dimension_key.clone(),
            horizon_days,
            points,
            residual_std_dev: sigma,
            slope_per_day: fit.slope,
            trend: trend_direction(&fit, level, n),
            seasonality_detected,
            weekly_profile: profile,
            total_projected_cost_usd,
            scenarios,
            budget_breach,
            breakdowns: Vec::new(),
        })
    }
}

fn weekly_profile(values: &[f64], fit: &LinearFit) -> Vec<f64> {
    let mut sums = [0.0; SEASONAL_PERIOD];
    let mut counts = [0usize; SEASONAL_PERIOD];
    for (i, y) in values.iter().enumerate() {
        sums[i % SEASONAL_PERIOD] += y - fit.at(i as f64);
        counts[i % SEASONAL_PERIOD] += 1;
    }
    let means: Vec<f64> = sums
        .iter()
        .zip(counts)
        .map(|(s, c)| if c == 0 { 0.0 } else { s / c as f64 })
        .collect();
    let center = mean(&means).unwrap_or(0.0);
    means.into_iter().map(|m| m - center).collect()
}

fn trend_direction(fit: &LinearFit, level: f64, n: usize) -> TrendDirection {
    if level.abs() == 0.0 {
        return TrendDirection::Stable;
    }
    let change_pct = fit.slope * (n - 1) as f64 / level.abs() * 100.0;
    if change_pct > TREND_CHANGE_PCT {
        TrendDirection::Increasing
    } else if change_pct < -TREND_CHANGE_PCT {
        TrendDirection::Decreasing
    } else {
        TrendDirection::Stable
    }
}

fn scenarios(points: &[ForecastPoint], sigma: f64, level: f64) -> ScenarioForecast {
    let rate = if level > 0.0 { (sigma / level).clamp(0.0, 0.99) } else { 0.0 };
    let (optimistic, pessimistic): (Vec<f64>, Vec<f64>) = points
        .iter()
        .map(|p| {
            let h = i32::try_from(p.step).unwrap_or(i32::MAX);
            (p.predicted_cost_usd * (1.0 - rate).powi(h), p.predicted_cost_usd * (1.0 + rate).powi(h))
        })
        .unzip();
    ScenarioForecast {
        growth_rate: rate,
        optimistic_total_usd: optimistic.iter().sum(),
        pessimistic_total_usd: pessimistic.iter().sum(),
        optimistic,
        pessimistic,
    }
}

fn budget_breach(points: &[ForecastPoint], budget: f64) -> Option<BudgetBreach> {
    let over: Vec<&ForecastPoint> = points.iter().filter(|p| p.predicted_cost_usd > budget).collect();
    let first = over.first()?;
    Some(BudgetBreach {
        daily_budget_usd: budget,
        first_breach: first.period_start,
        predicted_cost_usd: first.predicted_cost_usd,
        buckets_over_budget: over.len(),
    })
}
