//! Remaining Useful Life predictor (spec §4.8): per-component linear vs
//! exponential degradation fit, extrapolated to warning/critical
//! thresholds.

use crate::config::RulConfig;
use crate::types::{RulModel, RulPrediction, RulStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use statrs::statistics::Statistics;

/// Static per-component metadata: spec.md §4.8 names "a static lookup per
/// component" for repair cost without specifying its shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RulComponentProfile {
    pub component_id: String,
    pub label: String,
    pub unit: String,
    pub warning_score: f64,
    pub critical_score: f64,
    pub cost_per_unit_degradation: f64,
    pub base_repair_cost: f64,
}

pub fn default_component_profiles() -> Vec<RulComponentProfile> {
    vec![
        RulComponentProfile {
            component_id: "oil_pressure".into(),
            label: "Oil Pressure".into(),
            unit: "psi".into(),
            warning_score: 50.0,
            critical_score: 25.0,
            cost_per_unit_degradation: 35.0,
            base_repair_cost: 450.0,
        },
        RulComponentProfile {
            component_id: "coolant_temp_trend".into(),
            label: "Coolant Temperature Trend".into(),
            unit: "degF".into(),
            warning_score: 50.0,
            critical_score: 25.0,
            cost_per_unit_degradation: 40.0,
            base_repair_cost: 900.0,
        },
        RulComponentProfile {
            component_id: "def_level".into(),
            label: "DEF Level".into(),
            unit: "pct".into(),
            warning_score: 50.0,
            critical_score: 25.0,
            cost_per_unit_degradation: 10.0,
            base_repair_cost: 150.0,
        },
        RulComponentProfile {
            component_id: "turbo_pressure".into(),
            label: "Turbo Boost Pressure".into(),
            unit: "psi".into(),
            warning_score: 50.0,
            critical_score: 25.0,
            cost_per_unit_degradation: 60.0,
            base_repair_cost: 2200.0,
        },
        RulComponentProfile {
            component_id: "transmission_temp".into(),
            label: "Transmission Temperature".into(),
            unit: "degF".into(),
            warning_score: 50.0,
            critical_score: 25.0,
            cost_per_unit_degradation: 55.0,
            base_repair_cost: 3200.0,
        },
        RulComponentProfile {
            component_id: "battery".into(),
            label: "Battery Health".into(),
            unit: "pct".into(),
            warning_score: 50.0,
            critical_score: 25.0,
            cost_per_unit_degradation: 8.0,
            base_repair_cost: 220.0,
        },
    ]
}

#[derive(Debug, Clone, Copy)]
pub struct HealthSample {
    pub day_offset: f64,
    pub score: f64,
}

struct FitResult {
    model: RulModel,
    slope_per_day: f64,
    r2: f64,
    predict: fn(f64, f64, f64) -> f64,
    a: f64,
    b: f64,
}

/// Ordinary least squares slope/intercept via `statrs`'s sample
/// covariance/variance (`b = cov(x, y) / var(x)`), plus the coefficient of
/// determination against the fitted line.
fn linear_fit(x: &[f64], y: &[f64]) -> (f64, f64, f64) {
    let mx = x.iter().copied().mean();
    let my = y.iter().copied().mean();
    let sxx = x.iter().copied().variance();
    let sxy = x.iter().copied().covariance(y.iter().copied());
    let b = if sxx.abs() > 1e-12 { sxy / sxx } else { 0.0 };
    let a = my - b * mx;
    let ss_tot: f64 = y.iter().map(|v| (v - my).powi(2)).sum();
    let ss_res: f64 = x.iter().zip(y).map(|(xi, yi)| (yi - (a + b * xi)).powi(2)).sum();
    let r2 = if ss_tot.abs() > 1e-12 { 1.0 - ss_res / ss_tot } else { 0.0 };
    (a, b, r2)
}

/// Fit `y = a * exp(-b * t)` by linearizing: `ln(y) = ln(a) - b*t`. Requires
/// all scores to be strictly positive; caller filters beforehand.
fn exponential_fit(x: &[f64], y: &[f64]) -> Option<(f64, f64, f64)> {
    if y.iter().any(|v| *v <= 0.0) {
        return None;
    }
    let ln_y: Vec<f64> = y.iter().map(|v| v.ln()).collect();
    let (ln_a, neg_b, _) = linear_fit(x, &ln_y);
    let a = ln_a.exp();
    let b = -neg_b;
    let my = y.iter().copied().mean();
    let ss_tot: f64 = y.iter().map(|v| (v - my).powi(2)).sum();
    let ss_res: f64 = x.iter().zip(y).map(|(xi, yi)| (yi - a * (-b * xi).exp()).powi(2)).sum();
    let r2 = if ss_tot.abs() > 1e-12 { 1.0 - ss_res / ss_tot } else { 0.0 };
    Some((a, b, r2))
}

fn fit_best(samples: &[HealthSample]) -> Option<FitResult> {
    let x: Vec<f64> = samples.iter().map(|s| s.day_offset).collect();
    let y: Vec<f64> = samples.iter().map(|s| s.score).collect();

    let (la, lb, lr2) = linear_fit(&x, &y);
    let exp_fit = exponential_fit(&x, &y);

    match exp_fit {
        Some((ea, eb, er2)) if er2 > lr2 => Some(FitResult {
            model: RulModel::Exponential,
            slope_per_day: -eb * ea, // instantaneous slope at t=0, sign matches decay direction
            r2: er2,
            predict: |a, b, t| a * (-b * t).exp(),
            a: ea,
            b: eb,
        }),
        _ => Some(FitResult {
            model: RulModel::Linear,
            slope_per_day: lb,
            r2: lr2,
            predict: |a, b, t| a + b * t,
            a: la,
            b: lb,
        }),
    }
}

/// Find the smallest `t >= 0` at which the fitted curve crosses `threshold`,
/// searching forward in daily steps up to `cfg.max_days`.
fn days_to_threshold(fit: &FitResult, threshold: f64, last_t: f64, cfg: &RulConfig) -> Option<f64> {
    let current = (fit.predict)(fit.a, fit.b, last_t);
    if current <= threshold {
        return Some(0.0);
    }
    let mut t = last_t;
    let step = 0.5;
    while t - last_t <= cfg.max_days {
        t += step;
        let v = (fit.predict)(fit.a, fit.b, t);
        if v <= threshold {
            return Some((t - last_t).min(cfg.max_days));
        }
    }
    None
}

fn status_for(current_score: f64, rul_days: f64, cfg: &RulConfig) -> RulStatus {
    if current_score < cfg.critical_score || rul_days < 14.0 {
        RulStatus::Critical
    } else if current_score < cfg.warning_score || rul_days < 30.0 {
        RulStatus::Warning
    } else {
        RulStatus::Ok
    }
}

/// Fit, extrapolate and classify one component's RUL, or `None` if the
/// trend is too flat/noisy to trust (spec: require `|trend| > 0.01/day` and
/// non-NaN to emit a prediction).
pub fn predict(
    truck_id: &str,
    profile: &RulComponentProfile,
    samples: &[HealthSample],
    avg_daily_miles: f64,
    now: DateTime<Utc>,
    cfg: &RulConfig,
) -> Option<RulPrediction> {
    if samples.len() < 3 {
        return None;
    }
    let fit = fit_best(samples)?;
    if !fit.slope_per_day.is_finite() || fit.slope_per_day.abs() <= cfg.min_trend_per_day {
        return None;
    }

    let last_t = samples.last().map(|s| s.day_offset).unwrap_or(0.0);
    let current_score = (fit.predict)(fit.a, fit.b, last_t);
    if !current_score.is_finite() {
        return None;
    }

    let rul_days = days_to_threshold(&fit, cfg.critical_score, last_t, cfg)
        .or_else(|| days_to_threshold(&fit, cfg.warning_score, last_t, cfg))
        .unwrap_or(cfg.max_days)
        .min(cfg.max_days);

    let rul_miles = rul_days * avg_daily_miles.max(0.0);
    let status = status_for(current_score, rul_days, cfg);
    let estimated_cost = profile.base_repair_cost
        + profile.cost_per_unit_degradation * (100.0 - current_score).max(0.0);
    let service_in_days = (rul_days - cfg.service_lead_days).max(0.0);

    Some(RulPrediction {
        truck_id: truck_id.to_string(),
        component_id: profile.component_id.clone(),
        model: fit.model,
        current_score,
        rul_days,
        rul_miles,
        confidence_r2: fit.r2,
        estimated_cost,
        recommended_service_date: now + chrono::Duration::seconds((service_in_days * 86400.0) as i64),
        status,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn samples_declining(n: usize, start: f64, per_day: f64) -> Vec<HealthSample> {
        (0..n)
            .map(|i| HealthSample { day_offset: i as f64, score: start - per_day * i as f64 })
            .collect()
    }

    #[test]
    fn linear_decline_produces_warning_or_critical() {
        let cfg = RulConfig::default();
        let profile = &default_component_profiles()[0];
        let samples = samples_declining(10, 80.0, 2.0);
        let now = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        let pred = predict("t1", profile, &samples, 300.0, now, &cfg).expect("prediction");
        assert!(pred.rul_days < cfg.max_days);
        assert!(pred.rul_days.is_finite());
        assert!(matches!(pred.status, RulStatus::Warning | RulStatus::Critical | RulStatus::Ok));
    }

    #[test]
    fn flat_trend_emits_no_prediction() {
        let cfg = RulConfig::default();
        let profile = &default_component_profiles()[0];
        let samples: Vec<HealthSample> =
            (0..10).map(|i| HealthSample { day_offset: i as f64, score: 90.0 }).collect();
        let now = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        assert!(predict("t1", profile, &samples, 300.0, now, &cfg).is_none());
    }

    #[test]
    fn exponential_decline_selected_when_better_fit() {
        let cfg = RulConfig::default();
        let profile = &default_component_profiles()[0];
        let samples: Vec<HealthSample> = (0..12)
            .map(|i| HealthSample { day_offset: i as f64, score: 100.0 * (-0.08 * i as f64).exp() })
            .collect();
        let now = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        let pred = predict("t1", profile, &samples, 300.0, now, &cfg).expect("prediction");
        assert_eq!(pred.model, RulModel::Exponential);
    }

    #[test]
    fn critical_score_caps_rul_days_low() {
        let cfg = RulConfig::default();
        let profile = &default_component_profiles()[0];
        let samples = samples_declining(10, 30.0, 1.0);
        let now = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        let pred = predict("t1", profile, &samples, 300.0, now, &cfg).expect("prediction");
        assert_eq!(pred.status, RulStatus::Critical);
    }
}
