//! Return statistics over per-period log-returns.
//!
//! Every function is pure and total: empty input is legal, denominators are
//! floored before dividing, and nothing here can yield NaN or infinity.

#[derive(Debug, Clone)]
pub struct MetricsConfig {
    /// Periods per year; returns are per-period log-returns.
    pub annualization_factor: f64,
    /// Minimum annualized volatility used as a sharpe denominator.
    pub volatility_floor: f64,
    /// Minimum annualized downside deviation used as a sortino denominator.
    pub downside_floor: f64,
    /// Stand-in loss mass when a return series has gains but no losses.
    pub omega_loss_floor: f64,
    /// Sharpe assigned to a uniformly flat series. Negative: reporting no
    /// activity scores worse than reporting honest losses of confidence.
    pub flat_penalty: f64,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            annualization_factor: 365.0,
            volatility_floor: 0.05,
            downside_floor: 0.05,
            omega_loss_floor: 0.01,
            flat_penalty: -1.0,
        }
    }
}

/// Sum of log-returns. 0.0 for an empty series.
pub fn base_return(returns: &[f64]) -> f64 {
    returns.iter().sum()
}

/// Gain mass above the threshold over loss mass below it.
pub fn omega(returns: &[f64], threshold: f64, cfg: &MetricsConfig) -> f64 {
    let mut gains = 0.0;
    let mut losses = 0.0;
    for &r in returns {
        if r > threshold {
            gains += r - threshold;
        } else if r < threshold {
            losses += threshold - r;
        }
    }
    if gains == 0.0 {
        return 0.0;
    }
    if losses == 0.0 {
        return gains / cfg.omega_loss_floor;
    }
    gains / losses
}

/// Annualized mean over annualized standard deviation (ddof = 1).
pub fn sharpe(returns: &[f64], cfg: &MetricsConfig) -> f64 {
    if returns.len() < 2 {
        return 0.0;
    }
    if returns.iter().all(|&r| r == 0.0) {
        return cfg.flat_penalty;
    }
    let ann_mean = mean(returns) * cfg.annualization_factor;
    let ann_vol = (sample_std(returns) * cfg.annualization_factor.sqrt()).max(cfg.volatility_floor);
    ann_mean / ann_vol
}

/// Annualized mean over annualized downside deviation.
pub fn sortino(returns: &[f64], cfg: &MetricsConfig) -> f64 {
    if returns.is_empty() {
        return 0.0;
    }
    let ann_mean = mean(returns) * cfg.annualization_factor;
    let n = returns.len() as f64;
    let downside_var = returns.iter().map(|&r| if r < 0.0 { r * r } else { 0.0 }).sum::<f64>() / n;
    let ann_downside =
        (downside_var.sqrt() * cfg.annualization_factor.sqrt()).max(cfg.downside_floor);
    ann_mean / ann_downside
}

fn mean(values: &[f64]) -> f64 {
    values.iter().sum::<f64>() / values.len() as f64
}

fn sample_std(values: &[f64]) -> f64 {
    let m = mean(values);
    let var = values.iter().map(|v| (v - m) * (v - m)).sum::<f64>() / (values.len() - 1) as f64;
    var.sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> MetricsConfig {
        MetricsConfig::default()
    }

    #[test]
    fn empty_series_all_zero() {
        assert_eq!(base_return(&[]), 0.0);
        assert_eq!(omega(&[], 0.0, &cfg()), 0.0);
        assert_eq!(sharpe(&[], &cfg()), 0.0);
        assert_eq!(sortino(&[], &cfg()), 0.0);
    }

    #[test]
    fn base_return_signs() {
        assert!(base_return(&[-0.2, -0.1, -0.3, -0.2, -0.1, -0.3]) < 0.0);
        assert!(base_return(&[0.2, 0.1, 0.3, 0.2, 0.1, 0.3]) > 0.0);
    }

    #[test]
    fn omega_all_negative_is_zero() {
        assert_eq!(omega(&[-0.2, -0.1, -0.3, -0.2, -0.1, -0.3], 0.0, &cfg()), 0.0);
    }

    #[test]
    fn omega_mixed_is_positive() {
        let o = omega(&[0.2, -0.1, 0.3, -0.2, 0.1, 0.3], 0.0, &cfg());
        assert!(o > 0.0);
    }

    #[test]
    fn omega_without_losses_is_finite() {
        let o = omega(&[0.2, 0.1, 0.3, 0.2, 0.1, 0.3], 0.0, &cfg());
        assert!(o > 0.0);
        assert!(o.is_finite());
        let with_small_loss = omega(&[0.2, 0.1, 0.3, 0.2, 0.1, 0.3, -0.01], 0.0, &cfg());
        assert!(with_small_loss.is_finite());
    }

    #[test]
    fn sharpe_positive_for_positive_returns() {
        let s = sharpe(&[0.02, 0.01, 0.03, 0.02, 0.01, 0.03], &cfg());
        assert!(s > 0.0);
    }

    #[test]
    fn sharpe_negative_for_negative_returns() {
        let s = sharpe(&[-0.001; 5], &cfg());
        assert!(s < 0.0);
        assert!(s > -10.0);
    }

    #[test]
    fn sharpe_flat_series_is_penalized() {
        let s = sharpe(&[0.0; 6], &cfg());
        assert!(s < 0.0);
    }

    #[test]
    fn sharpe_single_value_is_zero() {
        assert_eq!(sharpe(&[0.05], &cfg()), 0.0);
    }

    #[test]
    fn sharpe_small_positive_series_bounded() {
        let s = sharpe(&[0.001; 5], &cfg());
        assert!(s > 0.0);
        assert!(s < 10.0);
    }

    #[test]
    fn sharpe_full_year_bounded() {
        let daily = vec![0.05 / 365.0; 365];
        let s = sharpe(&daily, &cfg());
        assert!(s > 0.0);
        assert!(s < 10.0);
    }

    #[test]
    fn steady_returns_beat_one_lucky_swing() {
        // Same total return, radically different consistency.
        let steady = vec![0.02; 10];
        let mut swing = vec![0.001; 9];
        swing.push(0.2 - 0.001 * 9.0);
        assert!((base_return(&steady) - base_return(&swing)).abs() < 1e-9);
        assert!(sharpe(&steady, &cfg()) > sharpe(&swing, &cfg()));
        assert!((omega(&steady, 0.0, &cfg()) - omega(&swing, 0.0, &cfg())).abs() < 1e-9);
    }

    #[test]
    fn sortino_sign_follows_mean() {
        assert!(sortino(&[0.2, 0.1, 0.3, -0.2, 0.1, -0.3], &cfg()) > 0.0);
        assert!(sortino(&[-0.2, -0.1, -0.3, -0.2, -0.1, -0.3], &cfg()) < 0.0);
        assert!(sortino(&[0.05], &cfg()) > 0.0);
    }

    #[test]
    fn all_outputs_finite() {
        let series: [&[f64]; 5] =
            [&[], &[0.0; 4], &[0.5; 3], &[-0.5; 3], &[0.1, -0.1, 0.2, -0.2]];
        for s in series {
            assert!(omega(s, 0.0, &cfg()).is_finite());
            assert!(sharpe(s, &cfg()).is_finite());
            assert!(sortino(s, &cfg()).is_finite());
        }
    }
}
