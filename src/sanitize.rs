use anyhow::bail;
use serde::{Deserialize, Serialize};

/// Fence settings for IQR trimming.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OutlierPolicy {
    #[serde(default = "default_fence_multiplier")]
    pub fence_multiplier: f64,
    /// Below this many scores the plain mean is returned untouched.
    #[serde(default = "default_min_samples")]
    pub min_samples: usize,
}

impl Default for OutlierPolicy {
    fn default() -> Self {
        Self {
            fence_multiplier: default_fence_multiplier(),
            min_samples: default_min_samples(),
        }
    }
}

impl OutlierPolicy {
    /// Rejects settings that would fence out every score.
    pub fn validate(&self) -> anyhow::Result<()> {
        if !self.fence_multiplier.is_finite() || self.fence_multiplier < 0.0 {
            bail!(
                "fence_multiplier must be a finite number >= 0, got {}",
                self.fence_multiplier
            );
        }
        if self.min_samples < 1 {
            bail!("min_samples must be at least 1");
        }
        Ok(())
    }
}

fn default_fence_multiplier() -> f64 {
    1.5
}

fn default_min_samples() -> usize {
    4
}

pub fn mean(scores: &[f64]) -> f64 {
    if scores.is_empty() {
        return 0.0;
    }
    scores.iter().sum::<f64>() / scores.len() as f64
}

/// Quantile over already sorted values using linear interpolation between
/// the closest ranks.
pub fn quantile(sorted: &[f64], q: f64) -> f64 {
    match sorted.len() {
        0 => 0.0,
        1 => sorted[0],
        len => {
            let position = q.clamp(0.0, 1.0) * (len - 1) as f64;
            let lower = position.floor() as usize;
            let upper = position.ceil() as usize;
            let fraction = position - lower as f64;
            sorted[lower] + (sorted[upper] - sorted[lower]) * fraction
        }
    }
}

/// Mean of `scores` after dropping values outside the Tukey fences.
pub fn sanitized_mean_with(scores: &[f64], policy: &OutlierPolicy) -> f64 {
    if scores.len() < policy.min_samples {
        return mean(scores);
    }

    let mut sorted = scores.to_vec();
    sorted.sort_by(f64::total_cmp);

    let q1 = quantile(&sorted, 0.25);
    let q3 = quantile(&sorted, 0.75);
    let iqr = q3 - q1;
    let lower = q1 - policy.fence_multiplier * iqr;
    let upper = q3 + policy.fence_multiplier * iqr;

    let kept: Vec<f64> = sorted
        .into_iter()
        .filter(|score| *score >= lower && *score <= upper)
        .collect();

    if kept.is_empty() {
        return mean(scores);
    }
    mean(&kept)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sanitized_mean(scores: &[f64]) -> f64 {
        sanitized_mean_with(scores, &OutlierPolicy::default())
    }

    #[test]
    fn short_inputs_use_plain_mean() {
        assert_eq!(sanitized_mean(&[4.5]), 4.5);
        assert!((sanitized_mean(&[4.0, 4.0]) - 4.0).abs() < 1e-9);
        assert!((sanitized_mean(&[1.0, 2.0, 100.0]) - mean(&[1.0, 2.0, 100.0])).abs() < 1e-9);
    }

    #[test]
    fn quartiles_interpolate_linearly() {
        let sorted = [2.0, 3.0, 3.0, 4.0, 20.0];
        assert!((quantile(&sorted, 0.25) - 3.0).abs() < 1e-9);
        assert!((quantile(&sorted, 0.75) - 4.0).abs() < 1e-9);

        let even = [1.0, 2.0, 3.0, 4.0];
        assert!((quantile(&even, 0.25) - 1.75).abs() < 1e-9);
        assert!((quantile(&even, 0.75) - 3.25).abs() < 1e-9);
    }

    #[test]
    fn extreme_score_is_trimmed() {
        let scores = [2.0, 3.0, 3.0, 4.0, 20.0];
        assert!((sanitized_mean(&scores) - 3.0).abs() < 1e-9);
    }

    #[test]
    fn order_does_not_matter() {
        let a = sanitized_mean(&[20.0, 4.0, 3.0, 2.0, 3.0]);
        let b = sanitized_mean(&[2.0, 3.0, 3.0, 4.0, 20.0]);
        assert_eq!(a, b);
    }

    #[test]
    fn kept_scores_stay_inside_fences() {
        let scores = [10.0, 11.0, 12.0, 12.0, 13.0, 14.0, 0.0, 40.0];
        let mut sorted = scores.to_vec();
        sorted.sort_by(f64::total_cmp);
        let q1 = quantile(&sorted, 0.25);
        let q3 = quantile(&sorted, 0.75);
        let iqr = q3 - q1;
        let inside: Vec<f64> = scores
            .iter()
            .copied()
            .filter(|s| *s >= q1 - 1.5 * iqr && *s <= q3 + 1.5 * iqr)
            .collect();
        assert!((sanitized_mean(&scores) - mean(&inside)).abs() < 1e-9);
        assert!(!inside.contains(&40.0));
    }

    #[test]
    fn identical_scores_are_kept() {
        assert!((sanitized_mean(&[3.0, 3.0, 3.0, 3.0, 3.0]) - 3.0).abs() < 1e-9);
    }

    #[test]
    fn empty_fence_window_falls_back_to_full_mean() {
        // A negative multiplier shrinks the window past every point.
        let policy = OutlierPolicy {
            fence_multiplier: -10.0,
            min_samples: 4,
        };
        let scores = [1.0, 2.0, 3.0, 10.0];
        assert!((sanitized_mean_with(&scores, &policy) - mean(&scores)).abs() < 1e-9);
    }

    #[test]
    fn default_policy_is_valid() {
        assert!(OutlierPolicy::default().validate().is_ok());
        let no_fences = OutlierPolicy {
            fence_multiplier: 0.0,
            min_samples: 1,
        };
        assert!(no_fences.validate().is_ok());
    }

    #[test]
    fn fence_multiplier_must_be_finite_and_non_negative() {
        for fence_multiplier in [-1.0, f64::NAN, f64::INFINITY] {
            let policy = OutlierPolicy {
                fence_multiplier,
                min_samples: 4,
            };
            assert!(policy.validate().is_err(), "accepted {fence_multiplier}");
        }
    }

    #[test]
    fn policy_min_samples_is_respected() {
        let policy = OutlierPolicy {
            fence_multiplier: 1.5,
            min_samples: 10,
        };
        let scores = [2.0, 3.0, 3.0, 4.0, 20.0];
        assert!((sanitized_mean_with(&scores, &policy) - 6.4).abs() < 1e-9);
    }
}
