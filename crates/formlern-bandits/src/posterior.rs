//! Conjugate reward posteriors.
//!
//! Both models keep additive sufficient statistics, so applying a set of
//! rewards in any order yields the same parameters up to floating-point
//! rounding (see [`ORDER_TOLERANCE`]).

use formlern_core::ArmId;
use rand::Rng;
use rand_distr::{Beta, Distribution, Normal};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

/// Absolute tolerance under which two posteriors built from the same rewards
/// in different orders are considered equal.
pub const ORDER_TOLERANCE: f64 = 1e-9;

/// Which conjugate model the store uses for new cells.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RewardModel {
    /// Beta prior over a fractional success rate.
    #[default]
    BetaBernoulli,
    /// Normal prior over the mean reward with known noise variance.
    NormalNormal,
}

/// Per-arm prior override. Unset fields fall back to the global prior.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct ArmPrior {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alpha0: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub beta0: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mean0: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub precision0: Option<f64>,
}

/// Prior parameters. Versioned configuration, not constants: they decide how
/// aggressively cold arms are explored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PriorConfig {
    pub model: RewardModel,
    pub alpha0: f64,
    pub beta0: f64,
    pub mean0: f64,
    pub precision0: f64,
    pub noise_variance: f64,
    pub per_arm: BTreeMap<ArmId, ArmPrior>,
}

impl Default for PriorConfig {
    fn default() -> Self {
        Self {
            model: RewardModel::BetaBernoulli,
            alpha0: 1.0,
            beta0: 1.0,
            mean0: 0.5,
            precision0: 4.0,
            noise_variance: 0.25,
            per_arm: BTreeMap::new(),
        }
    }
}

impl PriorConfig {
    /// Prior posterior for `arm`.
    #[must_use]
    pub fn prior_for(&self, arm: &ArmId) -> Posterior {
        let o = self.per_arm.get(arm).copied().unwrap_or_default();
        let belief = match self.model {
            RewardModel::BetaBernoulli => Belief::Beta {
                alpha: o.alpha0.unwrap_or(self.alpha0),
                beta: o.beta0.unwrap_or(self.beta0),
            },
            RewardModel::NormalNormal => {
                let precision = o.precision0.unwrap_or(self.precision0);
                Belief::Normal {
                    precision,
                    weighted_sum: precision * o.mean0.unwrap_or(self.mean0),
                    noise_variance: self.noise_variance,
                }
            }
        };
        Posterior {
            belief,
            observations: 0,
        }
    }

    /// Checks that every prior this config can produce is a valid posterior.
    ///
    /// # Errors
    /// The first invalid parameter found.
    pub fn validate(&self) -> Result<(), PosteriorFault> {
        self.prior_for(&ArmId::from("")).check()?;
        for arm in self.per_arm.keys() {
            self.prior_for(arm).check()?;
        }
        Ok(())
    }
}

/// Sufficient statistics of one conjugate model.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "model", rename_all = "snake_case")]
pub enum Belief {
    Beta {
        alpha: f64,
        beta: f64,
    },
    /// Stored in natural parameters: `precision = p0 + n/σ²`,
    /// `weighted_sum = p0·m0 + Σr/σ²`.
    Normal {
        precision: f64,
        weighted_sum: f64,
        noise_variance: f64,
    },
}

/// Invalid statistical state detected on read.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum PosteriorFault {
    #[error("{field} is not finite")]
    NonFinite { field: &'static str },
    #[error("{field} must be positive, got {value}")]
    NonPositive { field: &'static str, value: f64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Posterior {
    pub belief: Belief,
    pub observations: u64,
}

impl Posterior {
    #[must_use]
    pub fn mean(&self) -> f64 {
        match self.belief {
            Belief::Beta { alpha, beta } => alpha / (alpha + beta),
            Belief::Normal {
                precision,
                weighted_sum,
                ..
            } => weighted_sum / precision,
        }
    }

    #[must_use]
    pub fn variance(&self) -> f64 {
        match self.belief {
            Belief::Beta { alpha, beta } => {
                let s = alpha + beta;
                alpha * beta / (s * s * (s + 1.0))
            }
            Belief::Normal { precision, .. } => 1.0 / precision,
        }
    }

    /// # Errors
    /// Non-finite or non-positive parameters.
    pub fn check(&self) -> Result<(), PosteriorFault> {
        match self.belief {
            Belief::Beta { alpha, beta } => {
                positive("alpha", alpha)?;
                positive("beta", beta)
            }
            Belief::Normal {
                precision,
                weighted_sum,
                noise_variance,
            } => {
                positive("precision", precision)?;
                positive("noise_variance", noise_variance)?;
                if weighted_sum.is_finite() {
                    Ok(())
                } else {
                    Err(PosteriorFault::NonFinite {
                        field: "weighted_sum",
                    })
                }
            }
        }
    }

    /// One conjugate update with a reward already normalized to `[0, 1]`.
    ///
    /// Beta cells treat the reward as a fractional success
    /// (`alpha += r`, `beta += 1 - r`).
    #[must_use]
    pub fn updated(&self, reward: f64) -> Posterior {
        let r = if reward.is_finite() {
            reward.clamp(0.0, 1.0)
        } else {
            0.0
        };
        let belief = match self.belief {
            Belief::Beta { alpha, beta } => Belief::Beta {
                alpha: alpha + r,
                beta: beta + (1.0 - r),
            },
            Belief::Normal {
                precision,
                weighted_sum,
                noise_variance,
            } => Belief::Normal {
                precision: precision + 1.0 / noise_variance,
                weighted_sum: weighted_sum + r / noise_variance,
                noise_variance,
            },
        };
        Posterior {
            belief,
            observations: self.observations.saturating_add(1),
        }
    }

    /// Draws one value from the posterior over the mean reward.
    ///
    /// Normal draws may leave `[0, 1]`; callers blending with rule scores
    /// clamp. Invalid parameters yield the mean instead of panicking.
    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> f64 {
        match self.belief {
            Belief::Beta { alpha, beta } => match Beta::new(alpha, beta) {
                Ok(dist) => dist.sample(rng),
                Err(_) => self.mean(),
            },
            Belief::Normal { precision, .. } => match Normal::new(self.mean(), precision.recip().sqrt()) {
                Ok(dist) => dist.sample(rng),
                Err(_) => self.mean(),
            },
        }
    }

    /// Whether two posteriors agree within [`ORDER_TOLERANCE`].
    #[must_use]
    pub fn approx_eq(&self, other: &Posterior) -> bool {
        let close = |a: f64, b: f64| (a - b).abs() <= ORDER_TOLERANCE;
        self.observations == other.observations
            && match (self.belief, other.belief) {
                (Belief::Beta { alpha: a1, beta: b1 }, Belief::Beta { alpha: a2, beta: b2 }) => {
                    close(a1, a2) && close(b1, b2)
                }
                (
                    Belief::Normal {
                        precision: p1,
                        weighted_sum: w1,
                        noise_variance: n1,
                    },
                    Belief::Normal {
                        precision: p2,
                        weighted_sum: w2,
                        noise_variance: n2,
                    },
                ) => close(p1, p2) && close(w1, w2) && close(n1, n2),
                _ => false,
            }
    }
}

fn positive(field: &'static str, value: f64) -> Result<(), PosteriorFault> {
    if !value.is_finite() {
        return Err(PosteriorFault::NonFinite { field });
    }
    if value <= 0.0 {
        return Err(PosteriorFault::NonPositive { field, value });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn beta_prior() -> Posterior {
        PriorConfig::default().prior_for(&ArmId::from("a"))
    }

    fn normal_prior() -> Posterior {
        PriorConfig {
            model: RewardModel::NormalNormal,
            ..PriorConfig::default()
        }
        .prior_for(&ArmId::from("a"))
    }

    #[test]
    fn beta_update_is_fractional() {
        let p = beta_prior().updated(0.75);
        assert_eq!(
            p.belief,
            Belief::Beta {
                alpha: 1.75,
                beta: 1.25
            }
        );
        assert_eq!(p.observations, 1);
    }

    #[test]
    fn normal_update_moves_mean_towards_reward() {
        let prior = normal_prior();
        let p = prior.updated(1.0).updated(1.0);
        assert!(p.mean() > prior.mean());
        assert!(p.variance() < prior.variance());
    }

    #[test]
    fn updates_commute_within_tolerance() {
        let rewards = [0.13, 0.97, 0.5, 0.0, 1.0, 0.333];
        for prior in [beta_prior(), normal_prior()] {
            let forward = rewards.iter().fold(prior, |p, r| p.updated(*r));
            let backward = rewards.iter().rev().fold(prior, |p, r| p.updated(*r));
            assert!(forward.approx_eq(&backward));
        }
    }

    #[test]
    fn out_of_range_rewards_are_clamped() {
        let p = beta_prior().updated(4.0).updated(f64::NAN);
        assert_eq!(
            p.belief,
            Belief::Beta {
                alpha: 2.0,
                beta: 2.0
            }
        );
    }

    #[test]
    fn check_detects_corruption() {
        let bad = Posterior {
            belief: Belief::Beta {
                alpha: -1.0,
                beta: 1.0,
            },
            observations: 3,
        };
        assert!(matches!(
            bad.check(),
            Err(PosteriorFault::NonPositive { field: "alpha", .. })
        ));
        let nan = Posterior {
            belief: Belief::Normal {
                precision: 1.0,
                weighted_sum: f64::NAN,
                noise_variance: 0.25,
            },
            observations: 0,
        };
        assert!(nan.check().is_err());
    }

    #[test]
    fn seeded_sampling_is_reproducible() {
        let p = beta_prior().updated(1.0);
        let a = p.sample(&mut StdRng::seed_from_u64(7));
        let b = p.sample(&mut StdRng::seed_from_u64(7));
        assert!((a - b).abs() < f64::EPSILON);
        assert!((0.0..=1.0).contains(&a));
    }

    #[test]
    fn per_arm_prior_overrides_global() {
        let mut cfg = PriorConfig::default();
        cfg.per_arm.insert(
            ArmId::from("rest"),
            ArmPrior {
                alpha0: Some(3.0),
                ..ArmPrior::default()
            },
        );
        let p = cfg.prior_for(&ArmId::from("rest"));
        assert_eq!(p.belief, Belief::Beta { alpha: 3.0, beta: 1.0 });
        assert!(cfg.validate().is_ok());
    }
}
