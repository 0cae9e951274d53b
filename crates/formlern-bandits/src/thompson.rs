//! Thompson sampling over per-(arm, cluster) posteriors.

use crate::posterior::Posterior;
use crate::store::{CellKey, PosteriorSnapshot};
use formlern_core::{Arm, ClusterId, Context, FeatureKey};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// How contexts are partitioned into posterior cells.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Clustering {
    /// One cell per arm.
    #[default]
    Global,
    /// Cells by readiness band. `edges` must be strictly increasing; cluster
    /// `i` holds readiness values below `edges[i]`, the last cluster the rest.
    ReadinessBands { edges: Vec<f64> },
}

impl Clustering {
    #[must_use]
    pub fn is_valid(&self) -> bool {
        match self {
            Clustering::Global => true,
            Clustering::ReadinessBands { edges } => {
                !edges.is_empty()
                    && edges.len() < usize::from(ClusterId::MAX)
                    && edges.iter().all(|e| e.is_finite())
                    && edges.windows(2).all(|w| w[0] < w[1])
            }
        }
    }
}

/// Samples arm values from a posterior snapshot.
#[derive(Debug, Clone, Default)]
pub struct ThompsonSampler {
    clustering: Clustering,
}

impl ThompsonSampler {
    #[must_use]
    pub fn new(clustering: Clustering) -> Self {
        Self { clustering }
    }

    #[must_use]
    pub fn clustering(&self) -> &Clustering {
        &self.clustering
    }

    /// Features the clustering reads.
    #[must_use]
    pub fn required_features(&self) -> BTreeSet<FeatureKey> {
        match self.clustering {
            Clustering::Global => BTreeSet::new(),
            Clustering::ReadinessBands { .. } => BTreeSet::from([FeatureKey::Readiness]),
        }
    }

    #[must_use]
    pub fn cluster_of(&self, ctx: &Context) -> ClusterId {
        match &self.clustering {
            Clustering::Global => 0,
            Clustering::ReadinessBands { edges } => {
                let Some(readiness) = ctx.number(FeatureKey::Readiness) else {
                    return 0;
                };
                let band = edges.iter().take_while(|e| readiness >= **e).count();
                ClusterId::try_from(band).unwrap_or(ClusterId::MAX)
            }
        }
    }

    #[must_use]
    pub fn key(&self, ctx: &Context, arm: &Arm) -> CellKey {
        CellKey::new(arm.id.clone(), self.cluster_of(ctx))
    }

    /// One posterior draw for `arm`, clamped to `[0, 1]`.
    ///
    /// A cell absent from the snapshot scores a neutral 0.5.
    pub fn score<R: Rng + ?Sized>(
        &self,
        ctx: &Context,
        arm: &Arm,
        snapshot: &PosteriorSnapshot,
        rng: &mut R,
    ) -> f64 {
        let key = self.key(ctx, arm);
        match snapshot.get(&key) {
            Some(posterior) => posterior.sample(rng).clamp(0.0, 1.0),
            None => 0.5,
        }
    }

    /// Conjugate update of one posterior with a normalized reward.
    #[must_use]
    pub fn update(&self, posterior: &Posterior, reward: f64) -> Posterior {
        posterior.updated(reward)
    }
}
