//! Genotype classifier configuration

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::core::concurrency::determine_allowed_cpus;
use crate::core::error::{Result, ScsnvError};

/// Upper bound on mixture components.
pub const MAX_COMPONENTS: usize = 16;

/// Read-count distribution of one mixture component.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum EmissionModel {
    Binomial,
    /// Binomial with per-component overdispersion ρ
    #[default]
    BetaBinomial,
}

/// Whether each site gets its own model or one model is shared by all sites.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum FitScope {
    #[default]
    PerSite,
    Pooled,
}

/// Configuration for [`GenotypeClassifier`](super::GenotypeClassifier).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassifierConfig {
    /// Number of mixture components (K)
    pub components: usize,
    /// Minimum cells with ref+alt > 0 for a site to be fit
    pub min_cells_per_site: usize,
    pub em_max_iterations: usize,
    /// Convergence threshold on the absolute log-likelihood change
    pub em_tolerance: f64,
    pub emission: EmissionModel,
    pub scope: FitScope,
    /// Component means are kept within [ε, 1-ε]
    pub anchor_epsilon: f64,
    /// Wall-clock budget of one fit
    pub site_timeout: Option<Duration>,
    /// Threads used to fit sites in parallel
    pub threads: usize,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            components: 3,
            min_cells_per_site: 5,
            em_max_iterations: 200,
            em_tolerance: 1e-6,
            emission: EmissionModel::BetaBinomial,
            scope: FitScope::PerSite,
            anchor_epsilon: 0.01,
            site_timeout: None,
            threads: num_cpus::get().clamp(1, 8),
        }
    }
}

impl ClassifierConfig {
    pub fn validate(&self) -> Result<()> {
        if self.components == 0 || self.components > MAX_COMPONENTS {
            return Err(ScsnvError::ThresholdValidation {
                field: "components".to_string(),
                min: 1.0,
                max: MAX_COMPONENTS as f64,
                value: self.components as f64,
            });
        }
        if self.min_cells_per_site == 0 {
            return Err(ScsnvError::Config(
                "min_cells_per_site must be greater than 0".to_string(),
            ));
        }
        if self.em_max_iterations == 0 {
            return Err(ScsnvError::Config(
                "em_max_iterations must be greater than 0".to_string(),
            ));
        }
        if !(self.em_tolerance.is_finite() && self.em_tolerance > 0.0) {
            return Err(ScsnvError::Config(format!(
                "em_tolerance must be a positive number, got {}",
                self.em_tolerance
            )));
        }
        if !(self.anchor_epsilon > 0.0 && self.anchor_epsilon < 0.5) {
            return Err(ScsnvError::ThresholdValidation {
                field: "anchor_epsilon".to_string(),
                min: 0.0,
                max: 0.5,
                value: self.anchor_epsilon,
            });
        }
        determine_allowed_cpus(self.threads)?;
        Ok(())
    }

    /// Evenly spaced anchors k/(K-1), or 0.5 for a single component.
    pub fn anchors(&self) -> Vec<f64> {
        component_anchors(self.components)
    }
}

pub(crate) fn component_anchors(components: usize) -> Vec<f64> {
    if components <= 1 {
        return vec![0.5];
    }
    let last = (components - 1) as f64;
    (0..components).map(|k| k as f64 / last).collect()
}
