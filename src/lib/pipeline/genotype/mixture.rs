//! EM fitting of a K-component binomial / beta-binomial mixture over
//! (alt, depth) pairs.
//!
//! Everything here is a pure function of the counts and the parameters.

use std::time::Instant;

use serde::Serialize;

use super::config::{component_anchors, ClassifierConfig, EmissionModel};
use super::math::{
    log_beta_binomial_kernel, log_binomial_kernel, log_choose, log_sum_exp, optimize_param_gss,
    RHO_MAX, RHO_MIN,
};

/// Overdispersion every beta-binomial component starts from.
pub const INITIAL_DISPERSION: f64 = 0.01;

/// Components with less total responsibility than this keep their parameters.
const MIN_COMPONENT_MASS: f64 = 1e-8;

/// One informative cell at one site.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AlleleDepth {
    pub alt: u32,
    /// ref + alt
    pub depth: u32,
}

/// Parameters of a fitted (or in-progress) mixture.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MixtureModelState {
    pub weights: Vec<f64>,
    /// Mean alternate allele fraction per component
    pub means: Vec<f64>,
    /// Beta-binomial ρ per component, 0 for binomial emission
    pub dispersions: Vec<f64>,
}

/// Why a fit stopped before meeting the tolerance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum NonConvergence {
    IterationCap,
    Timeout,
    NonFinite,
}

/// Result of [`fit_mixture`]: the best iterate seen, whatever the stop reason.
#[derive(Debug, Clone)]
pub struct MixtureFit {
    pub state: MixtureModelState,
    pub log_likelihood: f64,
    pub iterations: usize,
    pub failure: Option<NonConvergence>,
}

impl MixtureModelState {
    /// Means at the clamped anchors, uniform weights.
    pub fn initial(components: usize, emission: EmissionModel, epsilon: f64) -> Self {
        let means: Vec<f64> = component_anchors(components)
            .into_iter()
            .map(|a| a.clamp(epsilon, 1.0 - epsilon))
            .collect();
        let k = means.len();
        let dispersion = match emission {
            EmissionModel::Binomial => 0.0,
            EmissionModel::BetaBinomial => INITIAL_DISPERSION,
        };
        Self {
            weights: vec![1.0 / k as f64; k],
            means,
            dispersions: vec![dispersion; k],
        }
    }

    pub fn components(&self) -> usize {
        self.means.len()
    }

    /// log p(alt | depth, component) without the binomial coefficient.
    #[inline]
    fn log_emission(&self, component: usize, obs: AlleleDepth) -> f64 {
        let p = self.means[component];
        let rho = self.dispersions[component];
        if rho > 0.0 {
            log_beta_binomial_kernel(obs.alt, obs.depth, p, rho)
        } else {
            log_binomial_kernel(obs.alt, obs.depth, p)
        }
    }
}

/// Fill `resp` (row-major, one row of K per observation) with posterior
/// responsibilities and return the data log-likelihood.
pub fn e_step(state: &MixtureModelState, data: &[AlleleDepth], resp: &mut Vec<f64>) -> f64 {
    let k = state.components();
    resp.clear();
    resp.resize(data.len() * k, 0.0);
    let log_weights: Vec<f64> = state.weights.iter().map(|w| w.ln()).collect();
    let mut joint = vec![0.0; k];
    let mut log_likelihood = 0.0;

    for (i, &obs) in data.iter().enumerate() {
        for c in 0..k {
            joint[c] = log_weights[c] + state.log_emission(c, obs);
        }
        let norm = log_sum_exp(&joint);
        log_likelihood += norm + log_choose(obs.alt, obs.depth);
        let row = &mut resp[i * k..(i + 1) * k];
        if norm.is_finite() {
            for c in 0..k {
                row[c] = (joint[c] - norm).exp();
            }
        } else {
            row.fill(1.0 / k as f64);
        }
    }
    log_likelihood
}

/// Update weights, means and (for beta-binomial emission) dispersions from
/// the responsibilities of the last E-step.
pub fn m_step(
    state: &mut MixtureModelState,
    data: &[AlleleDepth],
    resp: &[f64],
    emission: EmissionModel,
    epsilon: f64,
) {
    let k = state.components();
    let n = data.len() as f64;
    if n == 0.0 {
        return;
    }

    for c in 0..k {
        let mut mass = 0.0;
        let mut alt = 0.0;
        let mut depth = 0.0;
        for (i, obs) in data.iter().enumerate() {
            let r = resp[i * k + c];
            mass += r;
            alt += r * obs.alt as f64;
            depth += r * obs.depth as f64;
        }
        state.weights[c] = mass.max(MIN_COMPONENT_MASS) / n;
        if mass < MIN_COMPONENT_MASS || depth <= 0.0 {
            continue;
        }
        state.means[c] = (alt / depth).clamp(epsilon, 1.0 - epsilon);

        if emission == EmissionModel::BetaBinomial {
            let p = state.means[c];
            let objective = |rho: f64| -> f64 {
                data.iter()
                    .enumerate()
                    .map(|(i, obs)| {
                        let r = resp[i * k + c];
                        if r < MIN_COMPONENT_MASS {
                            0.0
                        } else {
                            r * log_beta_binomial_kernel(obs.alt, obs.depth, p, rho)
                        }
                    })
                    .sum()
            };
            let rho = optimize_param_gss(state.dispersions[c], RHO_MIN, RHO_MAX, objective);
            if rho.is_finite() {
                state.dispersions[c] = rho.clamp(RHO_MIN, RHO_MAX);
            }
        }
    }

    let total: f64 = state.weights.iter().sum();
    for w in state.weights.iter_mut() {
        *w /= total;
    }
}

/// Run EM from the anchored initial state until the log-likelihood changes by
/// less than the tolerance, the iteration cap or `deadline` is hit, or the
/// likelihood stops being finite.
pub fn fit_mixture(
    data: &[AlleleDepth],
    config: &ClassifierConfig,
    deadline: Option<Instant>,
) -> MixtureFit {
    let mut state =
        MixtureModelState::initial(config.components, config.emission, config.anchor_epsilon);
    let mut resp = Vec::with_capacity(data.len() * state.components());
    let mut best = MixtureFit {
        state: state.clone(),
        log_likelihood: f64::NEG_INFINITY,
        iterations: 0,
        failure: Some(NonConvergence::IterationCap),
    };
    let mut previous: Option<f64> = None;

    for iteration in 1..=config.em_max_iterations {
        let log_likelihood = e_step(&state, data, &mut resp);
        best.iterations = iteration;
        if !log_likelihood.is_finite() {
            best.failure = Some(NonConvergence::NonFinite);
            return best;
        }
        if log_likelihood > best.log_likelihood {
            best.state = state.clone();
            best.log_likelihood = log_likelihood;
        }
        if let Some(prev) = previous {
            if (log_likelihood - prev).abs() < config.em_tolerance {
                best.failure = None;
                return best;
            }
        }
        if deadline.map_or(false, |d| Instant::now() >= d) {
            best.failure = Some(NonConvergence::Timeout);
            return best;
        }
        m_step(&mut state, data, &resp, config.emission, config.anchor_epsilon);
        previous = Some(log_likelihood);
    }
    best
}
