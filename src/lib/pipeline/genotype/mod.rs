//! Per-site genotype mixture models over allele count matrices.
//!
//! Each site's informative cells (ref + alt > 0) are fit with a K-component
//! binomial or beta-binomial mixture by EM, and every cell with evidence gets
//! a posterior over the components.

pub mod classifier;
pub mod config;
pub mod math;
pub mod mixture;

pub use classifier::{
    GenotypeCall, GenotypeCalls, GenotypeClass, GenotypeClassifier, SiteReport, SiteStatus,
    UnclassifiableReason,
};
pub use config::{ClassifierConfig, EmissionModel, FitScope};
pub use mixture::{fit_mixture, AlleleDepth, MixtureFit, MixtureModelState, NonConvergence};
