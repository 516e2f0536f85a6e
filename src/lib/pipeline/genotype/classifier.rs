//! Per-cell genotype calls from allele count matrices

use std::time::Instant;

use itertools::Itertools;
use log::*;
use nalgebra_sparse::CsrMatrix;
use rayon::prelude::*;
use serde::Serialize;
use smallvec::SmallVec;

use super::config::{component_anchors, ClassifierConfig, FitScope};
use super::mixture::{e_step, fit_mixture, AlleleDepth, MixtureFit, MixtureModelState, NonConvergence};
use crate::core::concurrency::build_thread_pool;
use crate::core::error::{Result, ScsnvError};
use crate::core::sparse::SparseOps;
use crate::pipeline::snvmat::AlleleMatrices;

/// Genotype implied by a component's anchor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum GenotypeClass {
    HomRef,
    Het,
    HomAlt,
}

impl GenotypeClass {
    pub fn from_anchor(anchor: f64) -> Self {
        if anchor < 0.25 {
            GenotypeClass::HomRef
        } else if anchor > 0.75 {
            GenotypeClass::HomAlt
        } else {
            GenotypeClass::Het
        }
    }
}

/// Posterior genotype of one cell at one site.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GenotypeCall {
    pub cell: u32,
    pub site: u32,
    /// Most probable component (lowest index on ties)
    pub component: usize,
    pub class: GenotypeClass,
    /// Responsibility of every component, sums to 1
    pub posteriors: SmallVec<[f64; 4]>,
    /// Largest posterior
    pub confidence: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum UnclassifiableReason {
    /// No cell has any count at the site
    NoEvidence,
    TooFewCells { observed: usize, required: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SiteStatus {
    Converged { iterations: usize },
    /// Calls were still made from the best iterate
    DidNotConverge {
        reason: NonConvergence,
        iterations: usize,
    },
    Unclassifiable(UnclassifiableReason),
}

impl SiteStatus {
    fn from_fit(fit: &MixtureFit) -> Self {
        match fit.failure {
            None => SiteStatus::Converged {
                iterations: fit.iterations,
            },
            Some(reason) => SiteStatus::DidNotConverge {
                reason,
                iterations: fit.iterations,
            },
        }
    }

    pub fn is_classified(&self) -> bool {
        !matches!(self, SiteStatus::Unclassifiable(_))
    }
}

/// Fit outcome for one site.
#[derive(Debug, Clone, Serialize)]
pub struct SiteReport {
    pub site: u32,
    /// Cells with ref + alt > 0
    pub informative_cells: usize,
    pub status: SiteStatus,
    /// Site-specific model (per-site scope only)
    pub model: Option<MixtureModelState>,
    pub log_likelihood: Option<f64>,
}

/// Classifier output: calls sorted by (cell, site) and one report per site.
#[derive(Debug, Clone, Serialize)]
pub struct GenotypeCalls {
    pub calls: Vec<GenotypeCall>,
    pub sites: Vec<SiteReport>,
    /// Shared model (pooled scope only)
    pub pooled_model: Option<MixtureModelState>,
}

impl GenotypeCalls {
    pub fn calls_for_site(&self, site: u32) -> impl Iterator<Item = &GenotypeCall> {
        self.calls.iter().filter(move |c| c.site == site)
    }

    pub fn classified_sites(&self) -> usize {
        self.sites.iter().filter(|s| s.status.is_classified()).count()
    }
}

/// Counts of one cell at one site.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct CellEvidence {
    cell: u32,
    ref_count: u32,
    alt: u32,
    other: u32,
}

impl CellEvidence {
    fn depth(&self) -> u32 {
        self.ref_count.saturating_add(self.alt)
    }
}

/// Site-major views of the channel matrices.
struct SiteMajor {
    ref_t: CsrMatrix<u32>,
    alt_t: CsrMatrix<u32>,
    other_t: Option<CsrMatrix<u32>>,
}

impl SiteMajor {
    /// Evidence of every cell with a non-zero count at `site`, in cell order.
    fn evidence(&self, site: usize) -> Vec<CellEvidence> {
        let row_entries = |m: &CsrMatrix<u32>, channel: usize| {
            let row = m.row(site);
            row.col_indices()
                .iter()
                .zip(row.values())
                .map(move |(&cell, &count)| (cell as u32, channel, count))
                .collect::<Vec<_>>()
        };
        let mut rows = vec![row_entries(&self.ref_t, 0), row_entries(&self.alt_t, 1)];
        if let Some(other) = &self.other_t {
            rows.push(row_entries(other, 2));
        }

        let mut out: Vec<CellEvidence> = Vec::new();
        for (cell, channel, count) in rows.into_iter().kmerge_by(|a, b| a.0 < b.0) {
            if out.last().map_or(true, |e| e.cell != cell) {
                out.push(CellEvidence {
                    cell,
                    ref_count: 0,
                    alt: 0,
                    other: 0,
                });
            }
            if let Some(entry) = out.last_mut() {
                match channel {
                    0 => entry.ref_count = count,
                    1 => entry.alt = count,
                    _ => entry.other = count,
                }
            }
        }
        out
    }
}

/// Fits genotype mixtures to allele count matrices.
#[derive(Debug, Clone)]
pub struct GenotypeClassifier {
    config: ClassifierConfig,
    classes: Vec<GenotypeClass>,
}

impl GenotypeClassifier {
    pub fn new(config: ClassifierConfig) -> Result<Self> {
        config.validate()?;
        let classes = component_anchors(config.components)
            .into_iter()
            .map(GenotypeClass::from_anchor)
            .collect();
        Ok(Self { config, classes })
    }

    pub fn config(&self) -> &ClassifierConfig {
        &self.config
    }

    /// Class of each component, in component order.
    pub fn component_classes(&self) -> &[GenotypeClass] {
        &self.classes
    }

    pub fn classify(&self, matrices: &AlleleMatrices) -> Result<GenotypeCalls> {
        self.classify_counts(
            &matrices.ref_counts,
            &matrices.alt_counts,
            matrices.other_counts.as_ref(),
        )
    }

    /// Classify from cell × site ref / alt (and optional other) count matrices.
    pub fn classify_counts(
        &self,
        ref_counts: &CsrMatrix<u32>,
        alt_counts: &CsrMatrix<u32>,
        other_counts: Option<&CsrMatrix<u32>>,
    ) -> Result<GenotypeCalls> {
        let shape = (ref_counts.nrows(), ref_counts.ncols());
        for m in std::iter::once(alt_counts).chain(other_counts) {
            if (m.nrows(), m.ncols()) != shape {
                return Err(ScsnvError::DimensionMismatch {
                    expected: format!("{}×{}", shape.0, shape.1),
                    actual: format!("{}×{}", m.nrows(), m.ncols()),
                });
            }
        }
        let n_sites = shape.1;
        info!(
            "Classifying {} cells × {} sites with {} components ({:?}, {:?})",
            shape.0, n_sites, self.config.components, self.config.emission, self.config.scope
        );

        let pool = build_thread_pool(self.config.threads)?;
        let site_major = SiteMajor {
            ref_t: SparseOps::transpose_u32(ref_counts),
            alt_t: SparseOps::transpose_u32(alt_counts),
            other_t: other_counts.map(SparseOps::transpose_u32),
        };

        let (mut calls, sites, pooled_model) = pool.install(|| match self.config.scope {
            FitScope::PerSite => {
                let per_site: Vec<(SiteReport, Vec<GenotypeCall>)> = (0..n_sites)
                    .into_par_iter()
                    .map(|site| self.classify_site(site as u32, &site_major.evidence(site)))
                    .collect();
                let (sites, calls): (Vec<_>, Vec<_>) = per_site.into_iter().unzip();
                (calls.into_iter().flatten().collect::<Vec<_>>(), sites, None)
            }
            FitScope::Pooled => self.classify_pooled(&site_major, n_sites),
        });

        calls.par_sort_unstable_by_key(|c| (c.cell, c.site));
        let not_converged = sites
            .iter()
            .filter(|s| matches!(s.status, SiteStatus::DidNotConverge { .. }))
            .count();
        let classified = sites.iter().filter(|s| s.status.is_classified()).count();
        info!(
            "Emitted {} calls over {} classified sites ({} unclassifiable, {} not converged)",
            calls.len(),
            classified,
            n_sites - classified,
            not_converged
        );

        Ok(GenotypeCalls {
            calls,
            sites,
            pooled_model,
        })
    }

    fn deadline(&self) -> Option<Instant> {
        self.config.site_timeout.map(|t| Instant::now() + t)
    }

    /// `Some(reason)` when the site has too little evidence to fit.
    fn unclassifiable(&self, evidence: &[CellEvidence]) -> Option<UnclassifiableReason> {
        if evidence.is_empty() {
            return Some(UnclassifiableReason::NoEvidence);
        }
        let observed = evidence.iter().filter(|e| e.depth() > 0).count();
        let required = self.config.min_cells_per_site;
        (observed < required).then_some(UnclassifiableReason::TooFewCells { observed, required })
    }

    fn informative(evidence: &[CellEvidence]) -> Vec<AlleleDepth> {
        evidence
            .iter()
            .filter(|e| e.depth() > 0)
            .map(|e| AlleleDepth {
                alt: e.alt,
                depth: e.depth(),
            })
            .collect()
    }

    fn classify_site(&self, site: u32, evidence: &[CellEvidence]) -> (SiteReport, Vec<GenotypeCall>) {
        let informative_cells = evidence.iter().filter(|e| e.depth() > 0).count();
        if let Some(reason) = self.unclassifiable(evidence) {
            trace!("Site {} unclassifiable: {:?}", site, reason);
            let report = SiteReport {
                site,
                informative_cells,
                status: SiteStatus::Unclassifiable(reason),
                model: None,
                log_likelihood: None,
            };
            return (report, Vec::new());
        }

        let data = Self::informative(evidence);
        let fit = fit_mixture(&data, &self.config, self.deadline());
        let status = SiteStatus::from_fit(&fit);
        if let SiteStatus::DidNotConverge { reason, iterations } = status {
            warn!(
                "Site {} did not converge ({:?} after {} iterations); using best iterate",
                site, reason, iterations
            );
        }
        let calls = self.calls_for(site, evidence, &fit.state);
        let report = SiteReport {
            site,
            informative_cells,
            status,
            model: Some(fit.state),
            log_likelihood: Some(fit.log_likelihood),
        };
        (report, calls)
    }

    fn classify_pooled(
        &self,
        site_major: &SiteMajor,
        n_sites: usize,
    ) -> (Vec<GenotypeCall>, Vec<SiteReport>, Option<MixtureModelState>) {
        let evidence: Vec<Vec<CellEvidence>> = (0..n_sites)
            .into_par_iter()
            .map(|site| site_major.evidence(site))
            .collect();
        let verdicts: Vec<Option<UnclassifiableReason>> =
            evidence.iter().map(|e| self.unclassifiable(e)).collect();

        let pooled_data: Vec<AlleleDepth> = evidence
            .iter()
            .zip(&verdicts)
            .filter(|(_, verdict)| verdict.is_none())
            .flat_map(|(e, _)| Self::informative(e))
            .collect();
        let fit = if pooled_data.is_empty() {
            None
        } else {
            Some(fit_mixture(&pooled_data, &self.config, self.deadline()))
        };
        if let Some(fit) = &fit {
            info!(
                "Pooled fit over {} observations: {:?}",
                pooled_data.len(),
                SiteStatus::from_fit(fit)
            );
        }

        let per_site: Vec<(SiteReport, Vec<GenotypeCall>)> = evidence
            .par_iter()
            .zip(verdicts.par_iter())
            .enumerate()
            .map(|(site, (cells, verdict))| {
                let site = site as u32;
                let informative_cells = cells.iter().filter(|e| e.depth() > 0).count();
                match (verdict, &fit) {
                    (None, Some(fit)) => (
                        SiteReport {
                            site,
                            informative_cells,
                            status: SiteStatus::from_fit(fit),
                            model: None,
                            log_likelihood: None,
                        },
                        self.calls_for(site, cells, &fit.state),
                    ),
                    (Some(reason), _) => (
                        SiteReport {
                            site,
                            informative_cells,
                            status: SiteStatus::Unclassifiable(*reason),
                            model: None,
                            log_likelihood: None,
                        },
                        Vec::new(),
                    ),
                    (None, None) => (
                        SiteReport {
                            site,
                            informative_cells,
                            status: SiteStatus::Unclassifiable(UnclassifiableReason::NoEvidence),
                            model: None,
                            log_likelihood: None,
                        },
                        Vec::new(),
                    ),
                }
            })
            .collect();

        let (sites, calls): (Vec<_>, Vec<_>) = per_site.into_iter().unzip();
        (
            calls.into_iter().flatten().collect(),
            sites,
            fit.map(|f| f.state),
        )
    }

    /// Calls for every cell with evidence at the site. Cells with only
    /// other-allele counts get a uniform posterior.
    fn calls_for(
        &self,
        site: u32,
        evidence: &[CellEvidence],
        state: &MixtureModelState,
    ) -> Vec<GenotypeCall> {
        let k = state.components();
        let data = Self::informative(evidence);
        let mut resp = Vec::with_capacity(data.len() * k);
        e_step(state, &data, &mut resp);

        let uniform: SmallVec<[f64; 4]> = SmallVec::from_elem(1.0 / k as f64, k);
        let mut informative_rows = resp.chunks(k);
        evidence
            .iter()
            .filter_map(|e| {
                let posteriors: SmallVec<[f64; 4]> = if e.depth() > 0 {
                    SmallVec::from_slice(informative_rows.next()?)
                } else if e.other > 0 {
                    uniform.clone()
                } else {
                    return None;
                };
                let (component, confidence) = posteriors.iter().copied().enumerate().fold(
                    (0, f64::NEG_INFINITY),
                    |best, (c, p)| if p > best.1 { (c, p) } else { best },
                );
                Some(GenotypeCall {
                    cell: e.cell,
                    site,
                    component,
                    class: self.classes[component],
                    posteriors,
                    confidence,
                })
            })
            .collect()
    }
}
