use statrs::function::gamma::ln_gamma;

/// Smallest overdispersion considered; below it the beta-binomial is treated as binomial.
pub const RHO_MIN: f64 = 1e-6;
/// Largest overdispersion the dispersion search may return.
pub const RHO_MAX: f64 = 0.5;

/// log C(n, k)
#[inline]
pub fn log_choose(k: u32, n: u32) -> f64 {
    let (k, n) = (k as f64, n as f64);
    ln_gamma(n + 1.0) - ln_gamma(k + 1.0) - ln_gamma(n - k + 1.0)
}

/// Log PMF of Binomial(n, p) at k, without the binomial coefficient.
#[inline]
pub fn log_binomial_kernel(k: u32, n: u32, p: f64) -> f64 {
    let (k, n) = (k as f64, n as f64);
    if p <= 0.0 {
        return if k == 0.0 { 0.0 } else { f64::NEG_INFINITY };
    }
    if p >= 1.0 {
        return if k == n { 0.0 } else { f64::NEG_INFINITY };
    }
    k * p.ln() + (n - k) * (1.0 - p).ln()
}

/// Log PMF of the beta-binomial with mean `p` and overdispersion `rho`, without
/// the binomial coefficient.
///
/// alpha = p (1/rho - 1), beta = (1 - p)(1/rho - 1)
pub fn log_beta_binomial_kernel(k: u32, n: u32, p: f64, rho: f64) -> f64 {
    if rho <= RHO_MIN || p <= 0.0 || p >= 1.0 {
        return log_binomial_kernel(k, n, p);
    }
    let (k, n) = (k as f64, n as f64);
    let m = 1.0 / rho - 1.0;
    let alpha = p * m;
    let beta = (1.0 - p) * m;

    let numer = ln_gamma(k + alpha) + ln_gamma(n - k + beta) - ln_gamma(n + m);
    let denom = ln_gamma(alpha) + ln_gamma(beta) - ln_gamma(m);
    numer - denom
}

/// Log-Sum-Exp trick for numerical stability
pub fn log_sum_exp(vals: &[f64]) -> f64 {
    if vals.is_empty() {
        return f64::NEG_INFINITY;
    }
    let max_val = vals.iter().fold(f64::NEG_INFINITY, |a, &b| a.max(b));
    if max_val == f64::NEG_INFINITY || max_val.is_nan() {
        return max_val;
    }
    let sum = vals.iter().map(|v| (v - max_val).exp()).sum::<f64>();
    max_val + sum.ln()
}

/// Maximize a unimodal `func` on [min_bound, max_bound] by golden-section search
/// around `current_val`.
pub fn optimize_param_gss<F>(current_val: f64, min_bound: f64, max_bound: f64, mut func: F) -> f64
where
    F: FnMut(f64) -> f64,
{
    let gr = (5.0_f64.sqrt() - 1.0) / 2.0;
    let width = (max_bound - min_bound) * 0.5;
    let mut a = (current_val - width).max(min_bound);
    let mut b = (current_val + width).min(max_bound);

    let mut c = b - gr * (b - a);
    let mut d = a + gr * (b - a);
    let mut fc = func(c);
    let mut fd = func(d);

    for _ in 0..30 {
        if fc > fd {
            b = d;
            d = c;
            fd = fc;
            c = b - gr * (b - a);
            fc = func(c);
        } else {
            a = c;
            c = d;
            fc = fd;
            d = a + gr * (b - a);
            fd = func(d);
        }
    }
    (a + b) / 2.0
}
