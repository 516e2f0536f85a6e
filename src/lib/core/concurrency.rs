use crate::core::error::{Result, ScsnvError};
use log::{error, warn};

/// Build a dedicated Rayon pool with the validated thread count.
pub fn build_thread_pool(size: usize) -> Result<rayon::ThreadPool> {
    let cpus = determine_allowed_cpus(size)?;
    rayon::ThreadPoolBuilder::new()
        .num_threads(cpus)
        .thread_name(|idx| format!("scsnv-{}", idx))
        .build()
        .map_err(|e| ScsnvError::Config(format!("Failed to build thread pool: {}", e)))
}

/// Validate and normalize a requested CPU count.
pub fn determine_allowed_cpus(desired: usize) -> Result<usize> {
    if desired == 0 {
        error!("Must select > 0 threads");
        Err(ScsnvError::Config("Too few threads selected. Min 1".to_string()))
    } else if desired > num_cpus::get() {
        warn!(
            "Specified more threads ({}) than are available ({})",
            desired,
            num_cpus::get()
        );
        Ok(desired)
    } else {
        Ok(desired)
    }
}
