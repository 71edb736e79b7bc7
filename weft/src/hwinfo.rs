use std::thread;

/// Hardware topology snapshot, queried once at startup.
///
/// `num_cores` counts logical CPUs: `available_parallelism` already folds
/// SMT threads into the count, so there is no separate threads-per-core
/// factor to apply.
#[derive(Debug, Clone, Copy)]
pub struct HwInfo {
    pub num_cores: usize,
}

/// Number of workers to fall back to when detection fails.
const FALLBACK_THREADS: usize = 2;

impl HwInfo {
    pub fn detect() -> Self {
        match thread::available_parallelism() {
            Ok(n) => Self { num_cores: n.get() },
            Err(e) => {
                tracing::info!(
                    "failed to get number of cores ({e}), playing it safe with {FALLBACK_THREADS} threads"
                );
                Self {
                    num_cores: FALLBACK_THREADS,
                }
            }
        }
    }

    /// One worker per hardware thread.
    pub fn default_worker_threads(&self) -> usize {
        self.num_cores
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detect_reports_at_least_one_core() {
        let hw = HwInfo::detect();
        assert!(hw.num_cores >= 1);
        assert_eq!(hw.default_worker_threads(), hw.num_cores);
    }
}
