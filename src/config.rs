use std::time::Duration;

/// Configuration surface shared by [`crate::single::SinglePool`] and, per
/// sub-pool, by [`crate::keyed::KeyedPool`] (§6.3 of the design doc).
///
/// No builder: a plain struct with `Default` and struct-update syntax is
/// what this corpus reaches for on configs this size (see e.g. the
/// connection-pool configs among the reference examples); a generated
/// builder would just be ceremony around seven-odd fields.
#[derive(Debug, Clone, Copy)]
pub struct PoolConfig {
    /// Cap on the number of live entries. `None` = unbounded.
    pub max_total: Option<usize>,
    /// Cap on idle entries; excess is destroyed on return. `None` = unbounded.
    pub max_idle: Option<usize>,
    /// Floor maintained by the evictor. `0` disables it.
    pub min_idle: usize,
    /// `true`: borrow blocks up to `max_wait`. `false`: immediate
    /// [`crate::Error::PoolExhausted`].
    pub block_when_exhausted: bool,
    /// Deadline for a blocked borrow. `None` = indefinite.
    pub max_wait: Option<Duration>,
    /// `true`: head (most-recently-returned) reuse. `false`: tail
    /// (longest-idle) reuse.
    pub lifo: bool,
    pub test_on_borrow: bool,
    pub test_on_return: bool,
    pub test_while_idle: bool,
    /// Evictor sweep period. `None` or zero disables the evictor.
    pub time_between_eviction_runs: Option<Duration>,
    /// Positive: cap on entries sampled per sweep. Negative `-n`: sample
    /// `ceil(|idle| / n)`.
    pub num_tests_per_eviction_run: i64,
    /// Hard idle-age eviction threshold.
    pub min_evictable_idle_time: Option<Duration>,
    /// Soft idle-age threshold, honored only while `|idle| > min_idle`.
    /// Ignored when `min_evictable_idle_time` is set.
    pub soft_min_evictable_idle_time: Option<Duration>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        PoolConfig {
            max_total: Some(8),
            max_idle: Some(8),
            min_idle: 0,
            block_when_exhausted: true,
            max_wait: None,
            lifo: true,
            test_on_borrow: false,
            test_on_return: false,
            test_while_idle: false,
            time_between_eviction_runs: None,
            num_tests_per_eviction_run: 3,
            min_evictable_idle_time: Some(Duration::from_secs(30 * 60)),
            soft_min_evictable_idle_time: None,
        }
    }
}

impl PoolConfig {
    pub(crate) fn eviction_enabled(&self) -> bool {
        matches!(self.time_between_eviction_runs, Some(d) if !d.is_zero())
    }

    /// `ceil(idle_len / n)` for negative `numTestsPerEvictionRun`, or the
    /// plain cap for non-negative.
    pub(crate) fn tests_for_sweep(&self, idle_len: usize) -> usize {
        if self.num_tests_per_eviction_run >= 0 {
            (self.num_tests_per_eviction_run as usize).min(idle_len)
        } else {
            let n = self.num_tests_per_eviction_run.unsigned_abs() as usize;
            if n == 0 {
                idle_len
            } else {
                idle_len.div_ceil(n)
            }
        }
    }
}

/// Per-key configuration for [`crate::keyed::KeyedPool`]: a [`PoolConfig`]
/// (its `max_total` field is read as the *per-key* cap, `maxTotalPerKey`)
/// plus the keyed pool's own global cap.
#[derive(Debug, Clone, Copy)]
pub struct KeyedPoolConfig {
    /// Global cap across every key. `None` = unbounded.
    pub max_total: Option<usize>,
    /// Settings applied per sub-pool; `per_key.max_total` is read as
    /// `maxTotalPerKey`.
    pub per_key: PoolConfig,
}

impl Default for KeyedPoolConfig {
    fn default() -> Self {
        KeyedPoolConfig {
            max_total: Some(16),
            per_key: PoolConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tests_for_sweep_positive_is_capped() {
        let mut c = PoolConfig::default();
        c.num_tests_per_eviction_run = 3;
        assert_eq!(c.tests_for_sweep(10), 3);
        assert_eq!(c.tests_for_sweep(2), 2);
    }

    #[test]
    fn tests_for_sweep_negative_is_ceil_division() {
        let mut c = PoolConfig::default();
        c.num_tests_per_eviction_run = -3;
        assert_eq!(c.tests_for_sweep(10), 4);
    }
}
