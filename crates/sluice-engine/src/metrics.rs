//! Per-step metrics for stream engines.
//!
//! [`StepMetrics`] is returned from every `end_step` so applications
//! can watch how often the fast path is taken and what each step cost.

/// Timing and traffic for a single step.
///
/// All durations are in microseconds.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StepMetrics {
    /// Step the metrics describe.
    pub step: u64,
    /// Whether the step used the locked fast path.
    pub fast_path: bool,
    /// Time spent agreeing on and exchanging patterns.
    pub metadata_us: u64,
    /// Time spent moving payload bytes.
    pub transfer_us: u64,
    /// Wall-clock time from `begin_step` to the end of `end_step`.
    pub total_us: u64,
    /// Payload bytes pushed or exposed by this rank.
    pub bytes_sent: u64,
    /// Payload bytes received or fetched by this rank.
    pub bytes_received: u64,
    /// One-sided window fetches issued by this rank.
    pub window_fetches: u32,
    /// Layout conflicts detected (and repaired) during the step.
    pub layout_conflicts: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_metrics_are_zero() {
        let m = StepMetrics::default();
        assert_eq!(m.step, 0);
        assert!(!m.fast_path);
        assert_eq!(m.metadata_us, 0);
        assert_eq!(m.transfer_us, 0);
        assert_eq!(m.total_us, 0);
        assert_eq!(m.bytes_sent, 0);
        assert_eq!(m.bytes_received, 0);
        assert_eq!(m.window_fetches, 0);
        assert_eq!(m.layout_conflicts, 0);
    }
}
