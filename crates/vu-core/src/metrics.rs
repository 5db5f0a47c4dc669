//! Process-level runner metrics, exported via the `prometheus` registry the
//! rest of the workspace already depends on for chain-state accounting.
//! `spec.md`'s ambient-components table calls for these independent of any
//! output backend (itself a stated non-goal): they're observable through
//! `RunnerMetrics::registry` regardless of whether anything ever scrapes it.

use prometheus::{Histogram, HistogramOpts, IntCounter, IntGauge, Registry};
use vu_types::RunnerError;

/// Counters and gauges describing the Runner's own activity: VUs minted,
/// iterations started/completed, interruptions, and iteration latency.
pub struct RunnerMetrics {
    pub registry: Registry,
    pub vus_active: IntGauge,
    pub iterations_started: IntCounter,
    pub iterations_completed: IntCounter,
    pub iterations_interrupted: IntCounter,
    pub iteration_duration_seconds: Histogram,
}

impl RunnerMetrics {
    pub fn new() -> Result<Self, RunnerError> {
        let registry = Registry::new();

        let vus_active = IntGauge::new("vu_runner_vus_active", "Number of VUs currently activated")
            .map_err(|e| RunnerError::Config(format!("metric registration failed: {e}")))?;
        let iterations_started = IntCounter::new("vu_runner_iterations_started_total", "Iterations started")
            .map_err(|e| RunnerError::Config(format!("metric registration failed: {e}")))?;
        let iterations_completed =
            IntCounter::new("vu_runner_iterations_completed_total", "Iterations completed without error")
                .map_err(|e| RunnerError::Config(format!("metric registration failed: {e}")))?;
        let iterations_interrupted =
            IntCounter::new("vu_runner_iterations_interrupted_total", "Iterations cut short by cancellation")
                .map_err(|e| RunnerError::Config(format!("metric registration failed: {e}")))?;
        let iteration_duration_seconds = Histogram::with_opts(HistogramOpts::new(
            "vu_runner_iteration_duration_seconds",
            "Wall-clock duration of a completed iteration",
        ))
        .map_err(|e| RunnerError::Config(format!("metric registration failed: {e}")))?;

        registry
            .register(Box::new(vus_active.clone()))
            .map_err(|e| RunnerError::Config(format!("metric registration failed: {e}")))?;
        registry
            .register(Box::new(iterations_started.clone()))
            .map_err(|e| RunnerError::Config(format!("metric registration failed: {e}")))?;
        registry
            .register(Box::new(iterations_completed.clone()))
            .map_err(|e| RunnerError::Config(format!("metric registration failed: {e}")))?;
        registry
            .register(Box::new(iterations_interrupted.clone()))
            .map_err(|e| RunnerError::Config(format!("metric registration failed: {e}")))?;
        registry
            .register(Box::new(iteration_duration_seconds.clone()))
            .map_err(|e| RunnerError::Config(format!("metric registration failed: {e}")))?;

        Ok(Self {
            registry,
            vus_active,
            iterations_started,
            iterations_completed,
            iterations_interrupted,
            iteration_duration_seconds,
        })
    }
}

impl Default for RunnerMetrics {
    fn default() -> Self {
        Self::new().expect("metric names are fixed and never collide")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metrics_register_without_name_collisions() {
        let metrics = RunnerMetrics::new().unwrap();
        assert!(!metrics.registry.gather().is_empty());
    }

    #[test]
    fn counters_increment() {
        let metrics = RunnerMetrics::new().unwrap();
        metrics.iterations_started.inc();
        metrics.iterations_completed.inc();
        assert_eq!(metrics.iterations_started.get(), 1);
        assert_eq!(metrics.iterations_completed.get(), 1);
    }
}
