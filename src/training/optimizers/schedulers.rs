//! Learning rate schedules
//!
//! Schedules produce a multiplicative factor applied to every parameter
//! group's base learning rate.

use super::Scheduler;

/// Linear warmup followed by cosine decay to a floor
#[derive(Debug, Clone)]
pub struct CosineScheduler {
    /// Warmup steps
    warmup_steps: usize,

    /// Total training steps
    total_steps: usize,

    /// Floor of the decay
    min_factor: f64,

    /// Current step
    current_step: usize,
}

impl CosineScheduler {
    /// Create a new cosine scheduler
    pub fn new(warmup_steps: usize, total_steps: usize, min_factor: f64) -> Self {
        Self {
            warmup_steps,
            total_steps,
            min_factor,
            current_step: 0,
        }
    }

    /// Factor at `step`
    pub fn factor_at(&self, step: usize) -> f64 {
        if step < self.warmup_steps {
            return step as f64 / self.warmup_steps.max(1) as f64;
        }
        let progress =
            (step - self.warmup_steps) as f64 / self.total_steps.saturating_sub(self.warmup_steps).max(1) as f64;
        let cosine = 0.5 * (1.0 + (std::f64::consts::PI * progress).cos());
        self.min_factor.max(self.min_factor + (1.0 - self.min_factor) * cosine)
    }
}

impl Scheduler for CosineScheduler {
    fn name(&self) -> &str {
        "cosine"
    }

    fn step(&mut self) {
        self.current_step += 1;
    }

    fn factor(&self) -> f64 {
        self.factor_at(self.current_step)
    }

    fn current_step(&self) -> usize {
        self.current_step
    }

    fn reset(&mut self) {
        self.current_step = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_cosine_scheduler() {
        let mut scheduler = CosineScheduler::new(10, 110, 0.1 / 3.0);

        assert_eq!(scheduler.factor(), 0.0);
        for _ in 0..5 {
            scheduler.step();
        }
        assert_relative_eq!(scheduler.factor(), 0.5);

        assert_relative_eq!(scheduler.factor_at(10), 1.0);
        // halfway through the decay
        let min = 0.1 / 3.0;
        assert_relative_eq!(scheduler.factor_at(60), min + (1.0 - min) * 0.5, epsilon = 1e-12);
        assert_relative_eq!(scheduler.factor_at(110), min, epsilon = 1e-12);

        scheduler.reset();
        assert_eq!(scheduler.current_step(), 0);
    }

    #[test]
    fn test_factor_never_below_floor() {
        let scheduler = CosineScheduler::new(0, 20, 0.25);
        for step in 0..40 {
            assert!(scheduler.factor_at(step) >= 0.25);
        }
    }
}
