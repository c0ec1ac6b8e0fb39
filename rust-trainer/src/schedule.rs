use crate::config::DecayMode;

/// Number of full batches in one pass over `num_examples`.
pub fn steps_per_epoch(num_examples: usize, batch_size: usize) -> usize {
    num_examples / batch_size
}

/// `rate(step) = initial_rate * decay_rate ^ (step / decay_steps)`, without a floor.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ExponentialDecay {
    pub initial_rate: f64,
    pub decay_rate: f64,
    pub decay_steps: usize,
}

impl ExponentialDecay {
    pub fn rate(&self, step: usize) -> f64 {
        let exponent = step as f64 / self.decay_steps.max(1) as f64;
        self.initial_rate * self.decay_rate.powf(exponent)
    }
}

/// Learning-rate policy: `dc` per epoch, pre-raised to the number of steps in an
/// epoch so that one schedule index equals one epoch.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LrSchedule {
    pub mode: DecayMode,
    per_step: ExponentialDecay,
    per_epoch: ExponentialDecay,
}

impl LrSchedule {
    pub fn new(lr: f64, lr_decay: f64, steps_per_epoch: usize, mode: DecayMode) -> Self {
        let exponent = i32::try_from(steps_per_epoch).unwrap_or(i32::MAX);
        Self {
            mode,
            per_step: ExponentialDecay {
                initial_rate: lr,
                decay_rate: lr_decay,
                decay_steps: 1,
            },
            per_epoch: ExponentialDecay {
                initial_rate: lr,
                decay_rate: lr_decay.powi(exponent),
                decay_steps: 1,
            },
        }
    }

    /// Effective per-epoch decay factor, `dc ^ steps_per_epoch`.
    pub fn epoch_decay_rate(&self) -> f64 {
        self.per_epoch.decay_rate
    }

    /// Rate for a zero-based epoch index.
    pub fn rate_at_epoch(&self, epoch: usize) -> f64 {
        self.per_epoch.rate(epoch)
    }

    /// Rate for a zero-based global optimizer step.
    pub fn rate_at_step(&self, step: usize) -> f64 {
        self.per_step.rate(step)
    }

    /// Rate the optimizer should use for `step` inside `epoch`.
    pub fn rate(&self, epoch: usize, step: usize) -> f64 {
        match self.mode {
            DecayMode::Epoch => self.rate_at_epoch(epoch),
            DecayMode::Step => self.rate_at_step(step),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() <= 1e-12 * a.abs().max(b.abs()).max(1.0)
    }

    #[test]
    fn steps_per_epoch_floors() {
        assert_eq!(steps_per_epoch(60_000, 64), 937);
        assert_eq!(steps_per_epoch(50_000, 64), 781);
        assert_eq!(steps_per_epoch(10, 64), 0);
    }

    #[test]
    fn exponential_decay_matches_closed_form() {
        let decay = ExponentialDecay {
            initial_rate: 0.1,
            decay_rate: 0.5,
            decay_steps: 2,
        };
        assert!(close(decay.rate(0), 0.1));
        assert!(close(decay.rate(2), 0.05));
        assert!(close(decay.rate(1), 0.1 * 0.5f64.sqrt()));
    }

    #[test]
    fn schedule_starts_at_initial_rate() {
        let schedule = LrSchedule::new(1e-3, 0.999995, 937, DecayMode::Epoch);
        assert_eq!(schedule.rate_at_epoch(0), 1e-3);
        assert_eq!(schedule.rate_at_step(0), 1e-3);
        assert_eq!(schedule.rate(0, 0), 1e-3);
    }

    #[test]
    fn epoch_boundary_matches_literal_decay() {
        let (lr, dc, s) = (1e-3, 0.999995, 937);
        let schedule = LrSchedule::new(lr, dc, s, DecayMode::Step);
        assert!(close(schedule.rate_at_step(s), lr * dc.powi(s as i32)));
        assert!(close(schedule.rate_at_epoch(1), lr * dc.powi(s as i32)));
        for epoch in 0..10 {
            assert!(close(
                schedule.rate_at_epoch(epoch),
                schedule.rate_at_step(epoch * s)
            ));
        }
    }

    #[test]
    fn mode_selects_index() {
        let epoch_mode = LrSchedule::new(1.0, 0.5, 2, DecayMode::Epoch);
        assert!(close(epoch_mode.rate(1, 3), 0.25));
        let step_mode = LrSchedule::new(1.0, 0.5, 2, DecayMode::Step);
        assert!(close(step_mode.rate(1, 3), 0.125));
    }

    #[test]
    fn decays_monotonically_toward_zero() {
        let schedule = LrSchedule::new(1e-3, 0.99, 100, DecayMode::Epoch);
        let mut previous = f64::INFINITY;
        for epoch in 0..500 {
            let rate = schedule.rate_at_epoch(epoch);
            assert!(rate <= previous);
            assert!(rate >= 0.0);
            previous = rate;
        }
        assert!(previous < 1e-12);
    }

    #[test]
    fn unit_decay_keeps_rate_constant() {
        let schedule = LrSchedule::new(3e-4, 1.0, 937, DecayMode::Step);
        assert_eq!(schedule.rate_at_step(10_000), 3e-4);
    }
}
