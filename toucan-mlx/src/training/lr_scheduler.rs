//! Learning rate schedulers

use serde::{Deserialize, Serialize};

/// Trait for learning rate schedulers
pub trait LRScheduler {
    /// Get current learning rate
    fn get_lr(&self) -> f32;

    /// Step the scheduler (call after each optimization step)
    fn step(&mut self);

    /// Get current step number
    fn current_step(&self) -> usize;

    /// Reset scheduler to initial state
    fn reset(&mut self);
}

/// Warmup, plateau, then square-root decay.
///
/// The learning rate rises linearly to `peak_lr` over `warmup_steps`, stays at
/// the peak for `4 * warmup_steps`, and then decays with the square root of the
/// remaining progress through `max_steps`, never dropping below `min_lr`.
///
/// Two instances drive a ToucanTTS run: one for the backbone optimizer and one
/// for the `post_flow` optimizer (higher peak, shorter warmup).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToucanWarmupScheduler {
    /// Peak learning rate reached at the end of warmup
    peak_lr: f32,
    /// Number of warmup steps
    warmup_steps: usize,
    /// Number of steps held at the peak after warmup
    plateau_steps: usize,
    /// Total step budget, used to scale the decay
    max_steps: usize,
    /// Lower bound of the decay phase
    min_lr: f32,
    /// Current step
    current_step: usize,
}

impl ToucanWarmupScheduler {
    /// Create a new scheduler
    pub fn new(peak_lr: f32, warmup_steps: usize, max_steps: usize) -> Self {
        Self {
            peak_lr,
            warmup_steps,
            plateau_steps: warmup_steps * 4,
            max_steps,
            min_lr: 1e-7,
            current_step: 0,
        }
    }

    /// Set minimum learning rate
    pub fn with_min_lr(mut self, min_lr: f32) -> Self {
        self.min_lr = min_lr;
        self
    }

    /// Set current step (useful for resuming training)
    pub fn set_step(&mut self, step: usize) {
        self.current_step = step;
    }

    /// Peak learning rate
    pub fn peak_lr(&self) -> f32 {
        self.peak_lr
    }

    /// Number of warmup steps
    pub fn warmup_steps(&self) -> usize {
        self.warmup_steps
    }
}

impl LRScheduler for ToucanWarmupScheduler {
    fn get_lr(&self) -> f32 {
        // The rate applied by the next optimizer update is the one for step `current_step + 1`
        let step_num = self.current_step + 1;
        if step_num <= self.warmup_steps {
            // Linear warmup
            let warmup_ratio = step_num as f32 / self.warmup_steps as f32;
            self.peak_lr * warmup_ratio.min(1.0)
        } else if step_num < self.warmup_steps + self.plateau_steps {
            self.peak_lr
        } else {
            let decay_steps = step_num - (self.warmup_steps + self.plateau_steps);
            let progress = decay_steps as f32 / self.max_steps.max(1) as f32;
            (self.peak_lr * (1.0 - progress.sqrt())).max(self.min_lr)
        }
    }

    fn step(&mut self) {
        self.current_step += 1;
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

    #[test]
    fn test_warmup_is_linear() {
        let mut scheduler = ToucanWarmupScheduler::new(1e-3, 100, 10_000);

        // First update already uses a non-zero rate
        assert!((scheduler.get_lr() - 1e-5).abs() < 1e-9);

        for _ in 0..49 {
            scheduler.step();
        }
        assert!((scheduler.get_lr() - 5e-4).abs() < 1e-8);

        for _ in 0..50 {
            scheduler.step();
        }
        assert!((scheduler.get_lr() - 1e-3).abs() < 1e-8);
    }

    #[test]
    fn test_plateau_then_decay() {
        let mut scheduler = ToucanWarmupScheduler::new(1e-3, 10, 1000);

        // Plateau covers steps 11..50
        scheduler.set_step(30);
        assert!((scheduler.get_lr() - 1e-3).abs() < 1e-9);

        // Decay starts at step 50 with progress 0
        scheduler.set_step(49);
        assert!((scheduler.get_lr() - 1e-3).abs() < 1e-9);

        // Quarter of the budget into the decay: 1 - sqrt(0.25) = 0.5
        scheduler.set_step(49 + 250);
        assert!((scheduler.get_lr() - 5e-4).abs() < 1e-7);
    }

    #[test]
    fn test_decay_is_floored() {
        let mut scheduler = ToucanWarmupScheduler::new(1e-3, 10, 100);
        scheduler.set_step(10_000);
        assert!((scheduler.get_lr() - 1e-7).abs() < 1e-12);

        let mut scheduler = ToucanWarmupScheduler::new(1e-3, 10, 100).with_min_lr(1e-5);
        scheduler.set_step(10_000);
        assert!((scheduler.get_lr() - 1e-5).abs() < 1e-10);
    }

    #[test]
    fn test_state_roundtrips_through_json() {
        let mut scheduler = ToucanWarmupScheduler::new(8e-3, 25, 5000);
        for _ in 0..17 {
            scheduler.step();
        }
        let json = serde_json::to_string(&scheduler).unwrap();
        let restored: ToucanWarmupScheduler = serde_json::from_str(&json).unwrap();
        assert_eq!(restored, scheduler);
        assert_eq!(restored.current_step(), 17);
        assert_eq!(restored.get_lr(), scheduler.get_lr());
    }

    #[test]
    fn test_reset() {
        let mut scheduler = ToucanWarmupScheduler::new(1e-3, 4, 100);
        scheduler.step();
        scheduler.step();
        scheduler.reset();
        assert_eq!(scheduler.current_step(), 0);
        assert!((scheduler.get_lr() - 2.5e-4).abs() < 1e-9);
    }
}
